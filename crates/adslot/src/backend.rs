//! Contract with the external ad-serving backend.
//!
//! The backend is a black box. This trait fixes only the shape of the calls
//! the slot layer makes; [`SimulatedBackend`](crate::SimulatedBackend) is an
//! in-process implementation for hosts and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorDescriptor;
use crate::event::AdEventSender;
use crate::request::{AdFormat, AdSlotRequest, AdUnitId, PlacementId};
use crate::size::ResolvedSize;

/// Backend-assigned ad identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AdId(Uuid);

impl AdId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AdId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AdId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata returned with a delivered ad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseInfo {
    pub response_id: String,
    pub adapter: String,
    pub loaded_at: DateTime<Utc>,
}

/// A delivered ad.
///
/// Deliberately not `Clone`: [`AdBackend::destroy`] consumes the handle, so
/// one handle can only be released once.
#[derive(Debug)]
pub struct AdHandle {
    id: AdId,
    unit_id: AdUnitId,
    format: AdFormat,
    size: Option<ResolvedSize>,
    placement_id: Option<PlacementId>,
    response_info: ResponseInfo,
}

impl AdHandle {
    pub fn new(request: &AdSlotRequest, response_info: ResponseInfo) -> Self {
        Self {
            id: AdId::new(),
            unit_id: request.unit_id().clone(),
            format: request.format(),
            size: request.primary_size(),
            placement_id: request.placement_id().cloned(),
            response_info,
        }
    }

    pub fn id(&self) -> AdId {
        self.id
    }

    pub fn unit_id(&self) -> &AdUnitId {
        &self.unit_id
    }

    pub fn format(&self) -> AdFormat {
        self.format
    }

    pub fn size(&self) -> Option<ResolvedSize> {
        self.size
    }

    pub fn placement_id(&self) -> Option<&PlacementId> {
        self.placement_id.as_ref()
    }

    /// Placement may be reassigned before the ad is displayed.
    pub fn set_placement_id(&mut self, placement_id: PlacementId) {
        self.placement_id = Some(placement_id);
    }

    pub fn response_info(&self) -> &ResponseInfo {
        &self.response_info
    }
}

/// Ad-serving backend.
#[async_trait]
pub trait AdBackend: Send + Sync {
    /// Fetch one ad. Errors are values, never panics.
    async fn load_ad(&self, request: AdSlotRequest) -> Result<AdHandle, ErrorDescriptor>;

    /// Route impression/click/refresh/paid/show events for `handle` to `events`.
    fn register_events(&self, handle: &AdHandle, events: AdEventSender);

    /// Present a full-screen ad. Outcome arrives as `Showed`/`FailedToShow` events.
    fn show(&self, handle: &AdHandle) -> Result<(), ErrorDescriptor>;

    /// Release backend resources held for `handle`.
    fn destroy(&self, handle: AdHandle);
}
