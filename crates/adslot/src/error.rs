//! Error taxonomy for the slot layer.
//!
//! Backend failures never cross the async boundary as panics or `Err` from a
//! spawned task; they arrive as [`ErrorDescriptor`] values and are wrapped in
//! [`LoadError`] or [`RefreshError`] when surfaced to the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::AdSlotState;
use crate::request::AdUnitId;

/// Backend error code + message, as reported by the ad service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: String,
    pub message: String,
}

impl ErrorDescriptor {
    pub const NO_FILL: &'static str = "NO_FILL";
    pub const NETWORK_ERROR: &'static str = "NETWORK_ERROR";
    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn no_fill() -> Self {
        Self::new(Self::NO_FILL, "No ad to show")
    }
}

impl std::fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Invalid request parameters. Fatal to the build call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstructionError {
    #[error("ad unit id must not be empty")]
    EmptyUnitId,

    #[error("{format} requests need at least one ad size")]
    MissingSize { format: &'static str },

    #[error("invalid ad size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("adaptive size requires a host width")]
    MissingHostWidth,
}

/// Backend rejected or failed a load. Recoverable, never retried implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ad failed to load: {0}")]
pub struct LoadError(pub ErrorDescriptor);

/// Backend refresh failed. The previously loaded ad stays displayable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ad failed to refresh: {0}")]
pub struct RefreshError(pub ErrorDescriptor);

/// Operation invoked in a state that does not allow it. Reported, then ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("load ignored: slot is already loading")]
    AlreadyLoading,

    #[error("load ignored: slot already holds a loaded ad")]
    AlreadyLoaded,

    #[error("slot has been destroyed")]
    Destroyed,

    #[error("no ad loaded (slot is {state:?})")]
    NotLoaded { state: AdSlotState },
}

/// Configuration could not be read or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("pool capacity must be positive")]
    ZeroCapacity,

    #[error("preload request targets {actual}, expected {expected}")]
    UnitMismatch {
        expected: AdUnitId,
        actual: AdUnitId,
    },

    #[error(transparent)]
    Construction(#[from] ConstructionError),
}
