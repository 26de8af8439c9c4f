//! Ad slot request descriptor and its builder.
//!
//! A built [`AdSlotRequest`] is immutable: adaptive sizes are resolved against
//! the host width inside [`AdSlotRequestBuilder::build`], never later.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConstructionError;
use crate::size::{AdSize, HostDisplay, ResolvedSize};

/// Backend identifier of a configured ad slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AdUnitId(String);

impl AdUnitId {
    /// Fails on an empty (or all-whitespace) id.
    pub fn new(id: impl Into<String>) -> Result<Self, ConstructionError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ConstructionError::EmptyUnitId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AdUnitId {
    type Error = ConstructionError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<AdUnitId> for String {
    fn from(id: AdUnitId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AdUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reporting placement, either numeric or named.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlacementId {
    Numeric(i64),
    Named(String),
}

impl std::fmt::Display for PlacementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementId::Numeric(n) => write!(f, "{n}"),
            PlacementId::Named(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PlacementId {
    fn from(id: i64) -> Self {
        PlacementId::Numeric(id)
    }
}

impl From<&str> for PlacementId {
    fn from(id: &str) -> Self {
        PlacementId::Named(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdFormat {
    #[default]
    Banner,
    Interstitial,
    Rewarded,
    RewardedInterstitial,
    AppOpen,
    Native,
}

impl AdFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Banner => "banner",
            Self::Interstitial => "interstitial",
            Self::Rewarded => "rewarded",
            Self::RewardedInterstitial => "rewarded_interstitial",
            Self::AppOpen => "app_open",
            Self::Native => "native",
        }
    }

    /// Only banners are laid out into a host-sized container.
    pub fn requires_size(&self) -> bool {
        matches!(self, Self::Banner)
    }

    pub fn is_full_screen(&self) -> bool {
        matches!(
            self,
            Self::Interstitial | Self::Rewarded | Self::RewardedInterstitial | Self::AppOpen
        )
    }
}

/// Immutable load request for one ad slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdSlotRequest {
    unit_id: AdUnitId,
    format: AdFormat,
    sizes: Vec<ResolvedSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    placement_id: Option<PlacementId>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    targeting: BTreeMap<String, String>,
}

impl AdSlotRequest {
    pub fn builder(unit_id: impl Into<String>) -> AdSlotRequestBuilder {
        AdSlotRequestBuilder::new(unit_id)
    }

    pub fn unit_id(&self) -> &AdUnitId {
        &self.unit_id
    }

    pub fn format(&self) -> AdFormat {
        self.format
    }

    pub fn sizes(&self) -> &[ResolvedSize] {
        &self.sizes
    }

    /// First (preferred) size, if any.
    pub fn primary_size(&self) -> Option<ResolvedSize> {
        self.sizes.first().copied()
    }

    pub fn placement_id(&self) -> Option<&PlacementId> {
        self.placement_id.as_ref()
    }

    pub fn targeting(&self) -> &BTreeMap<String, String> {
        &self.targeting
    }
}

/// Collects request parameters; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct AdSlotRequestBuilder {
    unit_id: String,
    format: AdFormat,
    sizes: Vec<AdSize>,
    placement_id: Option<PlacementId>,
    targeting: BTreeMap<String, String>,
    host_width: Option<u32>,
}

impl AdSlotRequestBuilder {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            format: AdFormat::default(),
            sizes: Vec::new(),
            placement_id: None,
            targeting: BTreeMap::new(),
            host_width: None,
        }
    }

    pub fn format(mut self, format: AdFormat) -> Self {
        self.format = format;
        self
    }

    pub fn size(mut self, size: AdSize) -> Self {
        self.sizes.push(size);
        self
    }

    pub fn sizes(mut self, sizes: impl IntoIterator<Item = AdSize>) -> Self {
        self.sizes.extend(sizes);
        self
    }

    pub fn placement_id(mut self, placement_id: impl Into<PlacementId>) -> Self {
        self.placement_id = Some(placement_id.into());
        self
    }

    pub fn targeting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.targeting.insert(key.into(), value.into());
        self
    }

    /// Logical host width used to resolve adaptive sizes.
    pub fn host_width(mut self, width: u32) -> Self {
        self.host_width = Some(width);
        self
    }

    /// Convenience for hosts that only know pixel metrics.
    pub fn host_display(mut self, display: HostDisplay) -> Self {
        self.host_width = display.logical_width();
        self
    }

    pub fn build(self) -> Result<AdSlotRequest, ConstructionError> {
        let unit_id = AdUnitId::new(self.unit_id)?;

        if self.format.requires_size() && self.sizes.is_empty() {
            return Err(ConstructionError::MissingSize {
                format: self.format.as_str(),
            });
        }

        let sizes = self
            .sizes
            .iter()
            .map(|size| size.resolve(self.host_width))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AdSlotRequest {
            unit_id,
            format: self.format,
            sizes,
            placement_id: self.placement_id,
            targeting: self.targeting,
        })
    }
}
