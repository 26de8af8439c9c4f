//! Slot configuration.
//!
//! Configuration is plain data: unit id, format, sizes, placement, targeting
//! and pool capacity. It can be parsed from JSON or read from `ADSLOT_*`
//! environment variables; nothing is process-global.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConstructionError};
use crate::preload::PreloadConfig;
use crate::request::{AdFormat, AdSlotRequest, PlacementId};
use crate::size::AdSize;

pub const DEFAULT_POOL_CAPACITY: usize = 2;

const ENV_UNIT_ID: &str = "ADSLOT_UNIT_ID";
const ENV_FORMAT: &str = "ADSLOT_FORMAT";
const ENV_PLACEMENT_ID: &str = "ADSLOT_PLACEMENT_ID";
const ENV_POOL_CAPACITY: &str = "ADSLOT_POOL_CAPACITY";

fn default_pool_capacity() -> usize {
    std::env::var(ENV_POOL_CAPACITY)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub unit_id: String,

    #[serde(default)]
    pub format: AdFormat,

    /// Ignored for full-screen formats.
    #[serde(default)]
    pub sizes: Vec<AdSize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_id: Option<PlacementId>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targeting: BTreeMap<String, String>,

    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl SlotConfig {
    pub fn new(unit_id: impl Into<String>, format: AdFormat) -> Self {
        Self {
            unit_id: unit_id.into(),
            format,
            sizes: Vec::new(),
            placement_id: None,
            targeting: BTreeMap::new(),
            pool_capacity: default_pool_capacity(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read `ADSLOT_UNIT_ID`, `ADSLOT_FORMAT`, `ADSLOT_PLACEMENT_ID` and
    /// `ADSLOT_POOL_CAPACITY`. Banner configs get the adaptive size.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let unit_id = lookup(ENV_UNIT_ID).ok_or(ConstructionError::EmptyUnitId)?;

        let format = match lookup(ENV_FORMAT) {
            Some(value) => serde_json::from_value(serde_json::Value::String(value.clone()))
                .map_err(|_| ConfigError::InvalidEnv {
                    key: ENV_FORMAT,
                    value,
                })?,
            None => AdFormat::Banner,
        };

        let mut config = Self::new(unit_id, format);
        if format.requires_size() {
            config.sizes.push(AdSize::adaptive());
        }

        config.placement_id = lookup(ENV_PLACEMENT_ID).map(|value| match value.parse::<i64>() {
            Ok(n) => PlacementId::Numeric(n),
            Err(_) => PlacementId::Named(value),
        });

        if let Some(value) = lookup(ENV_POOL_CAPACITY) {
            config.pool_capacity = match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: ENV_POOL_CAPACITY,
                        value,
                    });
                }
            };
        }

        Ok(config)
    }

    /// Build the request, resolving adaptive sizes against `host_width`.
    pub fn request(&self, host_width: Option<u32>) -> Result<AdSlotRequest, ConfigError> {
        let mut builder = AdSlotRequest::builder(self.unit_id.clone()).format(self.format);
        if self.format.requires_size() {
            builder = builder.sizes(self.sizes.iter().copied());
        }
        if let Some(width) = host_width {
            builder = builder.host_width(width);
        }
        if let Some(placement_id) = self.placement_id.clone() {
            builder = builder.placement_id(placement_id);
        }
        for (key, value) in &self.targeting {
            builder = builder.targeting(key.clone(), value.clone());
        }
        Ok(builder.build()?)
    }

    pub fn preload_config(&self, host_width: Option<u32>) -> Result<PreloadConfig, ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(PreloadConfig::new(self.request(host_width)?).with_capacity(self.pool_capacity))
    }
}
