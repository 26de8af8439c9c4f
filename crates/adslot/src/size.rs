//! Ad sizes and host display metrics.

use serde::{Deserialize, Serialize};

use crate::error::ConstructionError;

/// Requested ad size. Adaptive sizes are resolved against a host width at
/// request build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdSize {
    Fixed { width: u32, height: u32 },
    /// Anchored adaptive banner. `width: None` means "use the host width".
    Adaptive {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
    },
}

impl AdSize {
    pub const BANNER: AdSize = AdSize::fixed(320, 50);
    pub const LARGE_BANNER: AdSize = AdSize::fixed(320, 100);
    pub const MEDIUM_RECTANGLE: AdSize = AdSize::fixed(300, 250);
    pub const FULL_BANNER: AdSize = AdSize::fixed(468, 60);
    pub const LEADERBOARD: AdSize = AdSize::fixed(728, 90);

    const ADAPTIVE_MIN_HEIGHT: u32 = 50;
    const ADAPTIVE_MAX_HEIGHT: u32 = 90;

    pub const fn fixed(width: u32, height: u32) -> Self {
        AdSize::Fixed { width, height }
    }

    /// Adaptive banner sized to whatever width the host reports.
    pub const fn adaptive() -> Self {
        AdSize::Adaptive { width: None }
    }

    /// Adaptive banner with an explicit logical width.
    pub const fn adaptive_with_width(width: u32) -> Self {
        AdSize::Adaptive { width: Some(width) }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, AdSize::Adaptive { .. })
    }

    /// Resolve into concrete dimensions.
    pub fn resolve(&self, host_width: Option<u32>) -> Result<ResolvedSize, ConstructionError> {
        match *self {
            AdSize::Fixed { width, height } => {
                if width == 0 || height == 0 {
                    return Err(ConstructionError::InvalidSize { width, height });
                }
                Ok(ResolvedSize {
                    width,
                    height,
                    adaptive: false,
                })
            }
            AdSize::Adaptive { width } => {
                let width = width
                    .or(host_width)
                    .ok_or(ConstructionError::MissingHostWidth)?;
                if width == 0 {
                    return Err(ConstructionError::InvalidSize { width, height: 0 });
                }
                Ok(ResolvedSize {
                    width,
                    height: Self::anchored_height(width),
                    adaptive: true,
                })
            }
        }
    }

    // Keeps the 320x50 aspect ratio, bounded to the anchored banner range.
    fn anchored_height(width: u32) -> u32 {
        let scaled = (u64::from(width) * 50 + 160) / 320;
        (scaled as u32).clamp(Self::ADAPTIVE_MIN_HEIGHT, Self::ADAPTIVE_MAX_HEIGHT)
    }
}

/// Concrete size carried by a built request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSize {
    pub width: u32,
    pub height: u32,
    pub adaptive: bool,
}

impl std::fmt::Display for ResolvedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Screen metrics supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostDisplay {
    pub width_pixels: u32,
    pub density: f32,
}

impl HostDisplay {
    pub fn new(width_pixels: u32, density: f32) -> Self {
        Self {
            width_pixels,
            density,
        }
    }

    /// Display width in density-independent units, or `None` for a bogus density.
    pub fn logical_width(&self) -> Option<u32> {
        if !self.density.is_finite() || self.density <= 0.0 {
            return None;
        }
        Some((self.width_pixels as f32 / self.density) as u32)
    }
}
