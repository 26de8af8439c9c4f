//! adslot: ad slot lifecycle management over an opaque ad-serving backend.

mod backend;
mod config;
mod controller;
mod error;
mod event;
mod lock;
mod presenter;
mod preload;
mod request;
mod simulated;
mod size;

pub use backend::{AdBackend, AdHandle, AdId, ResponseInfo};
pub use config::{DEFAULT_POOL_CAPACITY, SlotConfig};
pub use controller::{AdSlotController, AdSlotState, AdoptError, SlotId, SlotUpdate};
pub use error::{
    ConfigError, ConstructionError, ErrorDescriptor, LoadError, RefreshError, UsageError,
};
pub use event::{
    AdEvent, AdEventSender, AdValue, ChannelSink, EventChannelClosed, EventSink, RewardItem,
    SinkEvent, TracingSink,
};
pub use presenter::{FullScreenPresenter, ShowOutcome};
pub use preload::{PreloadConfig, PreloadListener, PreloadPool, PreloadStats, PreloadedAd};
pub use request::{AdFormat, AdSlotRequest, AdSlotRequestBuilder, AdUnitId, PlacementId};
pub use simulated::SimulatedBackend;
pub use size::{AdSize, HostDisplay, ResolvedSize};
