//! AdSlotController - owns one ad slot's lifecycle.
//!
//! State machine:
//! - `Idle` → `Loading` via `load()`
//! - `Loading` → `Loaded` / `FailedToLoad` when the backend answers
//! - `FailedToLoad` → `Loading` via `load()` (no automatic retry)
//! - any state → `Destroyed` via `destroy()` (terminal)
//!
//! Backend results travel over an mpsc channel and are applied only when the
//! host calls [`AdSlotController::next_event`] or [`AdSlotController::drain_events`],
//! so every transition happens in the host's context. Each load bumps a
//! generation counter; results and ad events tagged with an older generation,
//! or arriving after destroy, are discarded and any late handle is released.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{AdBackend, AdHandle};
use crate::error::{LoadError, RefreshError, UsageError};
use crate::event::{AdEvent, AdEventSender, EventSink, SlotEvent, dispatch};
use crate::preload::PreloadedAd;
use crate::request::{AdSlotRequest, PlacementId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdSlotState {
    Idle,
    Loading,
    Loaded,
    FailedToLoad,
    Destroyed,
}

impl AdSlotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    pub fn can_load(&self) -> bool {
        matches!(self, Self::Idle | Self::FailedToLoad)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::FailedToLoad => "failed_to_load",
            Self::Destroyed => "destroyed",
        }
    }
}

/// What applying one marshaled event did to the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotUpdate {
    Loaded,
    FailedToLoad(LoadError),
    RefreshFailed(RefreshError),
    Event(AdEvent),
    /// Stale, late, or arrived after destroy.
    Discarded,
}

/// Returned by [`AdSlotController::adopt`] with the ad handed back.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct AdoptError {
    pub error: UsageError,
    pub ad: PreloadedAd,
}

pub struct AdSlotController {
    id: SlotId,
    backend: Arc<dyn AdBackend>,
    sink: Arc<dyn EventSink>,
    state: AdSlotState,
    handle: Option<AdHandle>,
    request: Option<AdSlotRequest>,
    container: Option<String>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<SlotEvent>,
    events_rx: mpsc::UnboundedReceiver<SlotEvent>,
}

impl AdSlotController {
    pub fn new(backend: Arc<dyn AdBackend>, sink: Arc<dyn EventSink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: SlotId::new(),
            backend,
            sink,
            state: AdSlotState::Idle,
            handle: None,
            request: None,
            container: None,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> AdSlotState {
        self.state
    }

    pub fn handle(&self) -> Option<&AdHandle> {
        self.handle.as_ref()
    }

    /// Request of the most recent load.
    pub fn request(&self) -> Option<&AdSlotRequest> {
        self.request.as_ref()
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Start loading an ad. Only valid in `Idle` or `FailedToLoad`.
    ///
    /// Must be called from within a tokio runtime; the backend call runs on a
    /// spawned task and its result is applied by `next_event`/`drain_events`.
    pub fn load(&mut self, request: AdSlotRequest) -> Result<(), UsageError> {
        self.check_can_load()?;

        self.generation += 1;
        let generation = self.generation;
        self.state = AdSlotState::Loading;
        self.request = Some(request.clone());

        tracing::debug!(
            slot = %self.id,
            unit_id = %request.unit_id(),
            generation,
            "Loading ad"
        );

        let backend = Arc::clone(&self.backend);
        let tx = self.events_tx.clone();
        let slot = self.id;
        tokio::spawn(async move {
            let result = backend.load_ad(request).await;
            let event = SlotEvent::LoadFinished { generation, result };
            if let Err(mpsc::error::SendError(SlotEvent::LoadFinished {
                result: Ok(handle),
                ..
            })) = tx.send(event)
            {
                tracing::debug!(slot = %slot, ad_id = %handle.id(), "Slot gone before load completed - releasing ad");
                backend.destroy(handle);
            }
        });

        Ok(())
    }

    /// Install an ad taken from a [`PreloadPool`](crate::PreloadPool), going
    /// straight to `Loaded`. On refusal the ad is handed back.
    pub fn adopt(&mut self, ad: PreloadedAd) -> Result<(), AdoptError> {
        if let Err(error) = self.check_can_load() {
            return Err(AdoptError { error, ad });
        }

        self.generation += 1;
        let handle = ad.into_handle();
        tracing::debug!(slot = %self.id, ad_id = %handle.id(), "Adopting preloaded ad");
        self.install(handle);
        Ok(())
    }

    /// Reassign the placement of the loaded ad before it is displayed.
    pub fn set_placement_id(&mut self, placement_id: impl Into<PlacementId>) -> Result<(), UsageError> {
        match self.handle.as_mut() {
            Some(handle) if self.state == AdSlotState::Loaded => {
                handle.set_placement_id(placement_id.into());
                Ok(())
            }
            _ => Err(UsageError::NotLoaded { state: self.state }),
        }
    }

    /// Record the host container the slot is displayed in.
    pub fn attach(&mut self, container: impl Into<String>) -> Result<(), UsageError> {
        if self.state.is_terminal() {
            return Err(UsageError::Destroyed);
        }
        let container = container.into();
        tracing::debug!(slot = %self.id, container = %container, "Slot attached");
        self.container = Some(container);
        Ok(())
    }

    pub fn detach(&mut self) -> Option<String> {
        let container = self.container.take();
        if let Some(ref c) = container {
            tracing::debug!(slot = %self.id, container = %c, "Slot detached");
        }
        container
    }

    /// Release the ad (if any) and enter `Destroyed`. Idempotent.
    pub fn destroy(&mut self) {
        if self.state.is_terminal() {
            tracing::trace!(slot = %self.id, "Slot already destroyed");
            return;
        }

        if let Some(handle) = self.handle.take() {
            tracing::debug!(slot = %self.id, ad_id = %handle.id(), "Releasing ad");
            self.backend.destroy(handle);
        }
        self.container = None;
        self.state = AdSlotState::Destroyed;
        self.close_events();

        tracing::debug!(slot = %self.id, "Slot destroyed");
    }

    /// Wait for the next backend event and apply it.
    ///
    /// Returns `Discarded` immediately once the slot is destroyed. Otherwise it
    /// waits until an event arrives, which never happens for an `Idle` slot or
    /// a `Loaded` ad that stays quiet; wrap it in `tokio::time::timeout` or a
    /// `select!` when that matters.
    pub async fn next_event(&mut self) -> SlotUpdate {
        match self.events_rx.recv().await {
            Some(event) => self.apply(event),
            None => SlotUpdate::Discarded,
        }
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn drain_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    fn check_can_load(&self) -> Result<(), UsageError> {
        let err = match self.state {
            AdSlotState::Idle | AdSlotState::FailedToLoad => return Ok(()),
            AdSlotState::Loading => UsageError::AlreadyLoading,
            AdSlotState::Loaded => UsageError::AlreadyLoaded,
            AdSlotState::Destroyed => UsageError::Destroyed,
        };
        tracing::warn!(slot = %self.id, state = self.state.as_str(), error = %err, "Ignoring request");
        Err(err)
    }

    fn install(&mut self, handle: AdHandle) {
        let events = AdEventSender::new(self.generation, self.events_tx.clone());
        self.backend.register_events(&handle, events);
        self.handle = Some(handle);
        self.state = AdSlotState::Loaded;
        self.sink.on_loaded();
    }

    fn apply(&mut self, event: SlotEvent) -> SlotUpdate {
        match event {
            SlotEvent::LoadFinished { generation, result } => {
                if self.state != AdSlotState::Loading || generation != self.generation {
                    tracing::debug!(
                        slot = %self.id,
                        generation,
                        state = self.state.as_str(),
                        "Discarding stale load result"
                    );
                    if let Ok(handle) = result {
                        self.backend.destroy(handle);
                    }
                    return SlotUpdate::Discarded;
                }

                match result {
                    Ok(handle) => {
                        tracing::info!(slot = %self.id, ad_id = %handle.id(), unit_id = %handle.unit_id(), "Ad loaded");
                        self.install(handle);
                        SlotUpdate::Loaded
                    }
                    Err(error) => {
                        tracing::warn!(slot = %self.id, code = %error.code, error = %error.message, "Ad failed to load");
                        self.handle = None;
                        self.state = AdSlotState::FailedToLoad;
                        self.sink.on_failed_to_load(&error);
                        SlotUpdate::FailedToLoad(LoadError(error))
                    }
                }
            }
            SlotEvent::Ad { generation, event } => {
                if self.state != AdSlotState::Loaded || generation != self.generation {
                    tracing::trace!(slot = %self.id, generation, ?event, "Discarding stale ad event");
                    return SlotUpdate::Discarded;
                }

                dispatch(&*self.sink, &event);
                match event {
                    AdEvent::FailedToRefresh(error) => {
                        tracing::warn!(slot = %self.id, code = %error.code, error = %error.message, "Ad failed to refresh");
                        SlotUpdate::RefreshFailed(RefreshError(error))
                    }
                    event => SlotUpdate::Event(event),
                }
            }
        }
    }

    // Late sends fail from here on, so load tasks release their own handles.
    fn close_events(&mut self) {
        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event);
        }
    }
}

impl Drop for AdSlotController {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            if self.handle.is_some() {
                tracing::warn!(slot = %self.id, "Slot dropped without destroy - releasing ad");
            }
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorDescriptor;
    use crate::event::{ChannelSink, SinkEvent};
    use crate::simulated::SimulatedBackend;
    use crate::size::AdSize;

    fn request() -> AdSlotRequest {
        AdSlotRequest::builder("banner-unit")
            .size(AdSize::BANNER)
            .build()
            .unwrap()
    }

    fn slot(
        backend: &Arc<SimulatedBackend>,
    ) -> (AdSlotController, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sink, events) = ChannelSink::new();
        let controller = AdSlotController::new(Arc::clone(backend) as Arc<dyn AdBackend>, Arc::new(sink));
        (controller, events)
    }

    async fn settle(controller: &mut AdSlotController) -> SlotUpdate {
        tokio::time::timeout(Duration::from_secs(1), controller.next_event())
            .await
            .expect("slot event")
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn load_success() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, mut events) = slot(&backend);
        assert_eq!(controller.state(), AdSlotState::Idle);

        controller.load(request()).unwrap();
        assert_eq!(controller.state(), AdSlotState::Loading);

        assert_eq!(settle(&mut controller).await, SlotUpdate::Loaded);
        assert_eq!(controller.state(), AdSlotState::Loaded);
        assert!(controller.handle().is_some());
        assert_eq!(events.try_recv().unwrap(), SinkEvent::Loaded);
    }

    #[tokio::test]
    async fn no_fill_moves_to_failed_to_load() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.push_failure(ErrorDescriptor::no_fill());
        let (mut controller, mut events) = slot(&backend);

        controller.load(request()).unwrap();
        assert_eq!(controller.state(), AdSlotState::Loading);

        let update = settle(&mut controller).await;
        assert_eq!(update, SlotUpdate::FailedToLoad(LoadError(ErrorDescriptor::no_fill())));
        assert_eq!(controller.state(), AdSlotState::FailedToLoad);
        assert!(controller.handle().is_none());

        match events.try_recv().unwrap() {
            SinkEvent::FailedToLoad(error) => assert_eq!(error.code, "NO_FILL"),
            other => panic!("unexpected event: {other:?}"),
        }
        // No automatic retry.
        assert_eq!(backend.load_calls(), 1);
    }

    #[tokio::test]
    async fn reload_after_failure() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.push_failure(ErrorDescriptor::no_fill());
        let (mut controller, _events) = slot(&backend);

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        assert_eq!(controller.state(), AdSlotState::FailedToLoad);

        controller.load(request()).unwrap();
        assert_eq!(settle(&mut controller).await, SlotUpdate::Loaded);
        assert_eq!(backend.load_calls(), 2);
    }

    #[tokio::test]
    async fn load_while_loading_is_a_usage_error() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.hold_loads();
        let (mut controller, _events) = slot(&backend);

        controller.load(request()).unwrap();
        assert_eq!(controller.load(request()), Err(UsageError::AlreadyLoading));
        assert_eq!(controller.state(), AdSlotState::Loading);

        wait_until(|| backend.load_calls() >= 1).await;
        backend.release_loads(1);
        assert_eq!(settle(&mut controller).await, SlotUpdate::Loaded);

        assert_eq!(backend.load_calls(), 1);
        assert_eq!(controller.drain_events(), 0);
    }

    #[tokio::test]
    async fn load_when_loaded_or_destroyed_is_rejected() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, _events) = slot(&backend);

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        assert_eq!(controller.load(request()), Err(UsageError::AlreadyLoaded));

        controller.destroy();
        assert_eq!(controller.load(request()), Err(UsageError::Destroyed));
        assert_eq!(controller.state(), AdSlotState::Destroyed);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, _events) = slot(&backend);

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        let ad_id = controller.handle().unwrap().id();

        controller.destroy();
        controller.destroy();
        controller.destroy();

        assert_eq!(controller.state(), AdSlotState::Destroyed);
        assert_eq!(backend.destroy_count(ad_id), 1);
        assert_eq!(backend.live_count(), 0);
    }

    #[tokio::test]
    async fn destroy_from_idle() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, _events) = slot(&backend);

        controller.destroy();
        assert_eq!(controller.state(), AdSlotState::Destroyed);
        assert!(backend.destroyed().is_empty());
    }

    #[tokio::test]
    async fn late_load_after_destroy_is_released_not_delivered() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.hold_loads();
        let (mut controller, mut events) = slot(&backend);

        controller.load(request()).unwrap();
        wait_until(|| backend.load_calls() >= 1).await;
        controller.destroy();

        backend.release_loads(1);
        wait_until(|| backend.destroyed().len() == 1).await;

        assert_eq!(controller.state(), AdSlotState::Destroyed);
        assert_eq!(backend.live_count(), 0);
        assert_eq!(settle(&mut controller).await, SlotUpdate::Discarded);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn queued_result_is_discarded_on_destroy() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, mut events) = slot(&backend);

        controller.load(request()).unwrap();
        // Result is queued but not yet applied when the host tears down.
        wait_until(|| backend.live_count() == 1).await;
        controller.destroy();
        wait_until(|| backend.live_count() == 0).await;

        assert_eq!(controller.state(), AdSlotState::Destroyed);
        assert_eq!(backend.destroyed().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn ad_events_are_forwarded_while_loaded() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, mut events) = slot(&backend);

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        let _ = events.try_recv();
        let ad_id = controller.handle().unwrap().id();

        assert!(backend.emit(ad_id, AdEvent::Impression));
        assert!(backend.emit(ad_id, AdEvent::Clicked));
        assert!(backend.emit(ad_id, AdEvent::Refreshed));

        assert_eq!(settle(&mut controller).await, SlotUpdate::Event(AdEvent::Impression));
        assert_eq!(controller.drain_events(), 2);

        assert_eq!(events.try_recv().unwrap(), SinkEvent::Ad(AdEvent::Impression));
        assert_eq!(events.try_recv().unwrap(), SinkEvent::Ad(AdEvent::Clicked));
        assert_eq!(events.try_recv().unwrap(), SinkEvent::Ad(AdEvent::Refreshed));
        assert_eq!(controller.state(), AdSlotState::Loaded);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_loaded_ad() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, mut events) = slot(&backend);

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        let _ = events.try_recv();
        let ad_id = controller.handle().unwrap().id();

        let error = ErrorDescriptor::new(ErrorDescriptor::NETWORK_ERROR, "refresh timed out");
        backend.emit(ad_id, AdEvent::FailedToRefresh(error.clone()));

        assert_eq!(
            settle(&mut controller).await,
            SlotUpdate::RefreshFailed(RefreshError(error.clone()))
        );
        assert_eq!(controller.state(), AdSlotState::Loaded);
        assert_eq!(controller.handle().unwrap().id(), ad_id);
        assert_eq!(
            events.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::FailedToRefresh(error))
        );
    }

    #[tokio::test]
    async fn events_after_destroy_are_dropped() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, mut events) = slot(&backend);

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        let _ = events.try_recv();
        let ad_id = controller.handle().unwrap().id();

        backend.emit(ad_id, AdEvent::Impression);
        controller.destroy();

        assert!(!backend.emit(ad_id, AdEvent::Clicked));
        assert_eq!(controller.drain_events(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_releases_held_ad() {
        let backend = Arc::new(SimulatedBackend::new());
        {
            let (mut controller, _events) = slot(&backend);
            controller.load(request()).unwrap();
            settle(&mut controller).await;
            assert_eq!(backend.live_count(), 1);
        }
        assert_eq!(backend.live_count(), 0);
    }

    #[tokio::test]
    async fn placement_id_requires_loaded_ad() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, _events) = slot(&backend);

        assert_eq!(
            controller.set_placement_id(2500718471),
            Err(UsageError::NotLoaded {
                state: AdSlotState::Idle
            })
        );

        controller.load(request()).unwrap();
        settle(&mut controller).await;
        controller.set_placement_id(2500718471).unwrap();
        assert_eq!(
            controller.handle().unwrap().placement_id(),
            Some(&PlacementId::Numeric(2500718471))
        );
    }

    #[tokio::test]
    async fn adopt_preloaded_ad() {
        use crate::preload::{PreloadConfig, PreloadPool};

        let backend = Arc::new(SimulatedBackend::new());
        let pool = PreloadPool::new(Arc::clone(&backend) as Arc<dyn AdBackend>);
        let unit_id = request().unit_id().clone();
        pool.start_preloading(unit_id.clone(), PreloadConfig::new(request()).with_capacity(1))
            .unwrap();
        wait_until(|| pool.is_ad_available(&unit_id)).await;

        let (mut controller, mut events) = slot(&backend);
        controller.adopt(pool.poll_ad(&unit_id).unwrap()).unwrap();
        assert_eq!(controller.state(), AdSlotState::Loaded);
        assert_eq!(events.try_recv().unwrap(), SinkEvent::Loaded);

        let ad_id = controller.handle().unwrap().id();
        backend.emit(ad_id, AdEvent::Clicked);
        assert_eq!(settle(&mut controller).await, SlotUpdate::Event(AdEvent::Clicked));

        // A loaded slot hands a second ad back untouched.
        wait_until(|| pool.is_ad_available(&unit_id)).await;
        let err = controller.adopt(pool.poll_ad(&unit_id).unwrap()).unwrap_err();
        assert_eq!(err.error, UsageError::AlreadyLoaded);
        assert_ne!(err.ad.handle().id(), ad_id);
    }

    #[tokio::test]
    async fn next_event_waits_while_idle_or_quiet() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, _events) = slot(&backend);

        let idle = tokio::time::timeout(Duration::from_millis(20), controller.next_event()).await;
        assert!(idle.is_err());

        controller.load(request()).unwrap();
        assert_eq!(settle(&mut controller).await, SlotUpdate::Loaded);
        let quiet = tokio::time::timeout(Duration::from_millis(20), controller.next_event()).await;
        assert!(quiet.is_err());
        assert_eq!(controller.state(), AdSlotState::Loaded);

        controller.destroy();
        assert_eq!(settle(&mut controller).await, SlotUpdate::Discarded);
    }

    #[tokio::test]
    async fn attach_and_detach() {
        let backend = Arc::new(SimulatedBackend::new());
        let (mut controller, _events) = slot(&backend);

        controller.attach("ad_view_container").unwrap();
        assert_eq!(controller.container(), Some("ad_view_container"));
        assert_eq!(controller.detach().as_deref(), Some("ad_view_container"));
        assert!(controller.container().is_none());

        controller.attach("ad_view_container").unwrap();
        controller.destroy();
        assert!(controller.container().is_none());
        assert_eq!(controller.attach("other"), Err(UsageError::Destroyed));
    }
}
