//! Full-screen presentation for interstitial, rewarded and app-open ads.
//!
//! Ads come from a [`PreloadPool`]. Only one ad per presenter is on screen at
//! a time; the presentation ends on `Dismissed` or `FailedToShow`, after which
//! the ad is released and the host's completion callback runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::backend::{AdBackend, AdId};
use crate::error::ErrorDescriptor;
use crate::event::{AdEventSender, EventSink, SlotEvent, dispatch};
use crate::preload::PreloadPool;
use crate::request::AdUnitId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowOutcome {
    Showing(AdId),
    AlreadyShowing,
    NotReady,
    FailedToShow(ErrorDescriptor),
}

pub struct FullScreenPresenter {
    unit_id: AdUnitId,
    pool: Arc<PreloadPool>,
    backend: Arc<dyn AdBackend>,
    sink: Arc<dyn EventSink>,
    showing: Arc<AtomicBool>,
}

impl FullScreenPresenter {
    pub fn new(
        unit_id: AdUnitId,
        pool: Arc<PreloadPool>,
        backend: Arc<dyn AdBackend>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            unit_id,
            pool,
            backend,
            sink,
            showing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unit_id(&self) -> &AdUnitId {
        &self.unit_id
    }

    pub fn is_showing(&self) -> bool {
        self.showing.load(Ordering::Acquire)
    }

    /// Show the next preloaded ad unless one is already on screen.
    ///
    /// `on_complete` runs exactly once: immediately when nothing is shown,
    /// otherwise when the presentation ends. Sink callbacks and `on_complete`
    /// for a started presentation run on a spawned task, not the caller's
    /// context. Must be called from within a tokio runtime.
    pub fn show_if_available<F>(&self, on_complete: F) -> ShowOutcome
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .showing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(unit_id = %self.unit_id, "Full screen ad is already showing");
            on_complete();
            return ShowOutcome::AlreadyShowing;
        }

        let Some(ad) = self.pool.poll_ad(&self.unit_id) else {
            self.showing.store(false, Ordering::Release);
            tracing::debug!(unit_id = %self.unit_id, "Full screen ad is not ready yet");
            on_complete();
            return ShowOutcome::NotReady;
        };

        let handle = ad.into_handle();
        let ad_id = handle.id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.backend
            .register_events(&handle, AdEventSender::new(0, tx));

        if let Err(error) = self.backend.show(&handle) {
            tracing::warn!(unit_id = %self.unit_id, ad_id = %ad_id, code = %error.code, error = %error.message, "Full screen ad failed to show");
            self.backend.destroy(handle);
            self.showing.store(false, Ordering::Release);
            self.sink.on_failed_to_show(&error);
            on_complete();
            return ShowOutcome::FailedToShow(error);
        }

        tracing::debug!(unit_id = %self.unit_id, ad_id = %ad_id, "Showing full screen ad");

        let backend = Arc::clone(&self.backend);
        let sink = Arc::clone(&self.sink);
        let showing = Arc::clone(&self.showing);
        let unit_id = self.unit_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let SlotEvent::Ad { event, .. } = event else {
                    continue;
                };
                dispatch(&*sink, &event);
                if event.is_presentation_end() {
                    break;
                }
            }

            tracing::debug!(unit_id = %unit_id, ad_id = %ad_id, "Full screen presentation finished");
            backend.destroy(handle);
            showing.store(false, Ordering::Release);
            on_complete();
        });

        ShowOutcome::Showing(ad_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::event::{AdEvent, ChannelSink, RewardItem, SinkEvent};
    use crate::preload::PreloadConfig;
    use crate::request::{AdFormat, AdSlotRequest};
    use crate::simulated::SimulatedBackend;

    struct Fixture {
        backend: Arc<SimulatedBackend>,
        presenter: FullScreenPresenter,
        events: mpsc::UnboundedReceiver<SinkEvent>,
    }

    async fn fixture(preload: bool) -> Fixture {
        let backend = Arc::new(SimulatedBackend::new());
        if !preload {
            backend.hold_loads();
        }
        let pool = Arc::new(PreloadPool::new(Arc::clone(&backend) as Arc<dyn AdBackend>));
        let unit_id = AdUnitId::new("app-open").unwrap();
        let request = AdSlotRequest::builder("app-open")
            .format(AdFormat::AppOpen)
            .build()
            .unwrap();
        pool.start_preloading(unit_id.clone(), PreloadConfig::new(request).with_capacity(1))
            .unwrap();

        if preload {
            for _ in 0..200 {
                if pool.is_ad_available(&unit_id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(pool.is_ad_available(&unit_id));
        }

        let (sink, events) = ChannelSink::new();
        let presenter = FullScreenPresenter::new(
            unit_id,
            pool,
            Arc::clone(&backend) as Arc<dyn AdBackend>,
            Arc::new(sink),
        );
        Fixture {
            backend,
            presenter,
            events,
        }
    }

    fn completion() -> (impl FnOnce() + Send + 'static, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            move || {
                let _ = tx.send(());
            },
            rx,
        )
    }

    #[tokio::test]
    async fn not_ready_completes_immediately() {
        let fixture = fixture(false).await;
        let (done, mut rx) = completion();

        assert_eq!(fixture.presenter.show_if_available(done), ShowOutcome::NotReady);
        assert!(rx.try_recv().is_ok());
        assert!(!fixture.presenter.is_showing());
    }

    #[tokio::test]
    async fn show_then_dismiss() {
        let mut fixture = fixture(true).await;
        let (done, rx) = completion();

        let ShowOutcome::Showing(ad_id) = fixture.presenter.show_if_available(done) else {
            panic!("expected ad to show");
        };
        assert!(fixture.presenter.is_showing());

        // A second request while on screen is refused and completes at once.
        let (again, mut again_rx) = completion();
        assert_eq!(
            fixture.presenter.show_if_available(again),
            ShowOutcome::AlreadyShowing
        );
        assert!(again_rx.try_recv().is_ok());

        assert!(fixture.backend.emit(
            ad_id,
            AdEvent::RewardEarned(RewardItem {
                amount: 1,
                reward_type: "coins".to_string(),
            })
        ));
        assert!(fixture.backend.emit(ad_id, AdEvent::Dismissed));

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!fixture.presenter.is_showing());
        assert_eq!(fixture.backend.destroy_count(ad_id), 1);

        assert_eq!(fixture.events.try_recv().unwrap(), SinkEvent::Ad(AdEvent::Showed));
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::Impression)
        );
        assert!(matches!(
            fixture.events.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::RewardEarned(_))
        ));
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::Dismissed)
        );
    }

    #[tokio::test]
    async fn synchronous_show_error_releases_ad() {
        let mut fixture = fixture(true).await;
        let error = ErrorDescriptor::new(ErrorDescriptor::INTERNAL_ERROR, "no activity");
        fixture.backend.push_show_error(error.clone());
        let (done, mut rx) = completion();

        assert_eq!(
            fixture.presenter.show_if_available(done),
            ShowOutcome::FailedToShow(error.clone())
        );
        assert!(rx.try_recv().is_ok());
        assert!(!fixture.presenter.is_showing());

        let released = fixture.backend.destroyed();
        assert_eq!(released.len(), 1);
        assert_eq!(fixture.backend.destroy_count(released[0]), 1);
        assert_eq!(
            fixture.events.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::FailedToShow(error))
        );
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_to_show_ends_presentation() {
        let mut fixture = fixture(true).await;
        fixture.backend.set_fail_show(true);
        let (done, rx) = completion();

        let ShowOutcome::Showing(ad_id) = fixture.presenter.show_if_available(done) else {
            panic!("expected show attempt");
        };

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!fixture.presenter.is_showing());
        assert_eq!(fixture.backend.destroy_count(ad_id), 1);
        assert!(matches!(
            fixture.events.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::FailedToShow(_))
        ));
    }
}
