//! In-process ad backend with scripted outcomes.
//!
//! Loads succeed unless an outcome was queued with [`SimulatedBackend::push_outcome`].
//! Loads can be held at a gate so callers observe the in-flight window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::backend::{AdBackend, AdHandle, AdId, ResponseInfo};
use crate::error::ErrorDescriptor;
use crate::event::{AdEvent, AdEventSender};
use crate::lock::lock_or_recover;
use crate::request::{AdSlotRequest, AdUnitId};

#[derive(Default)]
pub struct SimulatedBackend {
    outcomes: Mutex<VecDeque<Result<(), ErrorDescriptor>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    latency: Duration,
    auto_dismiss: Option<Duration>,
    fail_show: AtomicBool,
    show_error: Mutex<Option<ErrorDescriptor>>,
    load_calls: AtomicUsize,
    live: DashMap<AdId, AdUnitId>,
    destroyed: Mutex<Vec<AdId>>,
    senders: DashMap<AdId, AdEventSender>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every load sleeps for `latency` before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shown ads dismiss themselves after `after`.
    pub fn with_auto_dismiss(mut self, after: Duration) -> Self {
        self.auto_dismiss = Some(after);
        self
    }

    /// Queue the outcome of a future load (FIFO).
    pub fn push_outcome(&self, outcome: Result<(), ErrorDescriptor>) {
        lock_or_recover(&self.outcomes, "simulated outcomes").push_back(outcome);
    }

    pub fn push_failure(&self, error: ErrorDescriptor) {
        self.push_outcome(Err(error));
    }

    /// Report show failures through a `FailedToShow` event.
    pub fn set_fail_show(&self, fail: bool) {
        self.fail_show.store(fail, Ordering::Release);
    }

    /// Make the next `show` call return `error` synchronously.
    pub fn push_show_error(&self, error: ErrorDescriptor) {
        *lock_or_recover(&self.show_error, "simulated show error") = Some(error);
    }

    /// Park subsequent loads until [`release_loads`](Self::release_loads) or
    /// [`open_loads`](Self::open_loads).
    pub fn hold_loads(&self) {
        lock_or_recover(&self.gate, "simulated gate")
            .get_or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Let `n` parked (or future) loads through.
    pub fn release_loads(&self, n: usize) {
        if let Some(sem) = lock_or_recover(&self.gate, "simulated gate").as_ref() {
            sem.add_permits(n);
        }
    }

    /// Remove the gate and let every parked load through.
    pub fn open_loads(&self) {
        if let Some(sem) = lock_or_recover(&self.gate, "simulated gate").take() {
            sem.close();
        }
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::Acquire)
    }

    /// Handles delivered and not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn destroyed(&self) -> Vec<AdId> {
        lock_or_recover(&self.destroyed, "simulated releases").clone()
    }

    pub fn destroy_count(&self, id: AdId) -> usize {
        self.destroyed().iter().filter(|d| **d == id).count()
    }

    /// Deliver an event for `id` as the ad network would. Returns `false` if
    /// nothing is registered for the ad or the receiver is gone.
    pub fn emit(&self, id: AdId, event: AdEvent) -> bool {
        match self.senders.get(&id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    async fn wait_at_gate(&self) {
        let gate = lock_or_recover(&self.gate, "simulated gate").clone();
        if let Some(sem) = gate {
            // Closed semaphore means the gate was opened.
            if let Ok(permit) = sem.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl AdBackend for SimulatedBackend {
    async fn load_ad(&self, request: AdSlotRequest) -> Result<AdHandle, ErrorDescriptor> {
        let call = self.load_calls.fetch_add(1, Ordering::AcqRel) + 1;
        self.wait_at_gate().await;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = lock_or_recover(&self.outcomes, "simulated outcomes")
            .pop_front()
            .unwrap_or(Ok(()));
        outcome?;

        let handle = AdHandle::new(
            &request,
            ResponseInfo {
                response_id: format!("sim-{call}"),
                adapter: "simulated".to_string(),
                loaded_at: Utc::now(),
            },
        );
        self.live.insert(handle.id(), request.unit_id().clone());
        tracing::trace!(unit_id = %request.unit_id(), ad_id = %handle.id(), "Simulated ad delivered");
        Ok(handle)
    }

    fn register_events(&self, handle: &AdHandle, events: AdEventSender) {
        self.senders.insert(handle.id(), events);
    }

    fn show(&self, handle: &AdHandle) -> Result<(), ErrorDescriptor> {
        let id = handle.id();
        if let Some(error) = lock_or_recover(&self.show_error, "simulated show error").take() {
            return Err(error);
        }
        if self.fail_show.load(Ordering::Acquire) {
            self.emit(
                id,
                AdEvent::FailedToShow(ErrorDescriptor::new(
                    ErrorDescriptor::INTERNAL_ERROR,
                    "Ad could not be shown",
                )),
            );
            return Ok(());
        }

        self.emit(id, AdEvent::Showed);
        self.emit(id, AdEvent::Impression);

        if let Some(after) = self.auto_dismiss
            && let Some(sender) = self.senders.get(&id).map(|s| s.clone())
        {
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = sender.send(AdEvent::Dismissed);
            });
        }
        Ok(())
    }

    fn destroy(&self, handle: AdHandle) {
        let id = handle.id();
        self.senders.remove(&id);
        self.live.remove(&id);
        lock_or_recover(&self.destroyed, "simulated releases").push(id);
    }
}
