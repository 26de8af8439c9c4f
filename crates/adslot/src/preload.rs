//! Preload pool - bounded per-unit FIFO of ready ads.
//!
//! Invariants per unit id:
//! - `queue.len() <= capacity`
//! - at most one refill task in flight; a refill loads one ad at a time until
//!   the queue is full, and ends on the first failure
//!
//! Each entry's queue sits behind its own mutex, so polls and refill
//! completions for a unit serialize on it. The mutex is never held across an
//! await. `stop_preloading` cancels the entry's token; a refill that completes
//! afterwards releases its ad instead of queueing it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{AdBackend, AdHandle};
use crate::config::DEFAULT_POOL_CAPACITY;
use crate::error::{ConfigError, ErrorDescriptor};
use crate::event::TracingSink;
use crate::lock::lock_or_recover;
use crate::request::{AdSlotRequest, AdUnitId};

/// An ad taken out of (or waiting in) the pool.
#[derive(Debug)]
pub struct PreloadedAd {
    handle: AdHandle,
    preloaded_at: Instant,
}

impl PreloadedAd {
    fn new(handle: AdHandle) -> Self {
        Self {
            handle,
            preloaded_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> &AdHandle {
        &self.handle
    }

    pub fn unit_id(&self) -> &AdUnitId {
        self.handle.unit_id()
    }

    /// Time spent waiting in the pool.
    pub fn age(&self) -> Duration {
        self.preloaded_at.elapsed()
    }

    pub fn into_handle(self) -> AdHandle {
        self.handle
    }
}

/// Observer for background preload activity.
pub trait PreloadListener: Send + Sync {
    fn on_ad_preloaded(&self, _unit_id: &AdUnitId) {}
    fn on_ad_failed_to_preload(&self, _unit_id: &AdUnitId, _error: &ErrorDescriptor) {}
    /// A poll emptied the queue.
    fn on_ads_exhausted(&self, _unit_id: &AdUnitId) {}
}

impl PreloadListener for TracingSink {
    fn on_ad_preloaded(&self, unit_id: &AdUnitId) {
        tracing::info!(unit_id = %unit_id, "Ad preloaded");
    }

    fn on_ad_failed_to_preload(&self, unit_id: &AdUnitId, error: &ErrorDescriptor) {
        tracing::warn!(unit_id = %unit_id, code = %error.code, error = %error.message, "Ad failed to preload");
    }

    fn on_ads_exhausted(&self, unit_id: &AdUnitId) {
        tracing::info!(unit_id = %unit_id, "Preloaded ads exhausted");
    }
}

#[derive(Debug, Clone)]
pub struct PreloadConfig {
    pub request: AdSlotRequest,
    pub capacity: usize,
}

impl PreloadConfig {
    pub fn new(request: AdSlotRequest) -> Self {
        Self {
            request,
            capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Point-in-time view of one unit's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreloadStats {
    pub unit_id: AdUnitId,
    pub queued: usize,
    pub capacity: usize,
    pub refilling: bool,
    pub refills_started: u64,
    pub refill_failures: u64,
}

struct PreloadEntry {
    config: PreloadConfig,
    queue: VecDeque<PreloadedAd>,
    refilling: bool,
    refills_started: u64,
    refill_failures: u64,
    cancel: CancellationToken,
}

type SharedEntry = Arc<Mutex<PreloadEntry>>;

fn lock_entry(entry: &Mutex<PreloadEntry>) -> MutexGuard<'_, PreloadEntry> {
    lock_or_recover(entry, "preload entry")
}

pub struct PreloadPool {
    backend: Arc<dyn AdBackend>,
    entries: DashMap<AdUnitId, SharedEntry>,
    listener: Option<Arc<dyn PreloadListener>>,
}

impl PreloadPool {
    pub fn new(backend: Arc<dyn AdBackend>) -> Self {
        Self {
            backend,
            entries: DashMap::new(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn PreloadListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Start (or reconfigure) preloading for `unit_id`.
    ///
    /// The request in `config` must target `unit_id`.
    /// Calling again while active swaps the configuration and keeps the queue.
    /// If capacity shrinks below the queue length the newest ads are released.
    /// Must be called from within a tokio runtime.
    pub fn start_preloading(
        &self,
        unit_id: AdUnitId,
        config: PreloadConfig,
    ) -> Result<(), ConfigError> {
        if config.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if config.request.unit_id() != &unit_id {
            return Err(ConfigError::UnitMismatch {
                expected: unit_id,
                actual: config.request.unit_id().clone(),
            });
        }

        let shared = match self.entries.entry(unit_id.clone()) {
            Entry::Occupied(occupied) => {
                let shared = Arc::clone(occupied.get());
                drop(occupied);

                let excess = {
                    let mut entry = lock_entry(&shared);
                    entry.config = config;
                    let keep = entry.config.capacity;
                    if entry.queue.len() > keep {
                        entry.queue.split_off(keep)
                    } else {
                        VecDeque::new()
                    }
                };
                if !excess.is_empty() {
                    tracing::debug!(unit_id = %unit_id, released = excess.len(), "Capacity reduced - releasing excess ads");
                }
                for ad in excess {
                    self.backend.destroy(ad.into_handle());
                }
                tracing::debug!(unit_id = %unit_id, "Preload configuration updated");
                shared
            }
            Entry::Vacant(vacant) => {
                tracing::info!(unit_id = %unit_id, capacity = config.capacity, "Starting preload");
                let shared = Arc::new(Mutex::new(PreloadEntry {
                    config,
                    queue: VecDeque::new(),
                    refilling: false,
                    refills_started: 0,
                    refill_failures: 0,
                    cancel: CancellationToken::new(),
                }));
                vacant.insert(Arc::clone(&shared));
                shared
            }
        };

        self.maybe_refill(&unit_id, &shared);
        Ok(())
    }

    /// Take the oldest ready ad, or `None` if nothing is queued.
    ///
    /// Any poll that leaves the queue below capacity starts a refill unless
    /// one is already running.
    pub fn poll_ad(&self, unit_id: &AdUnitId) -> Option<PreloadedAd> {
        let shared = self.entry(unit_id)?;

        let (ad, exhausted) = {
            let mut entry = lock_entry(&shared);
            let ad = entry.queue.pop_front();
            let exhausted = ad.is_some() && entry.queue.is_empty();
            (ad, exhausted)
        };

        match &ad {
            Some(ad) => {
                tracing::debug!(unit_id = %unit_id, ad_id = %ad.handle().id(), "Polled preloaded ad");
                if exhausted && let Some(listener) = &self.listener {
                    listener.on_ads_exhausted(unit_id);
                }
            }
            None => tracing::debug!(unit_id = %unit_id, "No preloaded ad available"),
        }

        self.maybe_refill(unit_id, &shared);
        ad
    }

    pub fn is_ad_available(&self, unit_id: &AdUnitId) -> bool {
        self.queue_len(unit_id) > 0
    }

    pub fn queue_len(&self, unit_id: &AdUnitId) -> usize {
        self.entry(unit_id)
            .map(|shared| lock_entry(&shared).queue.len())
            .unwrap_or(0)
    }

    pub fn is_refilling(&self, unit_id: &AdUnitId) -> bool {
        self.entry(unit_id)
            .map(|shared| lock_entry(&shared).refilling)
            .unwrap_or(false)
    }

    pub fn is_active(&self, unit_id: &AdUnitId) -> bool {
        self.entries.contains_key(unit_id)
    }

    pub fn stats(&self, unit_id: &AdUnitId) -> Option<PreloadStats> {
        let shared = self.entry(unit_id)?;
        let entry = lock_entry(&shared);
        Some(PreloadStats {
            unit_id: unit_id.clone(),
            queued: entry.queue.len(),
            capacity: entry.config.capacity,
            refilling: entry.refilling,
            refills_started: entry.refills_started,
            refill_failures: entry.refill_failures,
        })
    }

    /// Stop preloading `unit_id` and release every queued ad.
    ///
    /// An in-flight backend call is not interrupted; its result is released
    /// when it arrives.
    pub fn stop_preloading(&self, unit_id: &AdUnitId) -> bool {
        let Some((_, shared)) = self.entries.remove(unit_id) else {
            return false;
        };

        let queue = {
            let mut entry = lock_entry(&shared);
            entry.cancel.cancel();
            entry.refilling = false;
            std::mem::take(&mut entry.queue)
        };

        tracing::info!(unit_id = %unit_id, released = queue.len(), "Stopped preload");
        for ad in queue {
            self.backend.destroy(ad.into_handle());
        }
        true
    }

    pub fn stop_all(&self) {
        let units: Vec<AdUnitId> = self.entries.iter().map(|e| e.key().clone()).collect();
        for unit_id in units {
            self.stop_preloading(&unit_id);
        }
    }

    fn entry(&self, unit_id: &AdUnitId) -> Option<SharedEntry> {
        self.entries.get(unit_id).map(|e| Arc::clone(e.value()))
    }

    fn maybe_refill(&self, unit_id: &AdUnitId, shared: &SharedEntry) {
        let cancel = {
            let mut entry = lock_entry(shared);
            if entry.refilling
                || entry.cancel.is_cancelled()
                || entry.queue.len() >= entry.config.capacity
            {
                return;
            }
            entry.refilling = true;
            entry.refills_started += 1;
            entry.cancel.clone()
        };

        tracing::debug!(unit_id = %unit_id, "Starting refill");
        tokio::spawn(refill(
            Arc::clone(&self.backend),
            self.listener.clone(),
            unit_id.clone(),
            Arc::clone(shared),
            cancel,
        ));
    }
}

impl Drop for PreloadPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn refill(
    backend: Arc<dyn AdBackend>,
    listener: Option<Arc<dyn PreloadListener>>,
    unit_id: AdUnitId,
    shared: SharedEntry,
    cancel: CancellationToken,
) {
    loop {
        let request = lock_entry(&shared).config.request.clone();
        let result = backend.load_ad(request).await;

        let mut entry = lock_entry(&shared);
        if cancel.is_cancelled() {
            drop(entry);
            if let Ok(handle) = result {
                tracing::debug!(unit_id = %unit_id, ad_id = %handle.id(), "Preload stopped - releasing late ad");
                backend.destroy(handle);
            }
            return;
        }

        match result {
            Ok(handle) => {
                if entry.queue.len() >= entry.config.capacity {
                    // Capacity shrank while this load was in flight.
                    entry.refilling = false;
                    drop(entry);
                    backend.destroy(handle);
                    return;
                }

                tracing::debug!(unit_id = %unit_id, ad_id = %handle.id(), "Ad queued");
                entry.queue.push_back(PreloadedAd::new(handle));
                let full = entry.queue.len() >= entry.config.capacity;
                if full {
                    entry.refilling = false;
                }
                drop(entry);

                if let Some(listener) = &listener {
                    listener.on_ad_preloaded(&unit_id);
                }
                if full {
                    return;
                }
            }
            Err(error) => {
                entry.refilling = false;
                entry.refill_failures += 1;
                drop(entry);

                tracing::warn!(unit_id = %unit_id, code = %error.code, error = %error.message, "Refill failed");
                if let Some(listener) = &listener {
                    listener.on_ad_failed_to_preload(&unit_id, &error);
                }
                return;
            }
        }
    }
}
