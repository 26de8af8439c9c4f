//! Host-facing event capability and the backend → slot event channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::AdHandle;
use crate::error::ErrorDescriptor;

/// Revenue reported for an ad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdValue {
    pub value_micros: i64,
    pub currency_code: String,
}

/// Reward granted by a rewarded format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardItem {
    pub amount: i32,
    #[serde(rename = "type")]
    pub reward_type: String,
}

/// Notification emitted by the backend for an ad it has already delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdEvent {
    Impression,
    Clicked,
    Refreshed,
    FailedToRefresh(ErrorDescriptor),
    Paid(AdValue),
    Showed,
    Dismissed,
    FailedToShow(ErrorDescriptor),
    RewardEarned(RewardItem),
}

impl AdEvent {
    /// Ends a full-screen presentation.
    pub fn is_presentation_end(&self) -> bool {
        matches!(self, AdEvent::Dismissed | AdEvent::FailedToShow(_))
    }
}

/// Receives notifications for one slot or presentation.
///
/// For an [`AdSlotController`](crate::AdSlotController), callbacks run in the
/// context that applies slot events (see
/// [`AdSlotController::next_event`](crate::AdSlotController::next_event)),
/// never on a backend thread. A [`FullScreenPresenter`](crate::FullScreenPresenter)
/// calls them from its presentation task, which may run on any runtime worker.
pub trait EventSink: Send + Sync {
    fn on_loaded(&self);
    fn on_failed_to_load(&self, error: &ErrorDescriptor);
    fn on_impression(&self);
    fn on_clicked(&self);
    fn on_refreshed(&self);
    fn on_failed_to_refresh(&self, error: &ErrorDescriptor);

    fn on_paid(&self, _value: &AdValue) {}
    fn on_showed(&self) {}
    fn on_dismissed(&self) {}
    fn on_failed_to_show(&self, _error: &ErrorDescriptor) {}
    fn on_reward_earned(&self, _reward: &RewardItem) {}
}

pub(crate) fn dispatch(sink: &dyn EventSink, event: &AdEvent) {
    match event {
        AdEvent::Impression => sink.on_impression(),
        AdEvent::Clicked => sink.on_clicked(),
        AdEvent::Refreshed => sink.on_refreshed(),
        AdEvent::FailedToRefresh(e) => sink.on_failed_to_refresh(e),
        AdEvent::Paid(v) => sink.on_paid(v),
        AdEvent::Showed => sink.on_showed(),
        AdEvent::Dismissed => sink.on_dismissed(),
        AdEvent::FailedToShow(e) => sink.on_failed_to_show(e),
        AdEvent::RewardEarned(r) => sink.on_reward_earned(r),
    }
}

/// Message marshaled from backend tasks into the owning slot's context.
#[derive(Debug)]
pub(crate) enum SlotEvent {
    LoadFinished {
        generation: u64,
        result: Result<AdHandle, ErrorDescriptor>,
    },
    Ad {
        generation: u64,
        event: AdEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ad event receiver dropped")]
pub struct EventChannelClosed;

/// Handle the backend uses to report events for a delivered ad.
///
/// Tagged with the load generation it was issued for, so events from a
/// replaced or destroyed ad are discarded by the slot.
#[derive(Debug, Clone)]
pub struct AdEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<SlotEvent>,
}

impl AdEventSender {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<SlotEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn send(&self, event: AdEvent) -> Result<(), EventChannelClosed> {
        self.tx
            .send(SlotEvent::Ad {
                generation: self.generation,
                event,
            })
            .map_err(|_| EventChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Logs every notification with structured fields.
#[derive(Debug, Clone)]
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn on_loaded(&self) {
        tracing::info!(ad = %self.label, "Ad loaded");
    }

    fn on_failed_to_load(&self, error: &ErrorDescriptor) {
        tracing::warn!(ad = %self.label, code = %error.code, error = %error.message, "Ad failed to load");
    }

    fn on_impression(&self) {
        tracing::debug!(ad = %self.label, "Ad recorded an impression");
    }

    fn on_clicked(&self) {
        tracing::debug!(ad = %self.label, "Ad recorded a click");
    }

    fn on_refreshed(&self) {
        tracing::debug!(ad = %self.label, "Ad refreshed");
    }

    fn on_failed_to_refresh(&self, error: &ErrorDescriptor) {
        tracing::warn!(ad = %self.label, code = %error.code, error = %error.message, "Ad failed to refresh");
    }

    fn on_paid(&self, value: &AdValue) {
        tracing::debug!(
            ad = %self.label,
            value_micros = value.value_micros,
            currency = %value.currency_code,
            "Ad paid event"
        );
    }

    fn on_showed(&self) {
        tracing::debug!(ad = %self.label, "Ad showed full screen content");
    }

    fn on_dismissed(&self) {
        tracing::debug!(ad = %self.label, "Ad dismissed full screen content");
    }

    fn on_failed_to_show(&self, error: &ErrorDescriptor) {
        tracing::warn!(ad = %self.label, code = %error.code, error = %error.message, "Ad failed to show");
    }

    fn on_reward_earned(&self, reward: &RewardItem) {
        tracing::info!(
            ad = %self.label,
            amount = reward.amount,
            reward_type = %reward.reward_type,
            "User earned reward"
        );
    }
}

/// What a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Loaded,
    FailedToLoad(ErrorDescriptor),
    Ad(AdEvent),
}

/// Forwards notifications to an unbounded channel for hosts that prefer polling.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SinkEvent) {
        // Receiver gone means the host stopped listening.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_loaded(&self) {
        self.forward(SinkEvent::Loaded);
    }

    fn on_failed_to_load(&self, error: &ErrorDescriptor) {
        self.forward(SinkEvent::FailedToLoad(error.clone()));
    }

    fn on_impression(&self) {
        self.forward(SinkEvent::Ad(AdEvent::Impression));
    }

    fn on_clicked(&self) {
        self.forward(SinkEvent::Ad(AdEvent::Clicked));
    }

    fn on_refreshed(&self) {
        self.forward(SinkEvent::Ad(AdEvent::Refreshed));
    }

    fn on_failed_to_refresh(&self, error: &ErrorDescriptor) {
        self.forward(SinkEvent::Ad(AdEvent::FailedToRefresh(error.clone())));
    }

    fn on_paid(&self, value: &AdValue) {
        self.forward(SinkEvent::Ad(AdEvent::Paid(value.clone())));
    }

    fn on_showed(&self) {
        self.forward(SinkEvent::Ad(AdEvent::Showed));
    }

    fn on_dismissed(&self) {
        self.forward(SinkEvent::Ad(AdEvent::Dismissed));
    }

    fn on_failed_to_show(&self, error: &ErrorDescriptor) {
        self.forward(SinkEvent::Ad(AdEvent::FailedToShow(error.clone())));
    }

    fn on_reward_earned(&self, reward: &RewardItem) {
        self.forward(SinkEvent::Ad(AdEvent::RewardEarned(reward.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_to_named_callbacks() {
        let (sink, mut rx) = ChannelSink::new();

        dispatch(&sink, &AdEvent::Impression);
        dispatch(&sink, &AdEvent::FailedToRefresh(ErrorDescriptor::no_fill()));
        dispatch(
            &sink,
            &AdEvent::RewardEarned(RewardItem {
                amount: 10,
                reward_type: "coins".to_string(),
            }),
        );

        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Ad(AdEvent::Impression));
        assert_eq!(
            rx.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::FailedToRefresh(ErrorDescriptor::no_fill()))
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            SinkEvent::Ad(AdEvent::RewardEarned(RewardItem { amount: 10, .. }))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sender_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = AdEventSender::new(1, tx);

        assert!(sender.send(AdEvent::Clicked).is_ok());
        drop(rx);
        assert!(sender.is_closed());
        assert_eq!(sender.send(AdEvent::Clicked), Err(EventChannelClosed));
    }

    #[test]
    fn presentation_end_events() {
        assert!(AdEvent::Dismissed.is_presentation_end());
        assert!(AdEvent::FailedToShow(ErrorDescriptor::no_fill()).is_presentation_end());
        assert!(!AdEvent::Showed.is_presentation_end());
    }

    #[test]
    fn reward_item_serializes_type_field() {
        let reward = RewardItem {
            amount: 1,
            reward_type: "coins".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&reward).unwrap(),
            serde_json::json!({"amount": 1, "type": "coins"})
        );
    }
}
