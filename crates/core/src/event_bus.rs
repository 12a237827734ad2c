//! Event sink trait for emitting placement events from any engine.
//!
//! Engines accept an `Arc<dyn EventSink>` so auction, ledger, and budget
//! activity can be forwarded to analytics without the engines knowing the
//! transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlacementEventType {
    AllocationCompleted,
    AdExcluded,
    WalletTransaction,
    BudgetAlert,
    EngagementConfirmed,
    ChargeRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementEvent {
    pub event_id: Uuid,
    pub event_type: PlacementEventType,
    /// Request id, wallet id, or campaign id depending on the event type.
    pub subject: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PlacementEvent);
}

/// No-op sink for tests and engines that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: PlacementEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<PlacementEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<PlacementEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: PlacementEventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: PlacementEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

pub fn make_event(
    event_type: PlacementEventType,
    subject: impl Into<String>,
    detail: serde_json::Value,
) -> PlacementEvent {
    PlacementEvent {
        event_id: Uuid::new_v4(),
        event_type,
        subject: subject.into(),
        detail,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            PlacementEventType::AdExcluded,
            "req-1",
            json!({"ad_id": "ad-1", "reason": "BELOW_MIN_BID"}),
        ));
        sink.emit(make_event(
            PlacementEventType::WalletTransaction,
            "wallet-1",
            json!({"kind": "deposit"}),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(PlacementEventType::AdExcluded), 1);
        assert_eq!(sink.events()[1].subject, "wallet-1");
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(
            PlacementEventType::BudgetAlert,
            "campaign-1",
            serde_json::Value::Null,
        ));
    }
}
