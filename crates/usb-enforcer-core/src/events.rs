//! Event stream fan-out for Remote API subscribers.

use chrono::{DateTime, Utc};
use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Added,
    Removed,
    EnforcementApplied,
    EnforcementFailed,
    StateChanged,
    OperationStarted,
    OperationPhase,
    OperationCompleted,
    OperationFailed,
    OperationAborted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Removed => "removed",
            EventType::EnforcementApplied => "enforcement_applied",
            EventType::EnforcementFailed => "enforcement_failed",
            EventType::StateChanged => "state_changed",
            EventType::OperationStarted => "operation_started",
            EventType::OperationPhase => "operation_phase",
            EventType::OperationCompleted => "operation_completed",
            EventType::OperationFailed => "operation_failed",
            EventType::OperationAborted => "operation_aborted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registry or operation transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcerEvent {
    pub path: String,
    pub event_type: EventType,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl EnforcerEvent {
    pub fn new(path: impl Into<String>, event_type: EventType, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            event_type,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Broadcast bus; slow subscribers lag and skip rather than block emitters.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EnforcerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnforcerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EnforcerEvent) {
        trace!(
            "event {} for {}: {}",
            event.event_type,
            event.path,
            event.detail
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn publish(&self, path: &str, event_type: EventType, detail: impl Into<String>) {
        self.emit(EnforcerEvent::new(path, event_type, detail));
    }
}
