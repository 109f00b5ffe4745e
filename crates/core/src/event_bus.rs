//! Unified event bus — trait for emitting analytics events from any module.
//!
//! The engines accept an `Arc<dyn EventSink>` and emit lifecycle events
//! (segment transitions, journey entries, sends, completions) into whatever
//! pipeline the embedding service wires up.

use crate::types::{AnalyticsEvent, EventType};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `AnalyticsEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    user_id: impl Into<String>,
    timestamp: DateTime<Utc>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        user_id: user_id.into(),
        journey_id: None,
        instance_id: None,
        segment_id: None,
        node_id: None,
        timestamp,
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let now = Utc::now();
        sink.emit(make_event(EventType::JourneyEntered, "user-1", now));
        sink.emit(make_event(EventType::MessageSent, "user-1", now));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::JourneyEntered), 1);
        assert_eq!(sink.count_type(EventType::MessageSent), 1);

        let events = sink.events();
        assert_eq!(events[0].user_id, "user-1");
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EventType::JourneyCompleted, "user-1", Utc::now()));
    }
}
