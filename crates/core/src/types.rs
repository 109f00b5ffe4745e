use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle events emitted by the engines into the analytics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SegmentEntered,
    SegmentExited,
    JourneyEntered,
    NodeProcessed,
    MessageSent,
    MessageSkipped,
    MessageFailed,
    JourneyCompleted,
    InstanceCancelled,
    InstanceFailed,
}

/// A single analytics event attributable to a user's progression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub user_id: String,
    pub journey_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub segment_id: Option<String>,
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
