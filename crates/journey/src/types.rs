//! Journey definition and instance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel child id referring to the journey's exit node.
pub const EXIT_NODE_ID: &str = "ExitNode";
/// Reserved id for the entry node; body nodes may not claim it.
pub const ENTRY_NODE_ID: &str = "EntryNode";

/// A journey resource: a validated flowchart plus lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub name: String,
    pub status: JourneyStatus,
    pub definition: JourneyDefinition,
    /// Whether a user may run the journey again after a prior instance
    /// terminated.
    #[serde(default)]
    pub can_run_multiple: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a journey definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// The flowchart: one entry node, one exit node, and the body nodes they
/// reference by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyDefinition {
    pub entry_node: EntryNode,
    #[serde(default)]
    pub exit_node: ExitNode,
    #[serde(default)]
    pub nodes: Vec<JourneyBodyNode>,
}

/// The exit node carries no payload; reaching it terminates the instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExitNode {}

/// What admits a user into the journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryNode {
    /// Fires on a false -> true membership transition of `segment`.
    SegmentEntry {
        segment: String,
        child: String,
        #[serde(default)]
        re_enter: bool,
    },
    /// Fires on a matching tracked event; `key` partitions instances by the
    /// value at that property path.
    EventEntry {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        child: String,
    },
}

impl EntryNode {
    pub fn child(&self) -> &str {
        match self {
            EntryNode::SegmentEntry { child, .. } | EntryNode::EventEntry { child, .. } => child,
        }
    }
}

/// How a delay node computes its wake instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DelayVariant {
    Seconds {
        seconds: u64,
    },
    /// Next `hour:minute` in the platform reference timezone, rolling
    /// forward to an allowed weekday. Day indices are 0=Sunday..6=Saturday.
    LocalTime {
        hour: u32,
        #[serde(default)]
        minute: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        allowed_days_of_week: Option<Vec<u8>>,
    },
    /// Offset relative to a timestamp held in a user trait.
    UserProperty {
        user_property: String,
        #[serde(default)]
        offset_seconds: u64,
        #[serde(default)]
        offset_direction: OffsetDirection,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetDirection {
    Before,
    #[default]
    After,
}

/// Message channel plus channel-specific delivery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum MessageVariant {
    Email {
        template_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_override: Option<String>,
    },
    Sms {
        template_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_override: Option<String>,
    },
    MobilePush {
        template_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_override: Option<String>,
    },
    Webhook {
        template_id: String,
    },
}

impl MessageVariant {
    pub fn channel(&self) -> Channel {
        match self {
            MessageVariant::Email { .. } => Channel::Email,
            MessageVariant::Sms { .. } => Channel::Sms,
            MessageVariant::MobilePush { .. } => Channel::MobilePush,
            MessageVariant::Webhook { .. } => Channel::Webhook,
        }
    }

    pub fn template_id(&self) -> &str {
        match self {
            MessageVariant::Email { template_id, .. }
            | MessageVariant::Sms { template_id, .. }
            | MessageVariant::MobilePush { template_id, .. }
            | MessageVariant::Webhook { template_id } => template_id,
        }
    }

    pub fn provider_override(&self) -> Option<&str> {
        match self {
            MessageVariant::Email {
                provider_override, ..
            }
            | MessageVariant::Sms {
                provider_override, ..
            }
            | MessageVariant::MobilePush {
                provider_override, ..
            } => provider_override.as_deref(),
            MessageVariant::Webhook { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    MobilePush,
    Webhook,
}

/// Branch condition for a segment split.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SegmentSplitVariant {
    Boolean {
        segment: String,
        true_child: String,
        false_child: String,
    },
}

/// One weighted arm of an experiment split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub child: String,
    pub percent: f64,
}

/// One watched segment of a wait-for race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForSegmentChild {
    pub segment_id: String,
    pub child: String,
}

/// A non-entry, non-exit node of the flowchart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JourneyBodyNode {
    Delay {
        id: String,
        variant: DelayVariant,
        child: String,
    },
    /// Throttles traversal to the configured per-journey-per-user interval.
    RateLimit { id: String, child: String },
    SegmentSplit {
        id: String,
        variant: SegmentSplitVariant,
    },
    Message {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_group_id: Option<String>,
        variant: MessageVariant,
        #[serde(default)]
        sync_properties: bool,
        #[serde(default)]
        skip_on_failure: bool,
        child: String,
    },
    ExperimentSplit {
        id: String,
        variants: Vec<ExperimentVariant>,
    },
    WaitFor {
        id: String,
        timeout_seconds: u64,
        timeout_child: String,
        #[serde(default)]
        segment_children: Vec<WaitForSegmentChild>,
    },
}

impl JourneyBodyNode {
    pub fn id(&self) -> &str {
        match self {
            JourneyBodyNode::Delay { id, .. }
            | JourneyBodyNode::RateLimit { id, .. }
            | JourneyBodyNode::SegmentSplit { id, .. }
            | JourneyBodyNode::Message { id, .. }
            | JourneyBodyNode::ExperimentSplit { id, .. }
            | JourneyBodyNode::WaitFor { id, .. } => id,
        }
    }

    /// All child ids this node can route to.
    pub fn child_ids(&self) -> Vec<&str> {
        match self {
            JourneyBodyNode::Delay { child, .. }
            | JourneyBodyNode::RateLimit { child, .. }
            | JourneyBodyNode::Message { child, .. } => vec![child],
            JourneyBodyNode::SegmentSplit {
                variant:
                    SegmentSplitVariant::Boolean {
                        true_child,
                        false_child,
                        ..
                    },
                ..
            } => vec![true_child, false_child],
            JourneyBodyNode::ExperimentSplit { variants, .. } => {
                variants.iter().map(|v| v.child.as_str()).collect()
            }
            JourneyBodyNode::WaitFor {
                timeout_child,
                segment_children,
                ..
            } => {
                let mut children = vec![timeout_child.as_str()];
                children.extend(segment_children.iter().map(|c| c.child.as_str()));
                children
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JourneyBodyNode::Delay { .. } => "delay",
            JourneyBodyNode::RateLimit { .. } => "rate_limit",
            JourneyBodyNode::SegmentSplit { .. } => "segment_split",
            JourneyBodyNode::Message { .. } => "message",
            JourneyBodyNode::ExperimentSplit { .. } => "experiment_split",
            JourneyBodyNode::WaitFor { .. } => "wait_for",
        }
    }
}

/// Where an instance currently sits in the flowchart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "node_id", rename_all = "snake_case")]
pub enum InstancePosition {
    /// Entry condition not yet satisfied (only observable transiently).
    Pending,
    Node(String),
    Terminated,
}

/// Runtime status of a journey instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Waiting,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Cancelled | InstanceStatus::Failed
        )
    }
}

/// Record of a node an instance has traversed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub kind: String,
    pub at: DateTime<Utc>,
}

/// One user's progress through one journey (or one keyed iteration of it).
///
/// The suspended state is fully reconstructible from this record alone:
/// `wake_at` and `waiting_for` carry everything a scheduler sweep or a
/// segment-update callback needs to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyInstance {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub user_id: String,
    /// Disambiguates concurrent keyed-event iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_key: Option<String>,
    pub position: InstancePosition,
    pub status: InstanceStatus,
    /// Earliest instant a suspended instance becomes eligible to resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    /// Armed wait-for watches; empty unless parked at a wait-for node.
    #[serde(default)]
    pub waiting_for: Vec<WaitForSegmentChild>,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<NodeExecution>,
    /// Reason the instance halted, when status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl JourneyInstance {
    pub fn new(
        journey_id: Uuid,
        user_id: impl Into<String>,
        iteration_key: Option<String>,
        first_node: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            journey_id,
            user_id: user_id.into(),
            iteration_key,
            position: InstancePosition::Node(first_node.into()),
            status: InstanceStatus::Active,
            wake_at: None,
            waiting_for: Vec::new(),
            entered_at: now,
            updated_at: now,
            history: Vec::new(),
            failure: None,
        }
    }
}

/// Aggregate statistics for a journey, computed from its instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journey_id: Uuid,
    pub total_entered: u64,
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub avg_completion_time_secs: f64,
}
