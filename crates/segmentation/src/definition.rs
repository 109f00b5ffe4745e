//! Segment definition model — the closed node and operator unions a segment
//! is built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named audience: a definition plus resource metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub name: String,
    pub definition: SegmentDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A segment definition: an entry node plus the ordered set of non-entry
/// nodes it references by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub entry_node: SegmentNode,
    #[serde(default)]
    pub nodes: Vec<SegmentNode>,
}

impl SegmentDefinition {
    /// A definition consisting of a single entry node.
    pub fn leaf(entry_node: SegmentNode) -> Self {
        Self {
            entry_node,
            nodes: Vec::new(),
        }
    }
}

/// A property assertion applied to an event occurrence's properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyAssertion {
    pub path: String,
    pub operator: SegmentOperator,
}

/// Comparator for counting occurrences against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationalOperator {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "<")]
    LessThan,
}

impl RelationalOperator {
    pub fn compare(&self, actual: u64, expected: u64) -> bool {
        match self {
            RelationalOperator::Equals => actual == expected,
            RelationalOperator::GreaterThanOrEqual => actual >= expected,
            RelationalOperator::LessThan => actual < expected,
        }
    }
}

/// How long a condition must have held for `HasBeen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HasBeenComparator {
    #[serde(rename = "GTE")]
    Gte,
    #[serde(rename = "LT")]
    Lt,
}

/// Operators applicable to trait values and event properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SegmentOperator {
    Equals {
        value: serde_json::Value,
    },
    NotEquals {
        value: serde_json::Value,
    },
    Exists,
    NotExists,
    GreaterThanOrEqual {
        value: f64,
    },
    LessThan {
        value: f64,
    },
    /// The value parses as a timestamp within the trailing window.
    Within {
        window_seconds: u64,
    },
    /// The value has equalled `value` continuously for at least (GTE) or
    /// strictly less than (LT) the window. Requires the fact's
    /// last-transition timestamp.
    HasBeen {
        comparator: HasBeenComparator,
        value: serde_json::Value,
        window_seconds: u64,
    },
}

/// Whether a subscription group is opt-in or opt-out by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionGroupType {
    OptIn,
    OptOut,
}

/// Internal email lifecycle events countable by the `Email` segment node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailEvent {
    MessageSent,
    EmailDropped,
    EmailDelivered,
    EmailOpened,
    EmailClicked,
    EmailBounced,
    EmailMarkedSpam,
}

impl EmailEvent {
    /// The tracked event name occurrences are recorded under.
    pub fn event_name(&self) -> &'static str {
        match self {
            EmailEvent::MessageSent => "MessageSent",
            EmailEvent::EmailDropped => "EmailDropped",
            EmailEvent::EmailDelivered => "EmailDelivered",
            EmailEvent::EmailOpened => "EmailOpened",
            EmailEvent::EmailClicked => "EmailClicked",
            EmailEvent::EmailBounced => "EmailBounced",
            EmailEvent::EmailMarkedSpam => "EmailMarkedSpam",
        }
    }
}

/// A single condition node in a segment definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SegmentNode {
    /// Tests a named trait value against an operator.
    Trait {
        id: String,
        path: String,
        operator: SegmentOperator,
    },
    And {
        id: String,
        children: Vec<String>,
    },
    Or {
        id: String,
        children: Vec<String>,
    },
    /// The event occurred a qualifying number of times, with all property
    /// assertions holding on each counted occurrence.
    Performed {
        id: String,
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        times: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        times_operator: Option<RelationalOperator>,
        #[serde(skip_serializing_if = "Option::is_none")]
        within_seconds: Option<u64>,
        #[serde(default)]
        properties: Vec<PropertyAssertion>,
    },
    /// Selects the most recent occurrence matching `where_properties`; true
    /// if that occurrence satisfies `has_properties`.
    LastPerformed {
        id: String,
        event: String,
        #[serde(default)]
        where_properties: Vec<PropertyAssertion>,
        #[serde(default)]
        has_properties: Vec<PropertyAssertion>,
    },
    /// `Performed`, evaluated per distinct value at the `key` property path.
    KeyedPerformed {
        id: String,
        event: String,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        times: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        times_operator: Option<RelationalOperator>,
        #[serde(default)]
        properties: Vec<PropertyAssertion>,
    },
    /// Membership maintained by broadcast targeting.
    Broadcast { id: String },
    SubscriptionGroup {
        id: String,
        subscription_group_id: String,
        subscription_group_type: SubscriptionGroupType,
    },
    /// Counts email lifecycle events for a specific template.
    Email {
        id: String,
        event: EmailEvent,
        template_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        times: Option<u64>,
    },
    /// Stable random assignment of `percent` (in [0,1]) of users.
    RandomBucket { id: String, percent: f64 },
    /// Manual assignment at a specific version.
    Manual { id: String, version: u64 },
    Everyone { id: String },
}

impl SegmentNode {
    pub fn id(&self) -> &str {
        match self {
            SegmentNode::Trait { id, .. }
            | SegmentNode::And { id, .. }
            | SegmentNode::Or { id, .. }
            | SegmentNode::Performed { id, .. }
            | SegmentNode::LastPerformed { id, .. }
            | SegmentNode::KeyedPerformed { id, .. }
            | SegmentNode::Broadcast { id }
            | SegmentNode::SubscriptionGroup { id, .. }
            | SegmentNode::Email { id, .. }
            | SegmentNode::RandomBucket { id, .. }
            | SegmentNode::Manual { id, .. }
            | SegmentNode::Everyone { id } => id,
        }
    }

    /// Ids of children referenced by combinator nodes.
    pub fn child_ids(&self) -> &[String] {
        match self {
            SegmentNode::And { children, .. } | SegmentNode::Or { children, .. } => children,
            _ => &[],
        }
    }
}
