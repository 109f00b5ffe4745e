//! Segment builder — fluent API for constructing segment definitions.

use chrono::Utc;
use serde_json::json;

use crate::definition::{
    PropertyAssertion, RelationalOperator, Segment, SegmentDefinition, SegmentNode,
    SegmentOperator,
};

/// Builds a segment whose entry node combines leaf conditions with a single
/// And/Or. Leaf ids are assigned sequentially.
pub struct SegmentBuilder {
    id: String,
    name: String,
    any: bool,
    nodes: Vec<SegmentNode>,
}

impl SegmentBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            any: false,
            nodes: Vec::new(),
        }
    }

    /// Combine conditions with Or instead of And.
    pub fn match_any(mut self) -> Self {
        self.any = true;
        self
    }

    pub fn trait_equals(self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.trait_node(path, SegmentOperator::Equals { value })
    }

    pub fn trait_exists(self, path: impl Into<String>) -> Self {
        self.trait_node(path, SegmentOperator::Exists)
    }

    pub fn trait_node(mut self, path: impl Into<String>, operator: SegmentOperator) -> Self {
        let id = self.next_id();
        self.nodes.push(SegmentNode::Trait {
            id,
            path: path.into(),
            operator,
        });
        self
    }

    pub fn performed(mut self, event: impl Into<String>, at_least: u64) -> Self {
        let id = self.next_id();
        self.nodes.push(SegmentNode::Performed {
            id,
            event: event.into(),
            times: Some(at_least),
            times_operator: Some(RelationalOperator::GreaterThanOrEqual),
            within_seconds: None,
            properties: vec![],
        });
        self
    }

    pub fn not_performed(mut self, event: impl Into<String>, within_seconds: u64) -> Self {
        let id = self.next_id();
        self.nodes.push(SegmentNode::Performed {
            id,
            event: event.into(),
            times: Some(0),
            times_operator: Some(RelationalOperator::Equals),
            within_seconds: Some(within_seconds),
            properties: vec![],
        });
        self
    }

    pub fn performed_with(
        mut self,
        event: impl Into<String>,
        path: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        let id = self.next_id();
        self.nodes.push(SegmentNode::Performed {
            id,
            event: event.into(),
            times: None,
            times_operator: None,
            within_seconds: None,
            properties: vec![PropertyAssertion {
                path: path.into(),
                operator: SegmentOperator::Equals { value },
            }],
        });
        self
    }

    pub fn random_bucket(mut self, percent: f64) -> Self {
        let id = self.next_id();
        self.nodes.push(SegmentNode::RandomBucket { id, percent });
        self
    }

    pub fn everyone(mut self) -> Self {
        let id = self.next_id();
        self.nodes.push(SegmentNode::Everyone { id });
        self
    }

    fn next_id(&self) -> String {
        format!("{}", self.nodes.len() + 1)
    }

    pub fn build(self) -> Segment {
        let now = Utc::now();
        let children: Vec<String> = self.nodes.iter().map(|n| n.id().to_string()).collect();
        let entry_node = if self.any {
            SegmentNode::Or {
                id: "0".into(),
                children,
            }
        } else {
            SegmentNode::And {
                id: "0".into(),
                children,
            }
        };
        Segment {
            id: self.id,
            name: self.name,
            definition: SegmentDefinition {
                entry_node,
                nodes: self.nodes,
            },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Shorthand for the common "performed event at least once" segment.
pub fn performed_segment(id: impl Into<String>, event: &str) -> Segment {
    SegmentBuilder::new(id, format!("Performed {event}"))
        .performed(event, 1)
        .build()
}

/// Shorthand for a "trait equals value" segment.
pub fn trait_segment(id: impl Into<String>, path: &str, value: &str) -> Segment {
    SegmentBuilder::new(id, format!("{path} = {value}"))
        .trait_equals(path, json!(value))
        .build()
}
