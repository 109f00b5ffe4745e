//! Pure segment evaluation — computes membership from a fact snapshot.
//!
//! Evaluation is a pure function of `(graph, facts, context)`: no I/O, no
//! clock reads, no dependence on sibling order. Missing fact data is a
//! non-match; unresolvable node references are definition errors.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::bucketing::bucket_scoped;
use pulse_core::PulseResult;

use crate::definition::{
    PropertyAssertion, RelationalOperator, SegmentNode, SegmentOperator, SubscriptionGroupType,
};
use crate::facts::{json_path, parse_timestamp, EventOccurrence, UserFacts};
use crate::graph::SegmentGraph;

/// Scope for one evaluation: which segment, and the evaluation instant.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub segment_id: String,
    pub now: DateTime<Utc>,
}

impl EvalContext {
    pub fn new(segment_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            segment_id: segment_id.into(),
            now,
        }
    }
}

/// Result of evaluating a segment for one user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentEvaluation {
    pub member: bool,
    /// The instant the membership fact is justified at.
    pub as_of: DateTime<Utc>,
}

/// Evaluates segment graphs against user fact snapshots.
#[derive(Debug, Clone, Default)]
pub struct SegmentEvaluator;

impl SegmentEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        graph: &SegmentGraph,
        facts: &UserFacts,
        ctx: &EvalContext,
    ) -> PulseResult<SegmentEvaluation> {
        let member = self.eval_node(graph, graph.entry(), facts, ctx)?;
        Ok(SegmentEvaluation {
            member,
            as_of: ctx.now,
        })
    }

    fn eval_node(
        &self,
        graph: &SegmentGraph,
        node: &SegmentNode,
        facts: &UserFacts,
        ctx: &EvalContext,
    ) -> PulseResult<bool> {
        match node {
            SegmentNode::Trait { path, operator, .. } => Ok(operator_matches(
                operator,
                facts.trait_at(path),
                facts.trait_changed_at.get(path).copied(),
                ctx.now,
            )),
            SegmentNode::And { children, .. } => {
                // Resolve every child before evaluating, so a dangling
                // reference surfaces regardless of sibling outcomes.
                let nodes = children
                    .iter()
                    .map(|id| graph.node(id))
                    .collect::<PulseResult<Vec<_>>>()?;
                let mut result = true;
                for child in nodes {
                    result &= self.eval_node(graph, child, facts, ctx)?;
                }
                Ok(result)
            }
            SegmentNode::Or { children, .. } => {
                let nodes = children
                    .iter()
                    .map(|id| graph.node(id))
                    .collect::<PulseResult<Vec<_>>>()?;
                let mut result = false;
                for child in nodes {
                    result |= self.eval_node(graph, child, facts, ctx)?;
                }
                Ok(result)
            }
            SegmentNode::Performed {
                event,
                times,
                times_operator,
                within_seconds,
                properties,
                ..
            } => {
                let cutoff = within_seconds.map(|w| ctx.now - Duration::seconds(w as i64));
                let count = facts
                    .events
                    .iter()
                    .filter(|o| {
                        o.event == *event
                            && cutoff.map_or(true, |c| o.timestamp > c)
                            && assertions_hold(properties, o, ctx.now)
                    })
                    .count() as u64;
                Ok(times_satisfied(count, *times, *times_operator))
            }
            SegmentNode::LastPerformed {
                event,
                where_properties,
                has_properties,
                ..
            } => {
                // Eligibility and the final assertion are independent: an
                // occurrence excluded by `where_properties` never
                // contributes, even if it would satisfy `has_properties`.
                let last = facts
                    .events
                    .iter()
                    .filter(|o| o.event == *event && assertions_hold(where_properties, o, ctx.now))
                    .max_by_key(|o| o.timestamp);
                Ok(last.map_or(false, |o| assertions_hold(has_properties, o, ctx.now)))
            }
            SegmentNode::KeyedPerformed {
                event,
                key,
                times,
                times_operator,
                properties,
                ..
            } => {
                let mut counts: std::collections::HashMap<String, u64> = Default::default();
                for occurrence in facts.events.iter().filter(|o| o.event == *event) {
                    let Some(key_value) = json_path(&occurrence.properties, key) else {
                        continue;
                    };
                    if assertions_hold(properties, occurrence, ctx.now) {
                        *counts.entry(key_value.to_string()).or_insert(0) += 1;
                    }
                }
                Ok(counts
                    .values()
                    .any(|count| times_satisfied(*count, *times, *times_operator)))
            }
            SegmentNode::Broadcast { .. } => Ok(facts.broadcasts.contains(&ctx.segment_id)),
            SegmentNode::SubscriptionGroup {
                subscription_group_id,
                subscription_group_type,
                ..
            } => {
                let decision = facts.subscriptions.get(subscription_group_id).copied();
                Ok(match subscription_group_type {
                    SubscriptionGroupType::OptIn => decision == Some(true),
                    SubscriptionGroupType::OptOut => decision != Some(false),
                })
            }
            SegmentNode::Email {
                event,
                template_id,
                times,
                ..
            } => {
                let count = facts
                    .events
                    .iter()
                    .filter(|o| {
                        o.event == event.event_name()
                            && json_path(&o.properties, "templateId")
                                .and_then(|v| v.as_str())
                                .map_or(false, |t| t == template_id)
                    })
                    .count() as u64;
                Ok(count >= times.unwrap_or(1))
            }
            SegmentNode::RandomBucket { percent, .. } => {
                Ok(bucket_scoped(&facts.user_id, &ctx.segment_id) < *percent)
            }
            SegmentNode::Manual { version, .. } => {
                Ok(facts.manual_segments.get(&ctx.segment_id) == Some(version))
            }
            SegmentNode::Everyone { .. } => Ok(true),
        }
    }
}

/// Default counting policy: absent `times` means "at least once"; `times`
/// with no operator compares with `>=`.
fn times_satisfied(count: u64, times: Option<u64>, operator: Option<RelationalOperator>) -> bool {
    match times {
        None => count >= 1,
        Some(expected) => operator
            .unwrap_or(RelationalOperator::GreaterThanOrEqual)
            .compare(count, expected),
    }
}

fn assertions_hold(
    assertions: &[PropertyAssertion],
    occurrence: &EventOccurrence,
    now: DateTime<Utc>,
) -> bool {
    assertions.iter().all(|a| {
        operator_matches(
            &a.operator,
            json_path(&occurrence.properties, &a.path),
            None,
            now,
        )
    })
}

fn operator_matches(
    operator: &SegmentOperator,
    value: Option<&serde_json::Value>,
    changed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match operator {
        SegmentOperator::Exists => value.map_or(false, |v| !v.is_null()),
        SegmentOperator::NotExists => value.map_or(true, |v| v.is_null()),
        SegmentOperator::Equals { value: expected } => {
            value.map_or(false, |v| values_equal(v, expected))
        }
        SegmentOperator::NotEquals { value: expected } => {
            value.map_or(false, |v| !values_equal(v, expected))
        }
        SegmentOperator::GreaterThanOrEqual { value: expected } => {
            value.and_then(numeric_value).map_or(false, |n| n >= *expected)
        }
        SegmentOperator::LessThan { value: expected } => {
            value.and_then(numeric_value).map_or(false, |n| n < *expected)
        }
        SegmentOperator::Within { window_seconds } => value
            .and_then(parse_timestamp)
            .map_or(false, |ts| ts > now - Duration::seconds(*window_seconds as i64)),
        SegmentOperator::HasBeen {
            comparator,
            value: expected,
            window_seconds,
        } => {
            let holds = value.map_or(false, |v| values_equal(v, expected));
            if !holds {
                return false;
            }
            // Without the last-transition instant the hold duration is
            // unknown, which is a non-match for either comparator.
            let Some(changed) = changed_at else {
                return false;
            };
            let held = now.signed_duration_since(changed);
            let window = Duration::seconds(*window_seconds as i64);
            match comparator {
                crate::definition::HasBeenComparator::Gte => held >= window,
                crate::definition::HasBeenComparator::Lt => held < window,
            }
        }
    }
}

/// Equality with numeric looseness: `1` and `1.0` are equal, numbers never
/// equal strings.
fn values_equal(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => a == e,
        _ => actual == expected,
    }
}

fn numeric_value(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
