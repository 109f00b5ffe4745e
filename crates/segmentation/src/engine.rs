//! Segmentation engine — registry of validated segments plus per-user
//! membership state, producing entry/exit deltas for the journey layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pulse_core::{PulseError, PulseResult};

use crate::definition::Segment;
use crate::evaluator::{EvalContext, SegmentEvaluation, SegmentEvaluator};
use crate::facts::{MembershipState, UserFacts};
use crate::graph::SegmentGraph;

/// A membership transition observed during a recompute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub segment_id: String,
    pub user_id: String,
    pub member: bool,
    pub previous: bool,
    pub at: DateTime<Utc>,
}

struct RegisteredSegment {
    segment: Segment,
    graph: Arc<SegmentGraph>,
}

/// Holds registered segments and tracks membership per (segment, user).
pub struct SegmentationEngine {
    segments: DashMap<String, RegisteredSegment>,
    memberships: DashMap<(String, String), MembershipState>,
    evaluator: SegmentEvaluator,
}

impl SegmentationEngine {
    pub fn new() -> Self {
        Self {
            segments: DashMap::new(),
            memberships: DashMap::new(),
            evaluator: SegmentEvaluator::new(),
        }
    }

    /// Validates and stores a segment. Definition errors are fatal here,
    /// before any evaluation can observe the segment.
    pub fn register_segment(&self, segment: Segment) -> PulseResult<()> {
        let graph = Arc::new(SegmentGraph::build(&segment.definition)?);
        info!(segment_id = %segment.id, name = %segment.name, "Registering segment");
        self.segments.insert(
            segment.id.clone(),
            RegisteredSegment { segment, graph },
        );
        Ok(())
    }

    pub fn remove_segment(&self, id: &str) -> PulseResult<()> {
        self.segments
            .remove(id)
            .ok_or_else(|| PulseError::SegmentNotFound(id.to_string()))?;
        info!(segment_id = %id, "Removed segment");
        Ok(())
    }

    pub fn get_segment(&self, id: &str) -> Option<Segment> {
        self.segments.get(id).map(|r| r.segment.clone())
    }

    pub fn list_segments(&self) -> Vec<Segment> {
        self.segments.iter().map(|r| r.segment.clone()).collect()
    }

    /// Fresh evaluation of one segment against a fact snapshot. Does not
    /// touch stored membership state.
    pub fn evaluate(
        &self,
        segment_id: &str,
        facts: &UserFacts,
        now: DateTime<Utc>,
    ) -> PulseResult<SegmentEvaluation> {
        let graph = self
            .segments
            .get(segment_id)
            .map(|r| Arc::clone(&r.graph))
            .ok_or_else(|| PulseError::SegmentNotFound(segment_id.to_string()))?;
        self.evaluator
            .evaluate(&graph, facts, &EvalContext::new(segment_id, now))
    }

    /// Current membership plus its last transition instant.
    pub fn membership_state(&self, segment_id: &str, user_id: &str) -> MembershipState {
        self.memberships
            .get(&(segment_id.to_string(), user_id.to_string()))
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Re-evaluates every registered segment for a user and returns the
    /// membership transitions. Call after any fact change for the user.
    pub fn recompute_user(
        &self,
        facts: &UserFacts,
        now: DateTime<Utc>,
    ) -> PulseResult<Vec<SegmentUpdate>> {
        let mut updates = Vec::new();
        for entry in self.segments.iter() {
            let segment_id = entry.key().clone();
            let evaluation = self.evaluator.evaluate(
                &entry.graph,
                facts,
                &EvalContext::new(segment_id.clone(), now),
            )?;

            let key = (segment_id.clone(), facts.user_id.clone());
            let previous = self.memberships.get(&key).map(|s| s.member).unwrap_or(false);
            if evaluation.member != previous {
                self.memberships.insert(
                    key,
                    MembershipState {
                        member: evaluation.member,
                        last_changed_at: Some(now),
                    },
                );
                debug!(
                    segment_id = %segment_id,
                    user_id = %facts.user_id,
                    member = evaluation.member,
                    "Segment membership transition"
                );
                updates.push(SegmentUpdate {
                    segment_id,
                    user_id: facts.user_id.clone(),
                    member: evaluation.member,
                    previous,
                    at: now,
                });
            }
        }
        Ok(updates)
    }
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}
