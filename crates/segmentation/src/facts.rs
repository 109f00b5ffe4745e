//! User facts — the snapshot of traits, event history, and platform state a
//! segment is evaluated against, plus the adapter trait supplying it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use pulse_core::PulseResult;

/// One recorded occurrence of a tracked event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOccurrence {
    pub event: String,
    pub properties: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Current membership plus the instant it last flipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MembershipState {
    pub member: bool,
    pub last_changed_at: Option<DateTime<Utc>>,
}

impl Default for MembershipState {
    fn default() -> Self {
        Self {
            member: false,
            last_changed_at: None,
        }
    }
}

/// Everything known about a user at evaluation time. Evaluation is a pure
/// function of this snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserFacts {
    pub user_id: String,
    /// Trait values as a nested JSON object, addressed by dotted path.
    pub traits: serde_json::Value,
    /// Last instant each trait path changed value, for `HasBeen`.
    pub trait_changed_at: HashMap<String, DateTime<Utc>>,
    pub events: Vec<EventOccurrence>,
    /// Explicit subscription decisions per subscription group id.
    pub subscriptions: HashMap<String, bool>,
    /// Manual segment assignments: segment id -> assignment version.
    pub manual_segments: HashMap<String, u64>,
    /// Segment ids the user has been targeted by via broadcast.
    pub broadcasts: HashSet<String>,
}

impl UserFacts {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            traits: serde_json::Value::Object(Default::default()),
            ..Default::default()
        }
    }

    /// Looks up a trait by dotted path. Absent paths are non-matches, never
    /// errors.
    pub fn trait_at(&self, path: &str) -> Option<&serde_json::Value> {
        json_path(&self.traits, path)
    }
}

/// Resolves a dotted path (`"billing.plan"`) inside a JSON object.
pub fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Parses a JSON value as an instant: RFC 3339 strings or epoch seconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp(secs as i64, 0)
        }
        _ => None,
    }
}

/// Adapter supplying user facts from the platform's profile/event storage.
pub trait FactStore: Send + Sync {
    fn traits(&self, user_id: &str) -> PulseResult<serde_json::Value>;

    fn event_occurrences(
        &self,
        user_id: &str,
        event: &str,
        since: Option<DateTime<Utc>>,
    ) -> PulseResult<Vec<EventOccurrence>>;

    fn membership_state(&self, segment_id: &str, user_id: &str) -> PulseResult<MembershipState>;

    /// Full snapshot consumed by the evaluator.
    fn facts(&self, user_id: &str) -> PulseResult<UserFacts>;
}

/// In-memory fact store for tests and embedded use.
#[derive(Default)]
pub struct MemoryFactStore {
    users: DashMap<String, UserFacts>,
    memberships: DashMap<(String, String), MembershipState>,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a trait value, recording the transition instant when the value
    /// actually changes.
    pub fn set_trait(
        &self,
        user_id: &str,
        path: &str,
        value: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserFacts::new(user_id));
        let previous = json_path(&entry.traits, path).cloned();
        if previous.as_ref() != Some(&value) {
            entry.trait_changed_at.insert(path.to_string(), at);
        }
        set_json_path(&mut entry.traits, path, value);
    }

    pub fn track_event(
        &self,
        user_id: &str,
        event: &str,
        properties: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserFacts::new(user_id))
            .events
            .push(EventOccurrence {
                event: event.to_string(),
                properties,
                timestamp: at,
            });
    }

    pub fn set_subscription(&self, user_id: &str, group_id: &str, opted_in: bool) {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserFacts::new(user_id))
            .subscriptions
            .insert(group_id.to_string(), opted_in);
    }

    pub fn set_manual_assignment(&self, user_id: &str, segment_id: &str, version: u64) {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserFacts::new(user_id))
            .manual_segments
            .insert(segment_id.to_string(), version);
    }

    pub fn add_broadcast(&self, user_id: &str, segment_id: &str) {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserFacts::new(user_id))
            .broadcasts
            .insert(segment_id.to_string());
    }

    /// Records a membership snapshot, typically fed back from the
    /// segmentation engine after a recompute.
    pub fn set_membership(
        &self,
        segment_id: &str,
        user_id: &str,
        member: bool,
        at: DateTime<Utc>,
    ) {
        let key = (segment_id.to_string(), user_id.to_string());
        let mut entry = self.memberships.entry(key).or_default();
        if entry.member != member || entry.last_changed_at.is_none() {
            entry.last_changed_at = Some(at);
        }
        entry.member = member;
    }
}

impl FactStore for MemoryFactStore {
    fn traits(&self, user_id: &str) -> PulseResult<serde_json::Value> {
        Ok(self
            .users
            .get(user_id)
            .map(|f| f.traits.clone())
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())))
    }

    fn event_occurrences(
        &self,
        user_id: &str,
        event: &str,
        since: Option<DateTime<Utc>>,
    ) -> PulseResult<Vec<EventOccurrence>> {
        let Some(facts) = self.users.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(facts
            .events
            .iter()
            .filter(|o| o.event == event && since.map_or(true, |s| o.timestamp >= s))
            .cloned()
            .collect())
    }

    fn membership_state(&self, segment_id: &str, user_id: &str) -> PulseResult<MembershipState> {
        Ok(self
            .memberships
            .get(&(segment_id.to_string(), user_id.to_string()))
            .map(|s| *s)
            .unwrap_or_default())
    }

    fn facts(&self, user_id: &str) -> PulseResult<UserFacts> {
        Ok(self
            .users
            .get(user_id)
            .map(|f| f.clone())
            .unwrap_or_else(|| UserFacts::new(user_id)))
    }
}

/// Writes a value at a dotted path, creating intermediate objects.
fn set_json_path(target: &mut serde_json::Value, path: &str, value: serde_json::Value) {
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();
    for segment in &segments[..segments.len() - 1] {
        current = current
            .as_object_mut()
            .expect("intermediate path segments are objects")
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if !current.is_object() {
            *current = serde_json::Value::Object(Default::default());
        }
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert(segments[segments.len() - 1].to_string(), value);
    }
}
