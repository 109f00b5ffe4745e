//! Instance persistence — the adapter trait the executor drives, plus an
//! in-memory implementation for tests and embedded use.
//!
//! A suspended instance must be fully reconstructible from the store: the
//! executor never holds in-memory continuations, only instance records and
//! wake timers.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use pulse_core::PulseResult;

use crate::types::{InstanceStatus, JourneyInstance};

/// Durable persistence for journey instances and their wake timers.
pub trait InstanceStore: Send + Sync {
    /// The single active instance for a `(journey, user, iteration_key)`
    /// triple, if any.
    fn load_active(
        &self,
        journey_id: Uuid,
        user_id: &str,
        iteration_key: Option<&str>,
    ) -> Option<JourneyInstance>;

    /// Whether any instance, active or terminated, has ever existed for the
    /// triple. Drives re-entry policy.
    fn has_entered(&self, journey_id: Uuid, user_id: &str, iteration_key: Option<&str>) -> bool;

    fn get(&self, instance_id: Uuid) -> Option<JourneyInstance>;

    /// Idempotent upsert by instance id: retrying after a partial failure
    /// must not create a duplicate.
    fn save(&self, instance: &JourneyInstance) -> PulseResult<()>;

    fn schedule_wake(&self, instance_id: Uuid, at: DateTime<Utc>) -> PulseResult<()>;

    fn cancel_wake(&self, instance_id: Uuid) -> PulseResult<()>;

    /// Drains and returns instances whose wake time has elapsed.
    fn due(&self, now: DateTime<Utc>) -> Vec<Uuid>;

    /// Instances with an armed wait-for watch on the segment.
    fn waiting_on(&self, segment_id: &str) -> Vec<Uuid>;

    fn for_journey(&self, journey_id: Uuid) -> Vec<JourneyInstance>;
}

type TripleKey = (Uuid, String, Option<String>);

fn triple_key(journey_id: Uuid, user_id: &str, iteration_key: Option<&str>) -> TripleKey {
    (
        journey_id,
        user_id.to_string(),
        iteration_key.map(str::to_string),
    )
}

/// In-memory instance store.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: DashMap<Uuid, JourneyInstance>,
    active: DashMap<TripleKey, Uuid>,
    entered: DashMap<TripleKey, ()>,
    watches: DashMap<String, HashSet<Uuid>>,
    wake_queue: Mutex<BTreeMap<(DateTime<Utc>, Uuid), ()>>,
    wake_times: DashMap<Uuid, DateTime<Utc>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn load_active(
        &self,
        journey_id: Uuid,
        user_id: &str,
        iteration_key: Option<&str>,
    ) -> Option<JourneyInstance> {
        let id = *self
            .active
            .get(&triple_key(journey_id, user_id, iteration_key))?;
        self.instances.get(&id).map(|i| i.clone())
    }

    fn has_entered(&self, journey_id: Uuid, user_id: &str, iteration_key: Option<&str>) -> bool {
        self.entered
            .contains_key(&triple_key(journey_id, user_id, iteration_key))
    }

    fn get(&self, instance_id: Uuid) -> Option<JourneyInstance> {
        self.instances.get(&instance_id).map(|i| i.clone())
    }

    fn save(&self, instance: &JourneyInstance) -> PulseResult<()> {
        let key = triple_key(
            instance.journey_id,
            &instance.user_id,
            instance.iteration_key.as_deref(),
        );
        self.entered.insert(key.clone(), ());
        if instance.status.is_terminal() {
            // Only clear the active slot if this instance still owns it.
            let owner = self.active.get(&key).map(|id| *id);
            if owner == Some(instance.id) {
                self.active.remove(&key);
            }
        } else {
            self.active.insert(key, instance.id);
        }

        // Rebuild this instance's watch entries from the saved record.
        for mut entry in self.watches.iter_mut() {
            entry.value_mut().remove(&instance.id);
        }
        for watch in &instance.waiting_for {
            self.watches
                .entry(watch.segment_id.clone())
                .or_default()
                .insert(instance.id);
        }

        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn schedule_wake(&self, instance_id: Uuid, at: DateTime<Utc>) -> PulseResult<()> {
        let mut queue = self.wake_queue.lock();
        if let Some(previous) = self.wake_times.insert(instance_id, at) {
            queue.remove(&(previous, instance_id));
        }
        queue.insert((at, instance_id), ());
        Ok(())
    }

    fn cancel_wake(&self, instance_id: Uuid) -> PulseResult<()> {
        if let Some((_, at)) = self.wake_times.remove(&instance_id) {
            self.wake_queue.lock().remove(&(at, instance_id));
        }
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut queue = self.wake_queue.lock();
        let mut due = Vec::new();
        loop {
            let next = queue.keys().next().copied();
            match next {
                Some((at, id)) if at <= now => {
                    queue.remove(&(at, id));
                    self.wake_times.remove(&id);
                    due.push(id);
                }
                _ => break,
            }
        }
        due
    }

    fn waiting_on(&self, segment_id: &str) -> Vec<Uuid> {
        self.watches
            .get(segment_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn for_journey(&self, journey_id: Uuid) -> Vec<JourneyInstance> {
        self.instances
            .iter()
            .filter(|i| i.journey_id == journey_id)
            .map(|i| i.clone())
            .collect()
    }
}

/// Marks an instance terminal in place; shared by executor halt paths.
pub fn finalize(instance: &mut JourneyInstance, status: InstanceStatus, now: DateTime<Utc>) {
    debug_assert!(status.is_terminal());
    instance.status = status;
    instance.wake_at = None;
    instance.waiting_for.clear();
    instance.updated_at = now;
}
