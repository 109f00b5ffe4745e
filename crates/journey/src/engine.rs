//! Journey executor — a per-user-per-journey state machine advanced by
//! segment transitions, tracked events, and elapsed wake timers.
//!
//! Triggered instances run to completion node by node until they park at a
//! delay, wait-for, or rate-limit suspension point, terminate at the exit,
//! or halt. All public operations take the evaluation instant explicitly so
//! traversal is deterministic and replayable.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_core::bucketing::bucket_scoped;
use pulse_core::event_bus::{make_event, noop_sink, EventSink};
use pulse_core::types::EventType;
use pulse_core::{JourneyConfig, PulseError, PulseResult};
use pulse_segmentation::facts::{json_path, parse_timestamp};
use pulse_segmentation::{FactStore, SegmentUpdate, SegmentationEngine};

use crate::dispatch::{DispatchError, MessageDispatcher, MessageRequest};
use crate::graph::JourneyGraph;
use crate::stores::{finalize, InstanceStore};
use crate::types::{
    DelayVariant, EntryNode, InstancePosition, InstanceStatus, Journey, JourneyBodyNode,
    JourneyInstance, JourneyStats, JourneyStatus, NodeExecution, OffsetDirection,
    SegmentSplitVariant, EXIT_NODE_ID,
};

#[derive(Clone)]
struct RegisteredJourney {
    journey: Journey,
    graph: Arc<JourneyGraph>,
}

/// Core orchestration engine — owns journey registration and instance
/// traversal, delegating facts, segment evaluation, dispatch, and
/// persistence to adapters.
pub struct JourneyEngine {
    journeys: DashMap<Uuid, RegisteredJourney>,
    segments: Arc<SegmentationEngine>,
    facts: Arc<dyn FactStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
    store: Arc<dyn InstanceStore>,
    events: Arc<dyn EventSink>,
    config: JourneyConfig,
    /// Last rate-limit passage per (journey, user).
    rate_marks: DashMap<(Uuid, String), DateTime<Utc>>,
    /// Single-writer-per-instance discipline: a wake timer and an external
    /// trigger racing for the same instance serialize here.
    instance_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("journeys", &self.journeys.len())
            .finish()
    }
}

impl JourneyEngine {
    pub fn new(
        segments: Arc<SegmentationEngine>,
        facts: Arc<dyn FactStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        store: Arc<dyn InstanceStore>,
        config: JourneyConfig,
    ) -> Self {
        Self {
            journeys: DashMap::new(),
            segments,
            facts,
            dispatcher,
            store,
            events: noop_sink(),
            config,
            rate_marks: DashMap::new(),
            instance_locks: DashMap::new(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    // ------------------------------------------------------------------
    // Journey registration and lifecycle
    // ------------------------------------------------------------------

    /// Validates and stores a journey. Definition errors are fatal here,
    /// before any instance can be created.
    pub fn register_journey(&self, journey: Journey) -> PulseResult<Uuid> {
        let graph = Arc::new(JourneyGraph::build(&journey.definition)?);
        let id = journey.id;
        info!(journey_id = %id, name = %journey.name, "Registering journey");
        self.journeys.insert(id, RegisteredJourney { journey, graph });
        Ok(id)
    }

    pub fn get_journey(&self, id: &Uuid) -> Option<Journey> {
        self.journeys.get(id).map(|r| r.journey.clone())
    }

    pub fn list_journeys(&self) -> Vec<Journey> {
        self.journeys.iter().map(|r| r.journey.clone()).collect()
    }

    pub fn set_journey_status(&self, id: &Uuid, status: JourneyStatus) -> PulseResult<()> {
        let mut entry = self
            .journeys
            .get_mut(id)
            .ok_or(PulseError::JourneyNotFound(*id))?;
        info!(journey_id = %id, ?status, "Updating journey status");
        entry.journey.status = status;
        entry.journey.updated_at = Utc::now();
        Ok(())
    }

    /// Stops scheduling new wake-ups without touching in-flight state.
    pub fn pause_journey(&self, id: &Uuid) -> PulseResult<()> {
        self.set_journey_status(id, JourneyStatus::Paused)
    }

    /// Reactivates a journey and re-schedules its suspended instances from
    /// their persisted wake times.
    pub fn resume_journey(&self, id: &Uuid, now: DateTime<Utc>) -> PulseResult<()> {
        self.set_journey_status(id, JourneyStatus::Active)?;
        for instance in self.store.for_journey(*id) {
            if instance.status == InstanceStatus::Waiting {
                self.store
                    .schedule_wake(instance.id, instance.wake_at.unwrap_or(now))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Feeds a batch of membership transitions through entry conditions and
    /// armed wait-for watches.
    pub fn handle_segment_updates(&self, updates: &[SegmentUpdate], now: DateTime<Utc>) {
        for update in updates {
            self.handle_segment_update(update, now);
        }
    }

    pub fn handle_segment_update(&self, update: &SegmentUpdate, now: DateTime<Utc>) {
        if !update.member {
            return;
        }

        // False -> true transition: check segment entry nodes.
        if !update.previous {
            let candidates: Vec<RegisteredJourney> = self
                .journeys
                .iter()
                .filter(|r| {
                    r.journey.status == JourneyStatus::Active
                        && matches!(
                            r.graph.entry(),
                            EntryNode::SegmentEntry { segment, .. } if *segment == update.segment_id
                        )
                })
                .map(|r| r.clone())
                .collect();
            for reg in candidates {
                self.try_enter(&reg, &update.user_id, None, now);
            }
        }

        // Resolve armed wait-for watches racing on this segment.
        for instance_id in self.store.waiting_on(&update.segment_id) {
            self.resolve_watch(instance_id, update, now);
        }
    }

    /// Feeds a tracked event through event entry nodes. Returns the ids of
    /// instances created.
    pub fn handle_event(
        &self,
        user_id: &str,
        event: &str,
        properties: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Vec<Uuid> {
        let candidates: Vec<RegisteredJourney> = self
            .journeys
            .iter()
            .filter(|r| {
                r.journey.status == JourneyStatus::Active
                    && matches!(
                        r.graph.entry(),
                        EntryNode::EventEntry { event: e, .. } if e == event
                    )
            })
            .map(|r| r.clone())
            .collect();

        let mut entered = Vec::new();
        for reg in candidates {
            let EntryNode::EventEntry { key, .. } = reg.graph.entry() else {
                continue;
            };
            let iteration_key = match key {
                None => None,
                Some(path) => match json_path(properties, path) {
                    Some(value) => Some(stringify(value)),
                    None => {
                        // A keyless instance would collide with keyed
                        // iterations of the same journey.
                        debug!(
                            journey_id = %reg.journey.id,
                            key = %path,
                            "Event missing entry key, skipping"
                        );
                        continue;
                    }
                },
            };
            if let Some(id) = self.try_enter(&reg, user_id, iteration_key, now) {
                entered.push(id);
            }
        }
        entered
    }

    /// Advances every instance whose wake time has elapsed. Returns the
    /// number of instances processed.
    pub fn process_due(&self, now: DateTime<Utc>) -> usize {
        let mut processed = 0;
        for instance_id in self.store.due(now) {
            self.resume_due(instance_id, now);
            processed += 1;
        }
        processed
    }

    /// Cancels an instance: no further wake-ups, sends, or transitions.
    pub fn cancel_instance(&self, instance_id: Uuid, now: DateTime<Utc>) -> PulseResult<()> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock();

        let mut instance = self
            .store
            .get(instance_id)
            .ok_or(PulseError::InstanceNotFound(instance_id))?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        self.store.cancel_wake(instance_id)?;
        finalize(&mut instance, InstanceStatus::Cancelled, now);
        self.store.save(&instance)?;
        info!(instance_id = %instance_id, "Cancelled journey instance");
        self.emit(EventType::InstanceCancelled, &instance, None, now);
        Ok(())
    }

    pub fn get_instance(&self, instance_id: Uuid) -> Option<JourneyInstance> {
        self.store.get(instance_id)
    }

    /// Computes aggregate statistics for the given journey from its
    /// instances.
    pub fn get_stats(&self, journey_id: Uuid) -> JourneyStats {
        let mut stats = JourneyStats {
            journey_id,
            total_entered: 0,
            active: 0,
            waiting: 0,
            completed: 0,
            cancelled: 0,
            failed: 0,
            avg_completion_time_secs: 0.0,
        };
        let mut total_completion_secs = 0.0;
        for instance in self.store.for_journey(journey_id) {
            stats.total_entered += 1;
            match instance.status {
                InstanceStatus::Active => stats.active += 1,
                InstanceStatus::Waiting => stats.waiting += 1,
                InstanceStatus::Completed => {
                    stats.completed += 1;
                    total_completion_secs += instance
                        .updated_at
                        .signed_duration_since(instance.entered_at)
                        .num_seconds() as f64;
                }
                InstanceStatus::Cancelled => stats.cancelled += 1,
                InstanceStatus::Failed => stats.failed += 1,
            }
        }
        if stats.completed > 0 {
            stats.avg_completion_time_secs = total_completion_secs / stats.completed as f64;
        }
        stats
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    fn try_enter(
        &self,
        reg: &RegisteredJourney,
        user_id: &str,
        iteration_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        let journey_id = reg.journey.id;
        let key = iteration_key.as_deref();

        // Invariant: one active instance per (journey, user, iteration_key).
        if self.store.load_active(journey_id, user_id, key).is_some() {
            debug!(journey_id = %journey_id, user_id = %user_id, "Instance already active, skipping entry");
            return None;
        }

        let re_enter_allowed = reg.journey.can_run_multiple
            || matches!(reg.graph.entry(), EntryNode::SegmentEntry { re_enter: true, .. });
        if !re_enter_allowed && self.store.has_entered(journey_id, user_id, key) {
            debug!(journey_id = %journey_id, user_id = %user_id, "Re-entry not permitted, skipping");
            return None;
        }

        let instance = JourneyInstance::new(
            journey_id,
            user_id,
            iteration_key,
            reg.graph.entry().child(),
            now,
        );
        let instance_id = instance.id;

        info!(
            instance_id = %instance_id,
            journey_id = %journey_id,
            user_id = %user_id,
            "User entered journey"
        );
        metrics::counter!("journey.instances_entered").increment(1);
        self.emit(EventType::JourneyEntered, &instance, None, now);

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock();
        if self.store.save(&instance).is_err() {
            return None;
        }
        self.drive(reg, instance, now);
        Some(instance_id)
    }

    // ------------------------------------------------------------------
    // Resumption
    // ------------------------------------------------------------------

    fn resume_due(&self, instance_id: Uuid, now: DateTime<Utc>) {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock();

        let Some(mut instance) = self.store.get(instance_id) else {
            return;
        };
        if instance.status != InstanceStatus::Waiting {
            return;
        }
        let Some(reg) = self.journeys.get(&instance.journey_id).map(|r| r.clone()) else {
            warn!(instance_id = %instance_id, "Journey no longer registered, cancelling instance");
            finalize(&mut instance, InstanceStatus::Cancelled, now);
            let _ = self.store.save(&instance);
            return;
        };

        match reg.journey.status {
            JourneyStatus::Active => {}
            // Paused/archived journeys schedule nothing; resume_journey
            // re-arms their timers from persisted state.
            _ => return,
        }

        // Stale pop: not actually due yet.
        if let Some(wake_at) = instance.wake_at {
            if wake_at > now {
                let _ = self.store.schedule_wake(instance_id, wake_at);
                return;
            }
        }

        // Wait-for timeout: no watched segment fired in time.
        if !instance.waiting_for.is_empty() {
            let node_id = match &instance.position {
                InstancePosition::Node(id) => id.clone(),
                _ => return,
            };
            let timeout_child = match reg.graph.node(&node_id) {
                Ok(JourneyBodyNode::WaitFor { timeout_child, .. }) => timeout_child.clone(),
                _ => {
                    self.halt(&mut instance, "wait-for state desynced from definition", now);
                    return;
                }
            };
            record(&mut instance, &node_id, "wait_for", now);
            instance.waiting_for.clear();
            advance_to(&mut instance, &timeout_child);
        }

        instance.status = InstanceStatus::Active;
        self.drive(&reg, instance, now);
    }

    /// Routes a wait-for instance to the child watching the segment that
    /// just fired. Single-winner: the timeout and remaining watches disarm.
    fn resolve_watch(&self, instance_id: Uuid, update: &SegmentUpdate, now: DateTime<Utc>) {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock();

        let Some(mut instance) = self.store.get(instance_id) else {
            return;
        };
        if instance.status != InstanceStatus::Waiting || instance.user_id != update.user_id {
            return;
        }
        let Some(winner) = instance
            .waiting_for
            .iter()
            .find(|w| w.segment_id == update.segment_id)
            .cloned()
        else {
            return;
        };
        let Some(reg) = self.journeys.get(&instance.journey_id).map(|r| r.clone()) else {
            return;
        };
        if reg.journey.status != JourneyStatus::Active {
            return;
        }

        debug!(
            instance_id = %instance_id,
            segment_id = %update.segment_id,
            "Wait-for watch fired"
        );
        let _ = self.store.cancel_wake(instance_id);
        if let InstancePosition::Node(node_id) = instance.position.clone() {
            record(&mut instance, &node_id, "wait_for", now);
        }
        instance.waiting_for.clear();
        advance_to(&mut instance, &winner.child);
        instance.status = InstanceStatus::Active;
        self.drive(&reg, instance, now);
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Runs the instance forward and persists the outcome. Traversal errors
    /// are recorded against the instance and never propagate to the caller.
    fn drive(&self, reg: &RegisteredJourney, mut instance: JourneyInstance, now: DateTime<Utc>) {
        if let Err(error) = self.run_instance(reg, &mut instance, now) {
            self.halt(&mut instance, &error.to_string(), now);
            return;
        }
        instance.updated_at = now;
        if let Err(error) = self.store.save(&instance) {
            warn!(instance_id = %instance.id, %error, "Failed to persist instance");
        }
    }

    fn run_instance(
        &self,
        reg: &RegisteredJourney,
        instance: &mut JourneyInstance,
        now: DateTime<Utc>,
    ) -> PulseResult<()> {
        loop {
            let node_id = match &instance.position {
                InstancePosition::Node(id) => id.clone(),
                _ => return Ok(()),
            };

            if node_id == EXIT_NODE_ID {
                self.complete(instance, now);
                return Ok(());
            }

            let node = reg.graph.node(&node_id)?.clone();
            debug!(
                instance_id = %instance.id,
                node_id = %node_id,
                kind = node.kind(),
                "Processing journey node"
            );

            match node {
                JourneyBodyNode::Delay { variant, child, .. } => {
                    // A set wake_at means we parked here earlier and the
                    // timer has elapsed.
                    if let Some(wake_at) = instance.wake_at {
                        if wake_at <= now {
                            record(instance, &node_id, "delay", now);
                            advance_to(instance, &child);
                            continue;
                        }
                        instance.status = InstanceStatus::Waiting;
                        return Ok(());
                    }

                    let wake_at = match self.compute_delay(&variant, &instance.user_id, now) {
                        Ok(at) => at,
                        Err(reason) => {
                            self.halt(instance, &reason, now);
                            return Ok(());
                        }
                    };
                    if wake_at <= now {
                        record(instance, &node_id, "delay", now);
                        advance_to(instance, &child);
                        continue;
                    }
                    instance.wake_at = Some(wake_at);
                    instance.status = InstanceStatus::Waiting;
                    self.store.schedule_wake(instance.id, wake_at)?;
                    return Ok(());
                }

                JourneyBodyNode::RateLimit { child, .. } => {
                    instance.wake_at = None;
                    let mark_key = (instance.journey_id, instance.user_id.clone());
                    let interval =
                        Duration::seconds(self.config.rate_limit_interval_secs as i64);
                    let last_pass = self.rate_marks.get(&mark_key).map(|m| *m);
                    match last_pass {
                        Some(last) if now.signed_duration_since(last) < interval => {
                            // Parked; retried once the interval elapses.
                            let wake_at = last + interval;
                            instance.wake_at = Some(wake_at);
                            instance.status = InstanceStatus::Waiting;
                            self.store.schedule_wake(instance.id, wake_at)?;
                            return Ok(());
                        }
                        _ => {
                            self.rate_marks.insert(mark_key, now);
                            record(instance, &node_id, "rate_limit", now);
                            advance_to(instance, &child);
                        }
                    }
                }

                JourneyBodyNode::SegmentSplit {
                    variant:
                        SegmentSplitVariant::Boolean {
                            segment,
                            true_child,
                            false_child,
                        },
                    ..
                } => {
                    // Fresh evaluation at traversal time, never a cached
                    // membership.
                    let facts = self.facts.facts(&instance.user_id)?;
                    let evaluation = self.segments.evaluate(&segment, &facts, now)?;
                    record(instance, &node_id, "segment_split", now);
                    let next = if evaluation.member {
                        true_child
                    } else {
                        false_child
                    };
                    advance_to(instance, &next);
                }

                JourneyBodyNode::Message {
                    subscription_group_id,
                    variant,
                    sync_properties,
                    skip_on_failure,
                    child,
                    ..
                } => {
                    let facts = self.facts.facts(&instance.user_id)?;

                    // Subscription gating: skip the send, advance anyway.
                    let unsubscribed = subscription_group_id
                        .as_deref()
                        .map_or(false, |group| {
                            facts.subscriptions.get(group).copied() == Some(false)
                        });
                    if unsubscribed {
                        debug!(
                            instance_id = %instance.id,
                            node_id = %node_id,
                            "User unsubscribed, skipping send"
                        );
                        metrics::counter!("journey.messages_skipped").increment(1);
                        self.emit(EventType::MessageSkipped, instance, Some(&node_id), now);
                        record(instance, &node_id, "message", now);
                        advance_to(instance, &child);
                        continue;
                    }

                    let request = MessageRequest {
                        user_id: instance.user_id.clone(),
                        journey_id: instance.journey_id,
                        node_id: node_id.clone(),
                        channel: variant.channel(),
                        template_id: variant.template_id().to_string(),
                        provider_override: variant.provider_override().map(str::to_string),
                        properties: sync_properties.then(|| facts.traits.clone()),
                    };
                    match self.dispatcher.send(&request) {
                        Ok(receipt) => {
                            debug!(
                                instance_id = %instance.id,
                                provider_message_id = %receipt.provider_message_id,
                                "Message dispatched"
                            );
                            metrics::counter!("journey.messages_sent").increment(1);
                            self.emit(EventType::MessageSent, instance, Some(&node_id), now);
                            record(instance, &node_id, "message", now);
                            advance_to(instance, &child);
                        }
                        Err(DispatchError::SkippedSubscriptionState) => {
                            metrics::counter!("journey.messages_skipped").increment(1);
                            self.emit(EventType::MessageSkipped, instance, Some(&node_id), now);
                            record(instance, &node_id, "message", now);
                            advance_to(instance, &child);
                        }
                        Err(error) if skip_on_failure => {
                            warn!(
                                instance_id = %instance.id,
                                node_id = %node_id,
                                %error,
                                "Dispatch failed, skipping per node policy"
                            );
                            metrics::counter!("journey.messages_failed").increment(1);
                            self.emit(EventType::MessageFailed, instance, Some(&node_id), now);
                            record(instance, &node_id, "message", now);
                            advance_to(instance, &child);
                        }
                        Err(error) => {
                            metrics::counter!("journey.messages_failed").increment(1);
                            self.emit(EventType::MessageFailed, instance, Some(&node_id), now);
                            self.halt(
                                instance,
                                &format!("dispatch failed at node {node_id}: {error}"),
                                now,
                            );
                            return Ok(());
                        }
                    }
                }

                JourneyBodyNode::ExperimentSplit { variants, .. } => {
                    let bucket = bucket_scoped(&instance.user_id, &node_id);
                    let total: f64 = variants.iter().map(|v| v.percent).sum();
                    let mut cumulative = 0.0;
                    let mut chosen = variants
                        .last()
                        .map(|v| v.child.clone())
                        .ok_or_else(|| {
                            PulseError::Definition(format!(
                                "experiment split {node_id} has no variants"
                            ))
                        })?;
                    for variant in &variants {
                        cumulative += variant.percent / total;
                        if bucket < cumulative {
                            chosen = variant.child.clone();
                            break;
                        }
                    }
                    record(instance, &node_id, "experiment_split", now);
                    advance_to(instance, &chosen);
                }

                JourneyBodyNode::WaitFor {
                    timeout_seconds,
                    timeout_child,
                    segment_children,
                    ..
                } => {
                    // A segment already satisfied at arming time wins the
                    // race immediately.
                    let facts = self.facts.facts(&instance.user_id)?;
                    let mut winner = None;
                    for watch in &segment_children {
                        match self.segments.evaluate(&watch.segment_id, &facts, now) {
                            Ok(evaluation) if evaluation.member => {
                                winner = Some(watch.child.clone());
                                break;
                            }
                            Ok(_) => {}
                            Err(error) => {
                                // Unregistered segments may appear later;
                                // the timeout still guards the wait.
                                warn!(
                                    instance_id = %instance.id,
                                    segment_id = %watch.segment_id,
                                    %error,
                                    "Wait-for segment not evaluable at arming"
                                );
                            }
                        }
                    }
                    if let Some(child) = winner {
                        record(instance, &node_id, "wait_for", now);
                        advance_to(instance, &child);
                        continue;
                    }

                    let wake_at = now + Duration::seconds(timeout_seconds as i64);
                    instance.waiting_for = segment_children;
                    instance.wake_at = Some(wake_at);
                    instance.status = InstanceStatus::Waiting;
                    self.store.schedule_wake(instance.id, wake_at)?;
                    return Ok(());
                }
            }
        }
    }

    fn complete(&self, instance: &mut JourneyInstance, now: DateTime<Utc>) {
        instance.position = InstancePosition::Terminated;
        finalize(instance, InstanceStatus::Completed, now);
        info!(
            instance_id = %instance.id,
            journey_id = %instance.journey_id,
            user_id = %instance.user_id,
            "Journey instance completed"
        );
        metrics::counter!("journey.instances_completed").increment(1);
        self.emit(EventType::JourneyCompleted, instance, None, now);
    }

    /// Halts the instance in a terminal failed state, visible to operators.
    /// Does not retry and does not affect other instances.
    fn halt(&self, instance: &mut JourneyInstance, reason: &str, now: DateTime<Utc>) {
        warn!(
            instance_id = %instance.id,
            journey_id = %instance.journey_id,
            reason = %reason,
            "Journey instance halted"
        );
        let _ = self.store.cancel_wake(instance.id);
        instance.failure = Some(reason.to_string());
        finalize(instance, InstanceStatus::Failed, now);
        metrics::counter!("journey.instances_failed").increment(1);
        self.emit(EventType::InstanceFailed, instance, None, now);
        if let Err(error) = self.store.save(instance) {
            warn!(instance_id = %instance.id, %error, "Failed to persist halted instance");
        }
    }

    // ------------------------------------------------------------------
    // Delay computation
    // ------------------------------------------------------------------

    fn compute_delay(
        &self,
        variant: &DelayVariant,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, String> {
        match variant {
            DelayVariant::Seconds { seconds } => Ok(now + Duration::seconds(*seconds as i64)),
            DelayVariant::LocalTime {
                hour,
                minute,
                allowed_days_of_week,
            } => Ok(next_local_slot(
                now,
                *hour,
                *minute,
                allowed_days_of_week.as_deref(),
                self.config.reference_utc_offset_minutes,
            )),
            DelayVariant::UserProperty {
                user_property,
                offset_seconds,
                offset_direction,
            } => {
                let traits = self
                    .facts
                    .traits(user_id)
                    .map_err(|e| format!("fact store error: {e}"))?;
                let base = json_path(&traits, user_property)
                    .and_then(parse_timestamp)
                    .ok_or_else(|| {
                        format!("user property {user_property} missing or not a timestamp")
                    })?;
                let offset = Duration::seconds(*offset_seconds as i64);
                Ok(match offset_direction {
                    OffsetDirection::Before => base - offset,
                    OffsetDirection::After => base + offset,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn instance_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.instance_locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(
        &self,
        event_type: EventType,
        instance: &JourneyInstance,
        node_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let mut event = make_event(event_type, &instance.user_id, now);
        event.journey_id = Some(instance.journey_id);
        event.instance_id = Some(instance.id);
        event.node_id = node_id.map(str::to_string);
        self.events.emit(event);
    }
}

fn advance_to(instance: &mut JourneyInstance, child: &str) {
    instance.position = InstancePosition::Node(child.to_string());
    instance.wake_at = None;
}

fn record(instance: &mut JourneyInstance, node_id: &str, kind: &str, now: DateTime<Utc>) {
    instance.history.push(NodeExecution {
        node_id: node_id.to_string(),
        kind: kind.to_string(),
        at: now,
    });
}

fn stringify(value: &serde_json::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Next instant whose local time-of-day is `hour:minute` in the reference
/// timezone, on an allowed weekday. Day indices are 0=Sunday..6=Saturday.
fn next_local_slot(
    now: DateTime<Utc>,
    hour: u32,
    minute: u32,
    allowed_days: Option<&[u8]>,
    utc_offset_minutes: i32,
) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    let local_now = now.with_timezone(&offset);

    for day in 0..=7u64 {
        let date = local_now.date_naive() + chrono::Days::new(day);
        let weekday = date.weekday().num_days_from_sunday() as u8;
        if allowed_days.map_or(false, |days| !days.contains(&weekday)) {
            continue;
        }
        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
            continue;
        };
        let Some(candidate) = offset.from_local_datetime(&naive).single() else {
            continue;
        };
        if candidate > local_now {
            return candidate.with_timezone(&Utc);
        }
    }
    // Unreachable with validated definitions (some weekday is allowed).
    now
}
