//! End-to-end journey scenarios: entry triggers, durable delays, wait-for
//! races, branching, rate limiting, and failure policies.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use pulse_core::event_bus::{capture_sink, CaptureSink};
use pulse_core::types::EventType;
use pulse_core::JourneyConfig;
use pulse_journey::dispatch::DispatchError;
use pulse_journey::types::{
    DelayVariant, EntryNode, ExitNode, InstanceStatus, Journey, JourneyBodyNode,
    JourneyDefinition, JourneyStatus, MessageVariant, OffsetDirection, SegmentSplitVariant,
    WaitForSegmentChild, EXIT_NODE_ID,
};
use pulse_journey::{CaptureDispatcher, JourneyEngine, MemoryInstanceStore};
use pulse_segmentation::builder::{performed_segment, trait_segment};
use pulse_segmentation::{FactStore, MemoryFactStore, SegmentationEngine};

struct Harness {
    segments: Arc<SegmentationEngine>,
    facts: Arc<MemoryFactStore>,
    dispatcher: Arc<CaptureDispatcher>,
    sink: Arc<CaptureSink>,
    engine: JourneyEngine,
}

fn harness() -> Harness {
    harness_with_config(JourneyConfig::default())
}

fn harness_with_config(config: JourneyConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let segments = Arc::new(SegmentationEngine::new());
    let facts = Arc::new(MemoryFactStore::new());
    let dispatcher = Arc::new(CaptureDispatcher::new());
    let sink = capture_sink();
    let engine = JourneyEngine::new(
        Arc::clone(&segments),
        facts.clone(),
        dispatcher.clone(),
        Arc::new(MemoryInstanceStore::new()),
        config,
    )
    .with_event_sink(sink.clone());
    Harness {
        segments,
        facts,
        dispatcher,
        sink,
        engine,
    }
}

impl Harness {
    /// Recompute segments for a user and feed the transitions through the
    /// journey engine, mirroring the platform's fact-change data flow.
    fn propagate(&self, user_id: &str, now: DateTime<Utc>) {
        let facts = self.facts.facts(user_id).unwrap();
        let updates = self.segments.recompute_user(&facts, now).unwrap();
        self.engine.handle_segment_updates(&updates, now);
    }
}

fn journey(entry_node: EntryNode, nodes: Vec<JourneyBodyNode>) -> Journey {
    let now = Utc::now();
    Journey {
        id: Uuid::new_v4(),
        name: "test journey".into(),
        status: JourneyStatus::Active,
        definition: JourneyDefinition {
            entry_node,
            exit_node: ExitNode::default(),
            nodes,
        },
        can_run_multiple: false,
        created_at: now,
        updated_at: now,
    }
}

fn email_node(id: &str, template: &str, child: &str) -> JourneyBodyNode {
    JourneyBodyNode::Message {
        id: id.into(),
        name: None,
        subscription_group_id: None,
        variant: MessageVariant::Email {
            template_id: template.into(),
            provider_override: None,
        },
        sync_properties: false,
        skip_on_failure: false,
        child: child.into(),
    }
}

fn event_entry(event: &str, child: &str) -> EntryNode {
    EntryNode::EventEntry {
        event: event.into(),
        key: None,
        child: child.into(),
    }
}

#[test]
fn test_signup_delay_message_flow() {
    let h = harness();
    let t0 = Utc::now();

    let j = journey(
        event_entry("signup", "delay"),
        vec![
            JourneyBodyNode::Delay {
                id: "delay".into(),
                variant: DelayVariant::Seconds { seconds: 3600 },
                child: "welcome".into(),
            },
            email_node("welcome", "tmpl-welcome", EXIT_NODE_ID),
        ],
    );
    h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "signup", &json!({}), t0);
    assert_eq!(entered.len(), 1);
    let instance_id = entered[0];

    let instance = h.engine.get_instance(instance_id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(instance.wake_at, Some(t0 + Duration::seconds(3600)));

    // Nothing sends before the delay elapses.
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(1800)), 0);
    assert_eq!(h.dispatcher.count(), 0);

    // Exactly one send of the template at T0+3600.
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(3601)), 1);
    assert_eq!(h.dispatcher.count(), 1);
    assert_eq!(h.dispatcher.sent()[0].template_id, "tmpl-welcome");

    let instance = h.engine.get_instance(instance_id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    // Further sweeps send nothing.
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(7200)), 0);
    assert_eq!(h.dispatcher.count(), 1);

    assert_eq!(h.sink.count_type(EventType::JourneyEntered), 1);
    assert_eq!(h.sink.count_type(EventType::MessageSent), 1);
    assert_eq!(h.sink.count_type(EventType::JourneyCompleted), 1);
}

#[test]
fn test_cancelled_instance_sends_nothing() {
    let h = harness();
    let t0 = Utc::now();

    let j = journey(
        event_entry("signup", "delay"),
        vec![
            JourneyBodyNode::Delay {
                id: "delay".into(),
                variant: DelayVariant::Seconds { seconds: 3600 },
                child: "welcome".into(),
            },
            email_node("welcome", "tmpl-welcome", EXIT_NODE_ID),
        ],
    );
    h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "signup", &json!({}), t0);
    h.engine.cancel_instance(entered[0], t0 + Duration::seconds(10)).unwrap();

    h.engine.process_due(t0 + Duration::seconds(3601));
    assert_eq!(h.dispatcher.count(), 0);
    let instance = h.engine.get_instance(entered[0]).unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
}

#[test]
fn test_segment_entry_without_reentry_runs_once() {
    let h = harness();
    let t0 = Utc::now();
    h.segments
        .register_segment(trait_segment("pro-users", "plan", "pro"))
        .unwrap();

    let j = journey(
        EntryNode::SegmentEntry {
            segment: "pro-users".into(),
            child: "m".into(),
            re_enter: false,
        },
        vec![email_node("m", "tmpl-pro", EXIT_NODE_ID)],
    );
    h.engine.register_journey(j).unwrap();

    // Membership toggles true -> false -> true; only the first entry runs.
    h.facts.set_trait("user-1", "plan", json!("pro"), t0);
    h.propagate("user-1", t0);
    assert_eq!(h.dispatcher.count(), 1);

    h.facts
        .set_trait("user-1", "plan", json!("free"), t0 + Duration::seconds(10));
    h.propagate("user-1", t0 + Duration::seconds(10));
    h.facts
        .set_trait("user-1", "plan", json!("pro"), t0 + Duration::seconds(20));
    h.propagate("user-1", t0 + Duration::seconds(20));

    assert_eq!(h.dispatcher.count(), 1);
    assert_eq!(h.sink.count_type(EventType::JourneyEntered), 1);
}

#[test]
fn test_segment_entry_with_reentry_spawns_new_instances() {
    let h = harness();
    let t0 = Utc::now();
    h.segments
        .register_segment(trait_segment("pro-users", "plan", "pro"))
        .unwrap();

    let j = journey(
        EntryNode::SegmentEntry {
            segment: "pro-users".into(),
            child: "m".into(),
            re_enter: true,
        },
        vec![email_node("m", "tmpl-pro", EXIT_NODE_ID)],
    );
    h.engine.register_journey(j).unwrap();

    h.facts.set_trait("user-1", "plan", json!("pro"), t0);
    h.propagate("user-1", t0);
    h.facts
        .set_trait("user-1", "plan", json!("free"), t0 + Duration::seconds(10));
    h.propagate("user-1", t0 + Duration::seconds(10));
    h.facts
        .set_trait("user-1", "plan", json!("pro"), t0 + Duration::seconds(20));
    h.propagate("user-1", t0 + Duration::seconds(20));

    assert_eq!(h.dispatcher.count(), 2);
}

#[test]
fn test_wait_for_segment_beats_timeout() {
    let h = harness();
    let t0 = Utc::now();
    h.segments
        .register_segment(performed_segment("purchased", "purchase"))
        .unwrap();

    let j = journey(
        event_entry("checkout_started", "wait"),
        vec![
            JourneyBodyNode::WaitFor {
                id: "wait".into(),
                timeout_seconds: 60,
                timeout_child: "reminder".into(),
                segment_children: vec![WaitForSegmentChild {
                    segment_id: "purchased".into(),
                    child: "thanks".into(),
                }],
            },
            email_node("thanks", "tmpl-thanks", EXIT_NODE_ID),
            email_node("reminder", "tmpl-reminder", EXIT_NODE_ID),
        ],
    );
    h.engine.register_journey(j).unwrap();

    let entered = h
        .engine
        .handle_event("user-1", "checkout_started", &json!({}), t0);
    assert_eq!(entered.len(), 1);
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Waiting
    );

    // Purchase at t+30 wins the race.
    let t30 = t0 + Duration::seconds(30);
    h.facts.track_event("user-1", "purchase", json!({}), t30);
    h.propagate("user-1", t30);

    assert_eq!(h.dispatcher.count(), 1);
    assert_eq!(h.dispatcher.sent()[0].template_id, "tmpl-thanks");
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Completed
    );

    // The disarmed timeout fires nothing.
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(61)), 0);
    assert_eq!(h.dispatcher.count(), 1);
}

#[test]
fn test_wait_for_times_out_without_match() {
    let h = harness();
    let t0 = Utc::now();
    h.segments
        .register_segment(performed_segment("purchased", "purchase"))
        .unwrap();

    let j = journey(
        event_entry("checkout_started", "wait"),
        vec![
            JourneyBodyNode::WaitFor {
                id: "wait".into(),
                timeout_seconds: 60,
                timeout_child: "reminder".into(),
                segment_children: vec![WaitForSegmentChild {
                    segment_id: "purchased".into(),
                    child: "thanks".into(),
                }],
            },
            email_node("thanks", "tmpl-thanks", EXIT_NODE_ID),
            email_node("reminder", "tmpl-reminder", EXIT_NODE_ID),
        ],
    );
    h.engine.register_journey(j).unwrap();

    h.engine
        .handle_event("user-1", "checkout_started", &json!({}), t0);
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(61)), 1);
    assert_eq!(h.dispatcher.count(), 1);
    assert_eq!(h.dispatcher.sent()[0].template_id, "tmpl-reminder");
}

#[test]
fn test_segment_split_branches_on_fresh_membership() {
    let h = harness();
    let t0 = Utc::now();
    h.segments
        .register_segment(trait_segment("vip", "tier", "vip"))
        .unwrap();

    let j = journey(
        event_entry("order_placed", "split"),
        vec![
            JourneyBodyNode::SegmentSplit {
                id: "split".into(),
                variant: SegmentSplitVariant::Boolean {
                    segment: "vip".into(),
                    true_child: "vip-offer".into(),
                    false_child: "standard".into(),
                },
            },
            email_node("vip-offer", "tmpl-vip", EXIT_NODE_ID),
            email_node("standard", "tmpl-standard", EXIT_NODE_ID),
        ],
    );
    let journey_id = h.engine.register_journey(j).unwrap();

    h.facts.set_trait("vip-user", "tier", json!("vip"), t0);
    h.engine
        .handle_event("vip-user", "order_placed", &json!({}), t0);
    h.engine
        .handle_event("plain-user", "order_placed", &json!({}), t0);

    let templates: Vec<String> = h
        .dispatcher
        .sent()
        .iter()
        .map(|r| r.template_id.clone())
        .collect();
    assert_eq!(templates, vec!["tmpl-vip", "tmpl-standard"]);

    let stats = h.engine.get_stats(journey_id);
    assert_eq!(stats.total_entered, 2);
    assert_eq!(stats.completed, 2);
}

#[test]
fn test_experiment_split_is_stable_and_covers_arms() {
    let h = harness();
    let t0 = Utc::now();

    let j = journey(
        event_entry("signup", "exp"),
        vec![
            JourneyBodyNode::ExperimentSplit {
                id: "exp".into(),
                variants: vec![
                    pulse_journey::types::ExperimentVariant {
                        child: "a".into(),
                        percent: 0.5,
                    },
                    pulse_journey::types::ExperimentVariant {
                        child: "b".into(),
                        percent: 0.5,
                    },
                ],
            },
            email_node("a", "tmpl-a", EXIT_NODE_ID),
            email_node("b", "tmpl-b", EXIT_NODE_ID),
        ],
    );
    h.engine.register_journey(j).unwrap();

    for i in 0..50 {
        h.engine
            .handle_event(&format!("user-{i}"), "signup", &json!({}), t0);
    }
    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 50);
    let a_count = sent.iter().filter(|r| r.template_id == "tmpl-a").count();
    assert!(a_count > 5 && a_count < 45, "lopsided split: {a_count}/50");

    // The same user always lands on the same arm.
    let h2 = harness();
    let j2 = journey(
        event_entry("signup", "exp"),
        vec![
            JourneyBodyNode::ExperimentSplit {
                id: "exp".into(),
                variants: vec![
                    pulse_journey::types::ExperimentVariant {
                        child: "a".into(),
                        percent: 0.5,
                    },
                    pulse_journey::types::ExperimentVariant {
                        child: "b".into(),
                        percent: 0.5,
                    },
                ],
            },
            email_node("a", "tmpl-a", EXIT_NODE_ID),
            email_node("b", "tmpl-b", EXIT_NODE_ID),
        ],
    );
    h2.engine.register_journey(j2).unwrap();
    for i in 0..50 {
        h2.engine
            .handle_event(&format!("user-{i}"), "signup", &json!({}), t0);
    }
    let arms: Vec<String> = sent
        .iter()
        .map(|r| format!("{}:{}", r.user_id, r.template_id))
        .collect();
    let arms2: Vec<String> = h2
        .dispatcher
        .sent()
        .iter()
        .map(|r| format!("{}:{}", r.user_id, r.template_id))
        .collect();
    assert_eq!(arms, arms2);
}

#[test]
fn test_keyed_event_entry_partitions_instances() {
    let h = harness();
    let t0 = Utc::now();

    let mut j = journey(
        EntryNode::EventEntry {
            event: "order_shipped".into(),
            key: Some("orderId".into()),
            child: "m".into(),
        },
        vec![email_node("m", "tmpl-shipped", EXIT_NODE_ID)],
    );
    j.can_run_multiple = false;
    h.engine.register_journey(j).unwrap();

    h.engine
        .handle_event("user-1", "order_shipped", &json!({"orderId": "o1"}), t0);
    h.engine
        .handle_event("user-1", "order_shipped", &json!({"orderId": "o2"}), t0);
    // Same key again: no new instance.
    h.engine
        .handle_event("user-1", "order_shipped", &json!({"orderId": "o1"}), t0);
    // Missing key: no entry at all.
    h.engine
        .handle_event("user-1", "order_shipped", &json!({}), t0);

    assert_eq!(h.dispatcher.count(), 2);
}

#[test]
fn test_rate_limit_parks_until_interval_elapses() {
    let mut config = JourneyConfig::default();
    config.rate_limit_interval_secs = 100;
    let h = harness_with_config(config);
    let t0 = Utc::now();

    let mut j = journey(
        EntryNode::EventEntry {
            event: "alert".into(),
            key: Some("alertId".into()),
            child: "limit".into(),
        },
        vec![
            JourneyBodyNode::RateLimit {
                id: "limit".into(),
                child: "m".into(),
            },
            email_node("m", "tmpl-alert", EXIT_NODE_ID),
        ],
    );
    j.can_run_multiple = true;
    h.engine.register_journey(j).unwrap();

    h.engine
        .handle_event("user-1", "alert", &json!({"alertId": "a1"}), t0);
    assert_eq!(h.dispatcher.count(), 1);

    // Second instance inside the interval parks at the rate limit.
    let entered = h.engine.handle_event(
        "user-1",
        "alert",
        &json!({"alertId": "a2"}),
        t0 + Duration::seconds(10),
    );
    assert_eq!(h.dispatcher.count(), 1);
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Waiting
    );

    // Still throttled mid-interval, passes after it.
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(50)), 0);
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(101)), 1);
    assert_eq!(h.dispatcher.count(), 2);
}

#[test]
fn test_subscription_gate_skips_send_but_advances() {
    let h = harness();
    let t0 = Utc::now();
    h.facts.set_subscription("user-1", "newsletter", false);

    let j = journey(
        event_entry("signup", "m"),
        vec![JourneyBodyNode::Message {
            id: "m".into(),
            name: None,
            subscription_group_id: Some("newsletter".into()),
            variant: MessageVariant::Email {
                template_id: "tmpl-news".into(),
                provider_override: None,
            },
            sync_properties: false,
            skip_on_failure: false,
            child: EXIT_NODE_ID.into(),
        }],
    );
    h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "signup", &json!({}), t0);
    assert_eq!(h.dispatcher.count(), 0);
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Completed
    );
    assert_eq!(h.sink.count_type(EventType::MessageSkipped), 1);
}

#[test]
fn test_dispatch_failure_respects_skip_policy() {
    // skip_on_failure = true: log, advance, complete.
    let h = harness();
    let t0 = Utc::now();
    h.dispatcher
        .set_failure(Some(DispatchError::ProviderTransient("smtp down".into())));

    let mut node = email_node("m", "tmpl-x", EXIT_NODE_ID);
    if let JourneyBodyNode::Message { skip_on_failure, .. } = &mut node {
        *skip_on_failure = true;
    }
    let j = journey(event_entry("signup", "m"), vec![node]);
    h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "signup", &json!({}), t0);
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Completed
    );
    assert_eq!(h.sink.count_type(EventType::MessageFailed), 1);

    // skip_on_failure = false: terminal failed state, visible to operators.
    let h = harness();
    h.dispatcher
        .set_failure(Some(DispatchError::ProviderMisconfigured("no key".into())));
    let j = journey(
        event_entry("signup", "m"),
        vec![email_node("m", "tmpl-x", EXIT_NODE_ID)],
    );
    let journey_id = h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "signup", &json!({}), t0);
    let instance = h.engine.get_instance(entered[0]).unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.failure.unwrap().contains("dispatch failed"));
    assert_eq!(h.engine.get_stats(journey_id).failed, 1);
}

#[test]
fn test_user_property_delay() {
    let h = harness();
    let t0 = Utc::now();
    let appointment = t0 + Duration::seconds(10_000);
    h.facts
        .set_trait("user-1", "appointment_at", json!(appointment.to_rfc3339()), t0);

    let j = journey(
        event_entry("booked", "delay"),
        vec![
            JourneyBodyNode::Delay {
                id: "delay".into(),
                variant: DelayVariant::UserProperty {
                    user_property: "appointment_at".into(),
                    offset_seconds: 3600,
                    offset_direction: OffsetDirection::Before,
                },
                child: "m".into(),
            },
            email_node("m", "tmpl-reminder", EXIT_NODE_ID),
        ],
    );
    h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "booked", &json!({}), t0);
    let instance = h.engine.get_instance(entered[0]).unwrap();
    assert_eq!(instance.wake_at, Some(appointment - Duration::seconds(3600)));

    // A user without the property halts in a failed state.
    let entered = h.engine.handle_event("user-2", "booked", &json!({}), t0);
    let instance = h.engine.get_instance(entered[0]).unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance
        .failure
        .unwrap()
        .contains("appointment_at missing"));
}

#[test]
fn test_pause_stops_wakeups_and_resume_continues() {
    let h = harness();
    let t0 = Utc::now();

    let j = journey(
        event_entry("signup", "delay"),
        vec![
            JourneyBodyNode::Delay {
                id: "delay".into(),
                variant: DelayVariant::Seconds { seconds: 60 },
                child: "m".into(),
            },
            email_node("m", "tmpl-welcome", EXIT_NODE_ID),
        ],
    );
    let journey_id = h.engine.register_journey(j).unwrap();

    let entered = h.engine.handle_event("user-1", "signup", &json!({}), t0);
    h.engine.pause_journey(&journey_id).unwrap();

    // The due wake is dropped while paused; no send happens.
    h.engine.process_due(t0 + Duration::seconds(61));
    assert_eq!(h.dispatcher.count(), 0);
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Waiting
    );

    // Resume re-arms from persisted state and the instance continues.
    h.engine
        .resume_journey(&journey_id, t0 + Duration::seconds(90))
        .unwrap();
    assert_eq!(h.engine.process_due(t0 + Duration::seconds(91)), 1);
    assert_eq!(h.dispatcher.count(), 1);
    assert_eq!(
        h.engine.get_instance(entered[0]).unwrap().status,
        InstanceStatus::Completed
    );
}

#[test]
fn test_sync_properties_snapshots_traits() {
    let h = harness();
    let t0 = Utc::now();
    h.facts.set_trait("user-1", "first_name", json!("Ada"), t0);

    let j = journey(
        event_entry("signup", "m"),
        vec![JourneyBodyNode::Message {
            id: "m".into(),
            name: None,
            subscription_group_id: None,
            variant: MessageVariant::Email {
                template_id: "tmpl-welcome".into(),
                provider_override: None,
            },
            sync_properties: true,
            skip_on_failure: false,
            child: EXIT_NODE_ID.into(),
        }],
    );
    h.engine.register_journey(j).unwrap();

    h.engine.handle_event("user-1", "signup", &json!({}), t0);
    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].properties.as_ref().unwrap()["first_name"],
        json!("Ada")
    );
}
