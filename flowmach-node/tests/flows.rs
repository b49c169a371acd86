//! End-to-end flows across two loopback nodes: session ping-pong under
//! injected transient faults, duplicate delivery, exactly-once async
//! operations, retry exhaustion, construction failures, suspension timeouts
//! and restart recovery.

use async_trait::async_trait;
use flowmach_core::errors::FlowError;
use flowmach_core::events::RuntimeEvent;
use flowmach_core::logic::{FlowLogic, StepInput, StepTransition, SuspendRequest};
use flowmach_core::ops::AsyncOperation;
use flowmach_core::retry::RetryPolicy;
use flowmach_core::store::{CheckpointStore, MemoryStore};
use flowmach_core::types::*;
use flowmach_node::{FlowRegistry, LoopbackHub, Node, NodeConfig};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared fault injector: `trip` returns true exactly once per key, so each
/// planned fault fires on the first visit and lets the retry through.
#[derive(Clone, Default)]
struct FaultPlan {
    tripped: Arc<Mutex<HashSet<String>>>,
}

impl FaultPlan {
    fn trip(&self, key: String) -> bool {
        self.tripped.lock().unwrap().insert(key)
    }

    fn count(&self) -> usize {
        self.tripped.lock().unwrap().len()
    }
}

fn session_field(state: &Value) -> Result<SessionId, FlowError> {
    state["sid"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FlowError::Fatal("state is missing the session id".into()))
}

/// Initiator side of the ping-pong protocol: for each of `sessions`
/// sessions, runs `iterations` send/receive round trips (sending `i`,
/// expecting `i + 1` back), then sends a null end marker and moves on.
/// Completes with `"{sessions}:{iterations}"`.
struct PingPongInitiator {
    peer: String,
    faults: Option<FaultPlan>,
}

impl FlowLogic for PingPongInitiator {
    fn construct(&self, args: &Value) -> Result<Value, FlowError> {
        let sessions = args["sessions"]
            .as_u64()
            .ok_or_else(|| FlowError::Construction("sessions argument required".into()))?;
        let iterations = args["iterations"]
            .as_u64()
            .ok_or_else(|| FlowError::Construction("iterations argument required".into()))?;
        Ok(json!({
            "sessions": sessions,
            "iterations": iterations,
            "s": 0,
            "i": 0,
            "sid": null,
            "closing": false,
        }))
    }

    fn step(&self, state: Value, input: StepInput) -> Result<StepTransition, FlowError> {
        let n = state["sessions"].as_u64().unwrap_or(0);
        let m = state["iterations"].as_u64().unwrap_or(0);
        let s = state["s"].as_u64().unwrap_or(0);
        let i = state["i"].as_u64().unwrap_or(0);
        match input {
            StepInput::Begin => Ok(StepTransition::suspend(
                state,
                SuspendRequest::Initiate {
                    peer: self.peer.clone(),
                },
            )
            .with_progress("OPENING")),

            StepInput::SessionEstablished { session } => {
                let mut next = state;
                next["sid"] = json!(session);
                Ok(StepTransition::suspend(
                    next,
                    SuspendRequest::Send {
                        session,
                        payload: json!(i),
                    },
                ))
            }

            StepInput::Delivered => {
                if state["closing"].as_bool().unwrap_or(false) {
                    let mut next = state;
                    next["closing"] = json!(false);
                    next["s"] = json!(s + 1);
                    next["i"] = json!(0);
                    next["sid"] = Value::Null;
                    if s + 1 < n {
                        Ok(StepTransition::suspend(
                            next,
                            SuspendRequest::Initiate {
                                peer: self.peer.clone(),
                            },
                        ))
                    } else {
                        Ok(
                            StepTransition::complete(next, json!(format!("{n}:{m}")))
                                .with_progress("DONE"),
                        )
                    }
                } else {
                    let sid = session_field(&state)?;
                    Ok(StepTransition::suspend(
                        state,
                        SuspendRequest::Receive { session: sid },
                    ))
                }
            }

            StepInput::Message { payload, .. } => {
                if let Some(faults) = &self.faults {
                    if i == m / 2 && faults.trip(format!("initiator:{s}:{i}")) {
                        return Err(FlowError::Transient("injected initiator fault".into()));
                    }
                }
                let got = payload
                    .as_u64()
                    .ok_or_else(|| FlowError::UnexpectedMessageShape("expected a number".into()))?;
                if got != i + 1 {
                    return Err(FlowError::Fatal(format!("sent {i}, peer answered {got}")));
                }
                let sid = session_field(&state)?;
                let mut next = state;
                if i + 1 < m {
                    next["i"] = json!(i + 1);
                    Ok(StepTransition::suspend(
                        next,
                        SuspendRequest::Send {
                            session: sid,
                            payload: json!(i + 1),
                        },
                    ))
                } else {
                    next["closing"] = json!(true);
                    Ok(StepTransition::suspend(
                        next,
                        SuspendRequest::Send {
                            session: sid,
                            payload: Value::Null,
                        },
                    ))
                }
            }

            StepInput::AsyncResult { .. } => {
                Err(FlowError::Fatal("unexpected async result".into()))
            }
        }
    }
}

/// Responder side: echoes each number incremented by one; completes when
/// the null end marker arrives.
struct PingPongResponder {
    faults: Option<FaultPlan>,
}

impl FlowLogic for PingPongResponder {
    fn construct(&self, args: &Value) -> Result<Value, FlowError> {
        let sid = args["session"]
            .as_str()
            .ok_or_else(|| FlowError::Construction("session argument required".into()))?;
        Ok(json!({ "sid": sid }))
    }

    fn step(&self, state: Value, input: StepInput) -> Result<StepTransition, FlowError> {
        let sid = session_field(&state)?;
        match input {
            StepInput::Begin | StepInput::Delivered => Ok(StepTransition::suspend(
                state,
                SuspendRequest::Receive { session: sid },
            )),

            StepInput::Message { payload, .. } => {
                if payload.is_null() {
                    return Ok(StepTransition::complete(state, json!("served")));
                }
                let value = payload
                    .as_u64()
                    .ok_or_else(|| FlowError::UnexpectedMessageShape("expected a number".into()))?;
                if let Some(faults) = &self.faults {
                    if value == 3 && faults.trip(format!("responder:{sid}:{value}")) {
                        return Err(FlowError::Transient("injected responder fault".into()));
                    }
                }
                Ok(StepTransition::suspend(
                    state,
                    SuspendRequest::Send {
                        session: sid,
                        payload: json!(value + 1),
                    },
                ))
            }

            other => Err(FlowError::Fatal(format!("unexpected input: {other:?}"))),
        }
    }
}

/// Runs one async operation and completes with its result.
struct AsyncOnceFlow;

impl FlowLogic for AsyncOnceFlow {
    fn construct(&self, _args: &Value) -> Result<Value, FlowError> {
        Ok(json!({}))
    }

    fn step(&self, state: Value, input: StepInput) -> Result<StepTransition, FlowError> {
        match input {
            StepInput::Begin => Ok(StepTransition::suspend(
                state,
                SuspendRequest::ExecuteAsync {
                    op: "record-id".into(),
                    input: json!({}),
                },
            )),
            StepInput::AsyncResult { value } => Ok(StepTransition::complete(state, value)),
            other => Err(FlowError::Fatal(format!("unexpected input: {other:?}"))),
        }
    }
}

/// Fails transiently on the first invocation of each dedup id, succeeds on
/// any id it has already seen. Mirrors an external effect that committed
/// even though the first attempt reported failure.
#[derive(Default)]
struct RecordingOp {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl AsyncOperation for RecordingOp {
    async fn execute(&self, dedup_id: &DeduplicationId, _input: &Value) -> Result<Value, FlowError> {
        let mut seen = self.seen.lock().unwrap();
        if seen.iter().any(|id| id == dedup_id.as_str()) {
            return Ok(json!("Result"));
        }
        seen.push(dedup_id.to_string());
        Err(FlowError::Transient("first attempt fails".into()))
    }
}

/// Fails transiently on every step.
struct FlakyFlow;

impl FlowLogic for FlakyFlow {
    fn construct(&self, _args: &Value) -> Result<Value, FlowError> {
        Ok(json!({}))
    }

    fn step(&self, _state: Value, _input: StepInput) -> Result<StepTransition, FlowError> {
        Err(FlowError::Transient("backend unavailable".into()))
    }
}

/// Validates its arguments at construction time.
struct GuardedFlow;

impl FlowLogic for GuardedFlow {
    fn construct(&self, args: &Value) -> Result<Value, FlowError> {
        let amount = args["amount"]
            .as_u64()
            .ok_or_else(|| FlowError::Construction("amount argument required".into()))?;
        Ok(json!({ "amount": amount }))
    }

    fn step(&self, state: Value, input: StepInput) -> Result<StepTransition, FlowError> {
        match input {
            StepInput::Begin => {
                let amount = state["amount"].as_u64().unwrap_or(0);
                Ok(StepTransition::complete(state, json!(amount)))
            }
            other => Err(FlowError::Fatal(format!("unexpected input: {other:?}"))),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 2,
        multiplier: 2.0,
        max_delay_ms: 20,
    }
}

fn initiator_registry(peer: &str, faults: Option<FaultPlan>) -> FlowRegistry {
    FlowRegistry::new().register(
        "ping",
        Arc::new(PingPongInitiator {
            peer: peer.into(),
            faults,
        }),
    )
}

fn responder_registry(faults: Option<FaultPlan>) -> FlowRegistry {
    FlowRegistry::new().register_responder("ping", "pong", Arc::new(PingPongResponder { faults }))
}

/// Two nodes wired through one hub; returns `(hub, alice, bob)`.
fn two_nodes(faults: Option<FaultPlan>) -> (Arc<LoopbackHub>, Arc<Node>, Arc<Node>) {
    init_tracing();
    let hub = LoopbackHub::new();
    let alice_rx = hub.register("alice");
    let bob_rx = hub.register("bob");

    let mut alice_config = NodeConfig::new("alice");
    alice_config.retry = fast_retry(5);
    let alice = Node::new(
        alice_config,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        initiator_registry("bob", faults.clone()),
    );
    alice.serve_inbox(alice_rx);

    let mut bob_config = NodeConfig::new("bob");
    bob_config.retry = fast_retry(5);
    let bob = Node::new(
        bob_config,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        responder_registry(faults),
    );
    bob.serve_inbox(bob_rx);

    (hub, alice, bob)
}

async fn wait_for_status(node: &Node, flow_id: FlowId, want: FlowStatus) -> FlowInstance {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(instance)) = node.status(flow_id).await {
                if instance.status == want {
                    return instance;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_pong_completes_across_transient_faults() {
    let faults = FaultPlan::default();
    let (_hub, alice, _bob) = two_nodes(Some(faults.clone()));

    let handle = alice
        .start_flow("ping", json!({ "sessions": 2, "iterations": 10 }))
        .await
        .unwrap();
    let flow_id = handle.flow_id;
    let result = handle.result().await.expect("flow should complete");
    assert_eq!(result, json!("2:10"));

    // One initiator fault per session at the midpoint, one responder fault
    // per session on payload 3; every key visited exactly once.
    assert_eq!(faults.count(), 4);

    let instance = alice.status(flow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, FlowStatus::Completed);
    assert_eq!(instance.result, Some(json!("2:10")));

    let events = alice.events(flow_id).await.unwrap();
    assert!(events
        .iter()
        .any(|(_, e)| matches!(e, RuntimeEvent::RetryScheduled { .. })));
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        RuntimeEvent::ProgressLabel { label, .. } if label == "OPENING"
    )));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_deliveries_resume_a_receive_only_once() {
    let (hub, alice, _bob) = two_nodes(None);
    hub.duplicate_data_frames(true);

    let handle = alice
        .start_flow("ping", json!({ "sessions": 1, "iterations": 3 }))
        .await
        .unwrap();
    let flow_id = handle.flow_id;
    let result = handle.result().await.expect("flow should complete");
    assert_eq!(result, json!("1:3"));

    // Every reply from bob arrived twice; the second copy must have been
    // dropped at the inbox.
    let events = alice.events(flow_id).await.unwrap();
    assert!(events
        .iter()
        .any(|(_, e)| matches!(e, RuntimeEvent::DuplicateDeliveryDropped { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn async_operation_runs_exactly_once_across_retries() {
    init_tracing();
    let hub = LoopbackHub::new();
    let rx = hub.register("alice");
    let mut config = NodeConfig::new("alice");
    config.retry = fast_retry(5);
    let node = Node::new(
        config,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        FlowRegistry::new().register("async-once", Arc::new(AsyncOnceFlow)),
    );
    node.serve_inbox(rx);
    let op = Arc::new(RecordingOp::default());
    node.register_op("record-id", op.clone());

    let handle = node.start_flow("async-once", json!({})).await.unwrap();
    let result = handle.result().await.expect("retry should recognize the id");
    assert_eq!(result, json!("Result"));

    // The failed first attempt and the successful retry carried the same
    // deduplication id.
    assert_eq!(op.seen.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_hospitalize_at_the_attempt_bound() {
    init_tracing();
    let hub = LoopbackHub::new();
    let rx = hub.register("alice");
    let mut config = NodeConfig::new("alice");
    config.retry = fast_retry(3);
    let node = Node::new(
        config,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        FlowRegistry::new().register("flaky", Arc::new(FlakyFlow)),
    );
    node.serve_inbox(rx);

    let handle = node.start_flow("flaky", json!({})).await.unwrap();
    let flow_id = handle.flow_id;
    let failure = handle.result().await.expect_err("retries must run out");
    assert_eq!(failure.class, ErrorClass::Transient);

    let instance = node.status(flow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, FlowStatus::Hospitalized);
    assert_eq!(instance.retry_count, 3, "three executions, then give up");

    let events = node.events(flow_id).await.unwrap();
    let retries = events
        .iter()
        .filter(|(_, e)| matches!(e, RuntimeEvent::RetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(events
        .iter()
        .any(|(_, e)| matches!(e, RuntimeEvent::Hospitalized { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn construction_failures_report_synchronously_and_persist_nothing() {
    init_tracing();
    let hub = LoopbackHub::new();
    let rx = hub.register("alice");
    let store = Arc::new(MemoryStore::new());
    let node = Node::new(
        NodeConfig::new("alice"),
        store.clone(),
        hub.clone(),
        FlowRegistry::new().register("guarded", Arc::new(GuardedFlow)),
    );
    node.serve_inbox(rx);

    let error = node
        .start_flow("guarded", json!({}))
        .await
        .expect_err("missing argument must fail construction");
    assert!(matches!(error, FlowError::Construction(_)), "{error:?}");
    assert!(store.non_terminal_instances().await.unwrap().is_empty());

    // Valid arguments take the normal path, with the caller recorded.
    let handle = node
        .start_flow_as("guarded", json!({ "amount": 7 }), Some("ops-console".into()))
        .await
        .unwrap();
    let flow_id = handle.flow_id;
    assert_eq!(handle.result().await.unwrap(), json!(7));
    let instance = node.status(flow_id).await.unwrap().unwrap();
    assert_eq!(instance.invoked_by.as_deref(), Some("ops-console"));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_flows_release_their_execution_guards() {
    init_tracing();
    let hub = LoopbackHub::new();
    let rx = hub.register("alice");
    let mut config = NodeConfig::new("alice");
    config.retry = fast_retry(2);
    let node = Node::new(
        config,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        FlowRegistry::new()
            .register("guarded", Arc::new(GuardedFlow))
            .register("flaky", Arc::new(FlakyFlow)),
    );
    node.serve_inbox(rx);

    let handle = node
        .start_flow("guarded", json!({ "amount": 1 }))
        .await
        .unwrap();
    handle.result().await.unwrap();
    assert_eq!(node.tracked_instances(), 0, "completion must drop the guard");

    let handle = node.start_flow("flaky", json!({})).await.unwrap();
    handle.result().await.expect_err("retries must run out");
    assert_eq!(
        node.tracked_instances(),
        0,
        "hospitalization must drop the guard"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn suspension_timeouts_retry_then_hospitalize() {
    init_tracing();
    let hub = LoopbackHub::new();
    let rx = hub.register("alice");
    let mut config = NodeConfig::new("alice");
    config.retry = fast_retry(2);
    config.receive_timeout = Some(Duration::from_millis(20));
    // "ghost" is never registered: the Open frame vanishes every time.
    let node = Node::new(
        config,
        Arc::new(MemoryStore::new()),
        hub.clone(),
        initiator_registry("ghost", None),
    );
    node.serve_inbox(rx);

    let handle = node
        .start_flow("ping", json!({ "sessions": 1, "iterations": 1 }))
        .await
        .unwrap();
    let flow_id = handle.flow_id;
    let failure = handle.result().await.expect_err("no peer ever answers");
    assert_eq!(failure.class, ErrorClass::Transient);
    assert!(failure.message.contains("timed out"), "{failure:?}");

    let instance = node.status(flow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, FlowStatus::Hospitalized);
    assert_eq!(instance.retry_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_hospitalization_parks_a_suspended_flow() {
    init_tracing();
    let hub = LoopbackHub::new();
    let rx = hub.register("alice");
    // No peer: the flow parks on session establishment indefinitely.
    let node = Node::new(
        NodeConfig::new("alice"),
        Arc::new(MemoryStore::new()),
        hub.clone(),
        initiator_registry("ghost", None),
    );
    node.serve_inbox(rx);

    let handle = node
        .start_flow("ping", json!({ "sessions": 1, "iterations": 1 }))
        .await
        .unwrap();
    let flow_id = handle.flow_id;
    wait_for_status(&node, flow_id, FlowStatus::Suspended).await;

    node.request_hospitalization(flow_id).await.unwrap();
    let failure = handle.result().await.expect_err("operator parked the flow");
    assert_eq!(failure.class, ErrorClass::Fatal);
    let instance = node.status(flow_id).await.unwrap().unwrap();
    assert_eq!(instance.status, FlowStatus::Hospitalized);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_redelivers_the_lost_open_frame() {
    init_tracing();
    let hub = LoopbackHub::new();
    let store = Arc::new(MemoryStore::new());

    // First incarnation: no peer is reachable, the Open frame is lost in
    // flight and the flow parks awaiting the session.
    let first = Node::new(
        NodeConfig::new("alice"),
        store.clone(),
        hub.clone(),
        initiator_registry("bob", None),
    );
    let handle = first
        .start_flow("ping", json!({ "sessions": 1, "iterations": 2 }))
        .await
        .unwrap();
    let flow_id = handle.flow_id;
    wait_for_status(&first, flow_id, FlowStatus::Suspended).await;

    // Restart: a fresh node over the same store, with the peer now up.
    let bob_rx = hub.register("bob");
    let bob = Node::new(
        NodeConfig::new("bob"),
        Arc::new(MemoryStore::new()),
        hub.clone(),
        responder_registry(None),
    );
    bob.serve_inbox(bob_rx);

    let alice_rx = hub.register("alice");
    let second = Node::new(
        NodeConfig::new("alice"),
        store.clone(),
        hub.clone(),
        initiator_registry("bob", None),
    );
    second.serve_inbox(alice_rx);

    assert_eq!(second.recover().await.unwrap(), 1);
    let instance = wait_for_status(&second, flow_id, FlowStatus::Completed).await;
    assert_eq!(instance.result, Some(json!("1:2")));
}
