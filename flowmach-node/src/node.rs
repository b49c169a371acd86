use crate::registry::FlowRegistry;
use anyhow::Result;
use flowmach_core::errors::FlowError;
use flowmach_core::events::{RuntimeEvent, WaitDesc};
use flowmach_core::machine::{FlowMachine, RunOutcome, StartOutcome};
use flowmach_core::ops::AsyncOperation;
use flowmach_core::retry::RetryPolicy;
use flowmach_core::session::Transport;
use flowmach_core::store::CheckpointStore;
use flowmach_core::types::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

/// Node-level runtime configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub name: String,
    /// Bound on concurrently executing flow instances.
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Per-suspension-point timeout for `receive` and session
    /// establishment. None = wait forever.
    pub receive_timeout: Option<Duration>,
    /// Per-invocation budget for async operations. None = unbounded.
    pub op_timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: 4,
            retry: RetryPolicy::default(),
            receive_timeout: None,
            op_timeout: None,
        }
    }
}

/// Handle returned by [`Node::start_flow`]: the flow id plus the eventual
/// result-or-failure. Intermediate retries are invisible here; the caller
/// sees only completion or the terminal failure.
#[derive(Debug)]
pub struct FlowHandle {
    pub flow_id: FlowId,
    result: oneshot::Receiver<Result<Value, FailureRecord>>,
}

impl FlowHandle {
    pub async fn result(self) -> Result<Value, FailureRecord> {
        self.result.await.unwrap_or_else(|_| {
            Err(FailureRecord {
                class: ErrorClass::Fatal,
                message: "node shut down before the flow finished".into(),
            })
        })
    }
}

/// Per-flow execution guard: the lock serializes executions (at most one
/// active per flow id), the poke flag coalesces resume requests that arrive
/// while a drive is in flight.
#[derive(Default)]
struct FlowGuard {
    lock: tokio::sync::Mutex<()>,
    poked: AtomicBool,
}

#[derive(Clone, Copy, Debug)]
enum DriveMode {
    Resume,
    /// First drive after process restart; re-delivers the frame recorded
    /// at the latest checkpoint.
    Recover,
}

struct NodeInner {
    config: NodeConfig,
    machine: FlowMachine,
    transport: Arc<dyn Transport>,
    registry: FlowRegistry,
    guards: Mutex<HashMap<FlowId, Arc<FlowGuard>>>,
    listeners: Mutex<HashMap<FlowId, oneshot::Sender<Result<Value, FailureRecord>>>>,
    workers: Arc<Semaphore>,
}

/// A flow-hosting node: registry, worker pool, inbound frame routing,
/// retry/timeout scheduling, crash recovery and the operator surface.
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn Transport>,
        registry: FlowRegistry,
    ) -> Arc<Self> {
        let mut machine = FlowMachine::new(
            config.name.clone(),
            store,
            transport.clone(),
            config.retry.clone(),
        );
        if let Some(budget) = config.op_timeout {
            machine = machine.with_op_timeout(budget);
        }
        let workers = Arc::new(Semaphore::new(config.workers));
        Arc::new(Self {
            inner: Arc::new(NodeInner {
                config,
                machine,
                transport,
                registry,
                guards: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                workers,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        self.inner.machine.store().clone()
    }

    /// Register an async operation available to flows on this node.
    pub fn register_op(&self, name: impl Into<String>, op: Arc<dyn AsyncOperation>) {
        self.inner.machine.register_op(name, op);
    }

    /// Consume an inbox registered with the transport hub.
    pub fn serve_inbox(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                node.handle_message(message).await;
            }
        });
    }

    /// Start a flow. Construction-time failures are returned here,
    /// synchronously; everything after construction reports through the
    /// returned handle.
    pub async fn start_flow(&self, descriptor: &str, args: Value) -> Result<FlowHandle, FlowError> {
        self.start_flow_as(descriptor, args, None).await
    }

    /// Start a flow recording the invoking identity on the instance.
    pub async fn start_flow_as(
        &self,
        descriptor: &str,
        args: Value,
        invoked_by: Option<String>,
    ) -> Result<FlowHandle, FlowError> {
        let logic = self
            .inner
            .registry
            .get(descriptor)
            .ok_or_else(|| FlowError::Unregistered(descriptor.to_string()))?;
        let outcome = self
            .inner
            .machine
            .create(logic.as_ref(), descriptor, args, invoked_by)
            .await
            .map_err(|e| FlowError::Fatal(format!("store failure: {e}")))?;
        match outcome {
            StartOutcome::Rejected { error } => Err(error),
            StartOutcome::Created { flow_id } => {
                let (tx, rx) = oneshot::channel();
                self.inner.listeners.lock().unwrap().insert(flow_id, tx);
                self.inner.spawn_drive(flow_id, DriveMode::Resume);
                Ok(FlowHandle {
                    flow_id,
                    result: rx,
                })
            }
        }
    }

    /// Route one inbound transport frame.
    pub async fn handle_message(&self, message: SessionMessage) {
        if let Err(error) = self.inner.handle_frame(message).await {
            warn!(node = %self.inner.config.name, %error, "failed to handle inbound frame");
        }
    }

    /// Enumerate non-terminal instances and resume each: the restart path.
    /// Returns how many instances were picked up.
    pub async fn recover(&self) -> Result<usize> {
        let instances = self.inner.machine.store().non_terminal_instances().await?;
        let count = instances.len();
        for instance in instances {
            debug!(flow_id = %instance.flow_id, status = ?instance.status, "recovering instance");
            self.inner.spawn_drive(instance.flow_id, DriveMode::Recover);
        }
        Ok(count)
    }

    // ── Operator surface ──

    /// Number of flow instances with a live execution guard. Terminal
    /// flows release theirs, so this tracks the node's working set.
    pub fn tracked_instances(&self) -> usize {
        self.inner.guards.lock().unwrap().len()
    }

    pub async fn status(&self, flow_id: FlowId) -> Result<Option<FlowInstance>> {
        self.inner.machine.store().load_instance(flow_id).await
    }

    pub async fn events(&self, flow_id: FlowId) -> Result<Vec<(u64, RuntimeEvent)>> {
        self.inner.machine.store().read_events(flow_id, 0).await
    }

    /// Cooperatively park an instance for manual intervention.
    pub async fn request_hospitalization(&self, flow_id: FlowId) -> Result<()> {
        {
            let guard = self.inner.guard(flow_id);
            let _lock = guard.lock.lock().await;
            self.inner.machine.request_hospitalization(flow_id).await?;
        }
        if let Some(instance) = self.inner.machine.store().load_instance(flow_id).await? {
            if instance.status == FlowStatus::Hospitalized {
                let failure = instance.last_failure.unwrap_or(FailureRecord {
                    class: ErrorClass::Fatal,
                    message: "hospitalized".into(),
                });
                self.inner.release(flow_id);
                self.inner.notify(flow_id, Err(failure));
            }
        }
        Ok(())
    }
}

impl NodeInner {
    fn guard(&self, flow_id: FlowId) -> Arc<FlowGuard> {
        self.guards
            .lock()
            .unwrap()
            .entry(flow_id)
            .or_default()
            .clone()
    }

    fn notify(&self, flow_id: FlowId, result: Result<Value, FailureRecord>) {
        if let Some(tx) = self.listeners.lock().unwrap().remove(&flow_id) {
            let _ = tx.send(result);
        }
    }

    /// Drop the execution guard of a terminal instance. A late frame may
    /// re-create the entry, harmlessly: terminal resumes have no effects.
    fn release(&self, flow_id: FlowId) {
        self.guards.lock().unwrap().remove(&flow_id);
    }

    fn spawn_drive(self: &Arc<Self>, flow_id: FlowId, mode: DriveMode) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.drive(flow_id, mode).await;
        });
    }

    /// Execute one instance as far as it will go, holding the per-flow lock.
    /// Resume requests arriving during the drive set the poke flag and are
    /// absorbed by re-deriving before the lock is released.
    async fn drive(self: Arc<Self>, flow_id: FlowId, mode: DriveMode) {
        let instance = match self.machine.store().load_instance(flow_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                warn!(%flow_id, "drive requested for unknown instance");
                return;
            }
            Err(error) => {
                warn!(%flow_id, %error, "failed to load instance");
                return;
            }
        };
        let Some(logic) = self.registry.get(&instance.descriptor) else {
            warn!(%flow_id, descriptor = %instance.descriptor, "no logic registered");
            return;
        };

        let mut recover = matches!(mode, DriveMode::Recover);
        loop {
            let guard = self.guard(flow_id);
            let Ok(lock) = guard.lock.try_lock() else {
                // Someone is already driving; they re-check before parking.
                guard.poked.store(true, Ordering::SeqCst);
                return;
            };
            let _permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool closed, node is shutting down
            };

            let outcome = loop {
                guard.poked.store(false, Ordering::SeqCst);
                let result = if recover {
                    self.machine.recover(logic.as_ref(), flow_id).await
                } else {
                    self.machine.resume(logic.as_ref(), flow_id).await
                };
                recover = false;
                match result {
                    Ok(RunOutcome::Parked { .. }) if guard.poked.load(Ordering::SeqCst) => continue,
                    Ok(outcome) => break outcome,
                    Err(error) => {
                        warn!(%flow_id, %error, "drive aborted on store failure");
                        return;
                    }
                }
            };

            drop(lock);
            // A poke may have slipped in between the park decision and the
            // lock release; absorb it by driving again.
            if matches!(outcome, RunOutcome::Parked { .. })
                && guard.poked.swap(false, Ordering::SeqCst)
            {
                continue;
            }
            self.handle_outcome(flow_id, outcome).await;
            return;
        }
    }

    /// Act on a drive outcome: notify listeners, schedule retries, arm
    /// suspension timeouts. Boxed so the timeout task can call back in.
    fn handle_outcome(
        self: &Arc<Self>,
        flow_id: FlowId,
        outcome: RunOutcome,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let inner = self.clone();
        Box::pin(async move {
            match outcome {
                RunOutcome::Completed { result } => {
                    inner.release(flow_id);
                    inner.notify(flow_id, Ok(result));
                }
                RunOutcome::Hospitalized { failure } => {
                    inner.release(flow_id);
                    inner.notify(flow_id, Err(failure));
                }
                RunOutcome::RetryScheduled { after } => {
                    let retry_inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        retry_inner.spawn_drive(flow_id, DriveMode::Resume);
                    });
                }
                RunOutcome::Parked { wait } => {
                    let applies = matches!(
                        wait,
                        WaitDesc::Receive { .. } | WaitDesc::SessionInit { .. }
                    );
                    let Some(timeout) = inner.config.receive_timeout.filter(|_| applies) else {
                        return;
                    };
                    let step_index = match inner.machine.store().load_instance(flow_id).await {
                        Ok(Some(instance)) => instance.current_step_index,
                        _ => return,
                    };
                    let timer_inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let guard = timer_inner.guard(flow_id);
                        let fired = {
                            let _lock = guard.lock.lock().await;
                            timer_inner
                                .machine
                                .fail_suspended(
                                    flow_id,
                                    step_index,
                                    FlowError::SuspensionTimeout { step_index },
                                )
                                .await
                        };
                        match fired {
                            Ok(Some(outcome)) => {
                                timer_inner.handle_outcome(flow_id, outcome).await
                            }
                            Ok(None) => {} // no longer parked at that step
                            Err(error) => warn!(%flow_id, %error, "timeout injection failed"),
                        }
                    });
                }
            }
        })
    }

    async fn handle_frame(self: &Arc<Self>, message: SessionMessage) -> Result<()> {
        let store = self.machine.store();
        match message.frame {
            SessionFrame::Open {
                initiator,
                descriptor,
                ..
            } => {
                if let Some(record) = store.load_session(message.session_id).await? {
                    // Duplicate Open: repeat the Accept, the initiator
                    // side is idempotent to it.
                    self.transport
                        .deliver(
                            &initiator,
                            SessionMessage {
                                session_id: message.session_id,
                                seq: 0,
                                frame: SessionFrame::Accept {
                                    responder_flow: record.local_flow,
                                },
                            },
                        )
                        .await?;
                    return Ok(());
                }
                let Some((responder_descriptor, logic)) = self.registry.responder_for(&descriptor)
                else {
                    self.transport
                        .deliver(
                            &initiator,
                            SessionMessage {
                                session_id: message.session_id,
                                seq: 0,
                                frame: SessionFrame::Reject {
                                    reason: format!("no responder registered for {descriptor}"),
                                },
                            },
                        )
                        .await?;
                    return Ok(());
                };
                let channel = ChannelState::new(
                    message.session_id,
                    initiator.clone(),
                    SessionRole::Responder,
                );
                let args = json!({ "session": message.session_id });
                match self
                    .machine
                    .create_initiated(logic.as_ref(), &responder_descriptor, args, channel)
                    .await?
                {
                    StartOutcome::Rejected { error } => {
                        self.transport
                            .deliver(
                                &initiator,
                                SessionMessage {
                                    session_id: message.session_id,
                                    seq: 0,
                                    frame: SessionFrame::Reject {
                                        reason: error.to_string(),
                                    },
                                },
                            )
                            .await?;
                    }
                    StartOutcome::Created { flow_id } => {
                        self.spawn_drive(flow_id, DriveMode::Resume)
                    }
                }
            }

            SessionFrame::Accept { .. } => {
                if let Some(mut record) = store.load_session(message.session_id).await? {
                    if !record.accepted {
                        record.accepted = true;
                        store.save_session(&record).await?;
                    }
                    self.spawn_drive(record.local_flow, DriveMode::Resume);
                }
            }

            SessionFrame::Reject { reason } => {
                if let Some(mut record) = store.load_session(message.session_id).await? {
                    if record.rejected.is_none() {
                        record.rejected = Some(reason);
                        store.save_session(&record).await?;
                    }
                    self.spawn_drive(record.local_flow, DriveMode::Resume);
                }
            }

            SessionFrame::Data { .. } | SessionFrame::Close => {
                let Some(record) = store.load_session(message.session_id).await? else {
                    debug!(session_id = %message.session_id, "frame for unknown session dropped");
                    return Ok(());
                };
                let fresh = store
                    .push_inbox(message.session_id, message.seq, &message.frame)
                    .await?;
                if !fresh {
                    store
                        .append_event(
                            record.local_flow,
                            &RuntimeEvent::DuplicateDeliveryDropped {
                                session_id: message.session_id,
                                seq: message.seq,
                            },
                        )
                        .await?;
                    return Ok(());
                }
                self.spawn_drive(record.local_flow, DriveMode::Resume);
            }
        }
        Ok(())
    }
}
