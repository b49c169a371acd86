use crate::errors::FlowError;
use crate::events::{RuntimeEvent, WaitDesc};
use crate::logic::{FlowLogic, StepInput, StepOutcome, SuspendRequest};
use crate::ops::AsyncOperation;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::{next_inbound, InboundDisposition, Transport};
use crate::store::{CheckpointStore, DedupeRecord};
use crate::types::*;
use anyhow::{anyhow, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of driving a flow instance as far as it will go.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// Logic returned; the instance is terminal and archived.
    Completed { result: Value },
    /// Parked on a suspension point awaiting external input.
    Parked { wait: WaitDesc },
    /// A transient failure was recorded; re-execute from the latest
    /// checkpoint after the backoff elapses.
    RetryScheduled { after: Duration },
    /// Terminal parked state: retries exhausted or failure fatal.
    Hospitalized { failure: FailureRecord },
}

/// Result of creating a new flow instance.
#[derive(Clone, Debug)]
pub enum StartOutcome {
    /// Construction raised before any suspension point. No instance, no
    /// checkpoint: the failure belongs to the caller, not the retry policy.
    Rejected { error: FlowError },
    /// Instance durably created in `Created` status; drive it with
    /// [`FlowMachine::resume`].
    Created { flow_id: FlowId },
}

enum Derived {
    Input(StepInput),
    Park(WaitDesc),
    Failure(FlowError),
}

struct DriveCtx {
    instance: FlowInstance,
    logic_state: Value,
    channels: BTreeMap<SessionId, ChannelState>,
    /// What the latest checkpoint parked on. None before the first
    /// suspension point.
    wait: Option<WaitState>,
}

/// The flow state machine. Drives each instance from `Created` to a
/// terminal status, enforcing checkpoint-before-send and exactly-once side
/// effects.
///
/// The machine itself holds no per-flow mutable state: everything lives in
/// the [`CheckpointStore`]. Callers must serialize executions per flow id
/// (at most one `resume` in flight per instance); the node runtime does
/// this with a per-flow lock and coalesces concurrent resume requests.
pub struct FlowMachine {
    local_name: String,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn Transport>,
    ops: RwLock<HashMap<String, Arc<dyn AsyncOperation>>>,
    retry: RetryPolicy,
    /// Per-invocation budget for async operations. None = unbounded.
    op_timeout: Option<Duration>,
}

impl FlowMachine {
    pub fn new(
        local_name: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            store,
            transport,
            ops: RwLock::new(HashMap::new()),
            retry,
            op_timeout: None,
        }
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Register an async operation under the name flow logic refers to it by.
    pub fn register_op(&self, name: impl Into<String>, op: Arc<dyn AsyncOperation>) {
        self.ops.write().unwrap().insert(name.into(), op);
    }

    // ── Lifecycle entry points ──

    /// Create a flow instance. Construction runs synchronously: a failure
    /// there is reported to the caller and nothing is persisted. On success
    /// the instance is durably saved in `Created` status, ready to be
    /// driven by [`FlowMachine::resume`].
    pub async fn create(
        &self,
        logic: &dyn FlowLogic,
        descriptor: &str,
        args: Value,
        invoked_by: Option<String>,
    ) -> Result<StartOutcome> {
        // Construction validation only. The state it produces is rebuilt by
        // `resume` from the persisted args, so `construct` must be a pure
        // function of its arguments.
        if let Err(error) = logic.construct(&args) {
            let error = FlowError::Construction(error.to_string());
            info!(descriptor, %error, "flow construction rejected");
            return Ok(StartOutcome::Rejected { error });
        }

        let flow_id = Uuid::now_v7();
        let instance = FlowInstance::new(flow_id, descriptor.to_string(), args, invoked_by);
        self.store.save_instance(&instance).await?;
        self.emit(
            flow_id,
            RuntimeEvent::FlowStarted {
                flow_id,
                descriptor: descriptor.to_string(),
            },
        )
        .await?;
        Ok(StartOutcome::Created { flow_id })
    }

    /// Create a responder instance for a session a peer just opened.
    ///
    /// Saves the session record binding the channel to the new instance and
    /// delivers the Accept frame, both after the instance is durably
    /// created. A construction failure creates nothing; the caller turns it
    /// into a Reject frame.
    pub async fn create_initiated(
        &self,
        logic: &dyn FlowLogic,
        descriptor: &str,
        args: Value,
        channel: ChannelState,
    ) -> Result<StartOutcome> {
        if let Err(error) = logic.construct(&args) {
            let error = FlowError::Construction(error.to_string());
            info!(descriptor, %error, "responder construction rejected");
            return Ok(StartOutcome::Rejected { error });
        }

        let flow_id = Uuid::now_v7();
        let instance = FlowInstance::new(
            flow_id,
            descriptor.to_string(),
            args,
            Some(channel.peer.clone()),
        );
        self.store.save_instance(&instance).await?;
        self.store
            .save_session(&SessionRecord {
                session_id: channel.session_id,
                local_flow: flow_id,
                role: SessionRole::Responder,
                peer: channel.peer.clone(),
                accepted: true,
                rejected: None,
            })
            .await?;
        self.emit(
            flow_id,
            RuntimeEvent::FlowStarted {
                flow_id,
                descriptor: descriptor.to_string(),
            },
        )
        .await?;

        self.transport
            .deliver(
                &channel.peer,
                SessionMessage {
                    session_id: channel.session_id,
                    seq: 0,
                    frame: SessionFrame::Accept {
                        responder_flow: flow_id,
                    },
                },
            )
            .await?;
        Ok(StartOutcome::Created { flow_id })
    }

    /// Continue a suspended or failed instance from its latest checkpoint.
    pub async fn resume(&self, logic: &dyn FlowLogic, flow_id: FlowId) -> Result<RunOutcome> {
        self.resume_inner(logic, flow_id, false).await
    }

    /// Continue after a process restart. Identical to `resume` except that
    /// an outbound frame recorded at the latest checkpoint is re-delivered,
    /// since the crash may have struck between recording and delivery. The
    /// receiver's sequence dedup makes the re-delivery harmless.
    pub async fn recover(&self, logic: &dyn FlowLogic, flow_id: FlowId) -> Result<RunOutcome> {
        self.resume_inner(logic, flow_id, true).await
    }

    async fn resume_inner(
        &self,
        logic: &dyn FlowLogic,
        flow_id: FlowId,
        redeliver: bool,
    ) -> Result<RunOutcome> {
        let mut instance = self
            .store
            .load_instance(flow_id)
            .await?
            .ok_or_else(|| anyhow!("unknown flow instance {flow_id}"))?;

        // Terminal instances resume to their terminal outcome; this is how
        // concurrent or late resume requests coalesce into no-ops.
        match instance.status {
            FlowStatus::Completed => {
                return Ok(RunOutcome::Completed {
                    result: instance.result.unwrap_or(Value::Null),
                })
            }
            FlowStatus::Hospitalized => {
                return Ok(RunOutcome::Hospitalized {
                    failure: instance.last_failure.unwrap_or(FailureRecord {
                        class: ErrorClass::Fatal,
                        message: "hospitalized".into(),
                    }),
                })
            }
            _ => {}
        }

        let checkpoint = self.store.latest_checkpoint(flow_id).await?;
        instance.status = FlowStatus::Running;
        self.store.save_instance(&instance).await?;

        let ctx = match checkpoint {
            Some(cp) => {
                // The checkpoint is the source of truth for position.
                instance.current_step_index = cp.step_index;
                DriveCtx {
                    instance,
                    logic_state: cp.logic_state,
                    channels: cp.channels,
                    wait: Some(cp.wait),
                }
            }
            None => {
                // No checkpoint yet: the whole logic runs (or, after an
                // early failure, re-runs) from construction. Only the
                // original synchronous construction in `create` is exempt
                // from retry; a construction failure here goes through the
                // ordinary failure path.
                debug!(%flow_id, "no checkpoint, running from construction");
                let args = instance.args.clone();
                match logic.construct(&args) {
                    Ok(state) => {
                        // A responder's channel predates its first
                        // checkpoint; rebuild it from the session registry.
                        let mut channels = BTreeMap::new();
                        for record in self.store.sessions_for_flow(flow_id).await? {
                            channels.insert(
                                record.session_id,
                                ChannelState::new(record.session_id, record.peer, record.role),
                            );
                        }
                        DriveCtx {
                            instance,
                            logic_state: state,
                            channels,
                            wait: None,
                        }
                    }
                    Err(error) => return self.fail(&mut instance, error).await,
                }
            }
        };

        self.drive(logic, ctx, redeliver).await
    }

    /// Inject a per-suspension-point timeout failure into a suspended
    /// instance. No-op unless the instance is still parked at `step_index`.
    pub async fn fail_suspended(
        &self,
        flow_id: FlowId,
        step_index: StepIndex,
        error: FlowError,
    ) -> Result<Option<RunOutcome>> {
        let mut instance = self
            .store
            .load_instance(flow_id)
            .await?
            .ok_or_else(|| anyhow!("unknown flow instance {flow_id}"))?;
        if instance.status != FlowStatus::Suspended || instance.current_step_index != step_index {
            return Ok(None);
        }
        Ok(Some(self.fail(&mut instance, error).await?))
    }

    /// Operator request to park the instance. Cooperative: a running
    /// instance finishes its current indivisible step first; a suspended or
    /// failed one is parked immediately.
    pub async fn request_hospitalization(&self, flow_id: FlowId) -> Result<()> {
        let mut instance = self
            .store
            .load_instance(flow_id)
            .await?
            .ok_or_else(|| anyhow!("unknown flow instance {flow_id}"))?;
        if instance.status.is_terminal() {
            return Ok(());
        }
        instance.hospitalize_requested = true;
        self.store.save_instance(&instance).await?;
        if matches!(instance.status, FlowStatus::Suspended | FlowStatus::Failed) {
            self.hospitalize(
                &mut instance,
                FailureRecord {
                    class: ErrorClass::Fatal,
                    message: "hospitalization requested by operator".into(),
                },
            )
            .await?;
        }
        Ok(())
    }

    // ── Step execution loop ──

    async fn drive(
        &self,
        logic: &dyn FlowLogic,
        mut ctx: DriveCtx,
        mut redeliver: bool,
    ) -> Result<RunOutcome> {
        let flow_id = ctx.instance.flow_id;
        loop {
            // Honor operator requests only between indivisible steps, so the
            // checkpoint-before-send invariant is never broken mid-step.
            if let Some(current) = self.store.load_instance(flow_id).await? {
                ctx.instance.hospitalize_requested = current.hospitalize_requested;
            }
            if ctx.instance.hospitalize_requested {
                return self
                    .hospitalize(
                        &mut ctx.instance,
                        FailureRecord {
                            class: ErrorClass::Fatal,
                            message: "hospitalization requested by operator".into(),
                        },
                    )
                    .await;
            }

            let input = match self.derive_input(&mut ctx, redeliver).await? {
                Derived::Input(input) => input,
                Derived::Park(wait) => {
                    ctx.instance.status = FlowStatus::Suspended;
                    self.store.save_instance(&ctx.instance).await?;
                    return Ok(RunOutcome::Parked { wait });
                }
                Derived::Failure(error) => return self.fail(&mut ctx.instance, error).await,
            };
            redeliver = false;

            let transition = match logic.step(ctx.logic_state.clone(), input) {
                Ok(transition) => transition,
                Err(error) => return self.fail(&mut ctx.instance, error).await,
            };
            for label in &transition.progress {
                self.emit(
                    flow_id,
                    RuntimeEvent::ProgressLabel {
                        label: label.clone(),
                    },
                )
                .await?;
            }
            ctx.logic_state = transition.state;

            match transition.outcome {
                StepOutcome::Completed(result) => return self.complete(&mut ctx, result).await,
                StepOutcome::Suspend(request) => {
                    ctx.instance.current_step_index += 1;
                    let dedup_id =
                        DeduplicationId::derive(flow_id, ctx.instance.current_step_index);
                    if let Some(outcome) = self.suspend(&mut ctx, request, dedup_id).await? {
                        return Ok(outcome);
                    }
                    // Loop: the new wait state's input is derived next turn.
                }
            }
        }
    }

    /// Act on one suspension request: park bookkeeping, checkpoint, and the
    /// dedup-guarded externally-visible effect. Returns an outcome only when
    /// the request itself failed terminally.
    async fn suspend(
        &self,
        ctx: &mut DriveCtx,
        request: SuspendRequest,
        dedup_id: DeduplicationId,
    ) -> Result<Option<RunOutcome>> {
        let flow_id = ctx.instance.flow_id;
        match request {
            SuspendRequest::Initiate { peer } => {
                // Session id must survive replay of this step: reuse the one
                // recorded under the step's dedup id if there is one.
                let (session_id, fresh) = match self.store.dedupe_get(&dedup_id).await? {
                    Some(DedupeRecord::SessionOpened { session_id }) => (session_id, false),
                    _ => (Uuid::now_v7(), true),
                };
                ctx.channels.entry(session_id).or_insert_with(|| {
                    ChannelState::new(session_id, peer.clone(), SessionRole::Initiator)
                });
                if fresh {
                    self.store
                        .save_session(&SessionRecord {
                            session_id,
                            local_flow: flow_id,
                            role: SessionRole::Initiator,
                            peer: peer.clone(),
                            accepted: false,
                            rejected: None,
                        })
                        .await?;
                }
                ctx.wait = Some(WaitState::SessionInit { session_id });
                self.checkpoint(ctx).await?;
                if fresh {
                    self.store
                        .dedupe_put(&dedup_id, &DedupeRecord::SessionOpened { session_id })
                        .await?;
                    self.emit(
                        flow_id,
                        RuntimeEvent::SessionInitiated {
                            session_id,
                            peer: peer.clone(),
                        },
                    )
                    .await?;
                    self.transport
                        .deliver(&peer, self.open_frame(ctx, session_id))
                        .await?;
                }
                Ok(None)
            }

            SuspendRequest::Send { session, payload } => {
                let channel = match ctx.channels.get_mut(&session) {
                    Some(channel) => channel,
                    None => {
                        return self
                            .fail(
                                &mut ctx.instance,
                                FlowError::Fatal(format!("send on unknown session {session}")),
                            )
                            .await
                            .map(Some)
                    }
                };
                if channel.peer_closed {
                    return self
                        .fail(&mut ctx.instance, FlowError::UnexpectedSessionEnd)
                        .await
                        .map(Some);
                }

                match self.store.dedupe_get(&dedup_id).await? {
                    Some(DedupeRecord::SendRecorded { message }) => {
                        // Replay of an already-recorded send: suppress.
                        channel.next_send_seq = channel.next_send_seq.max(message.seq + 1);
                        let seq = message.seq;
                        ctx.wait = Some(WaitState::Sent { message });
                        self.checkpoint(ctx).await?;
                        self.emit(
                            flow_id,
                            RuntimeEvent::SendSuppressed {
                                session_id: session,
                                seq,
                            },
                        )
                        .await?;
                    }
                    _ => {
                        let seq = channel.next_send_seq;
                        channel.next_send_seq += 1;
                        let peer = channel.peer.clone();
                        let message = SessionMessage {
                            session_id: session,
                            seq,
                            frame: SessionFrame::Data { payload },
                        };
                        // Checkpoint-before-send: the frame rides inside
                        // the wait state, so the one atomic checkpoint
                        // write durably records both the snapshot and the
                        // message it is about to emit.
                        ctx.wait = Some(WaitState::Sent {
                            message: message.clone(),
                        });
                        self.checkpoint(ctx).await?;
                        self.store
                            .dedupe_put(
                                &dedup_id,
                                &DedupeRecord::SendRecorded {
                                    message: message.clone(),
                                },
                            )
                            .await?;
                        self.emit(
                            flow_id,
                            RuntimeEvent::MessageSent {
                                session_id: session,
                                seq,
                            },
                        )
                        .await?;
                        self.transport.deliver(&peer, message).await?;
                    }
                }
                Ok(None)
            }

            SuspendRequest::Receive { session } => {
                if !ctx.channels.contains_key(&session) {
                    return self
                        .fail(
                            &mut ctx.instance,
                            FlowError::Fatal(format!("receive on unknown session {session}")),
                        )
                        .await
                        .map(Some);
                }
                ctx.wait = Some(WaitState::Receive {
                    session_id: session,
                });
                self.checkpoint(ctx).await?;
                Ok(None)
            }

            SuspendRequest::ExecuteAsync { op, input } => {
                ctx.wait = Some(WaitState::AsyncOp { op, input });
                // Suspended-with-checkpoint before the operation runs, so a
                // crash mid-operation replays with the same dedup id.
                self.checkpoint(ctx).await?;
                Ok(None)
            }
        }
    }

    /// Derive the resumption input for the current wait state, or park.
    async fn derive_input(&self, ctx: &mut DriveCtx, redeliver: bool) -> Result<Derived> {
        let flow_id = ctx.instance.flow_id;
        let Some(wait) = ctx.wait.clone() else {
            return Ok(Derived::Input(StepInput::Begin));
        };
        match wait {
            WaitState::SessionInit { session_id } => {
                let record = self
                    .store
                    .load_session(session_id)
                    .await?
                    .ok_or_else(|| anyhow!("missing session record {session_id}"))?;
                if let Some(reason) = record.rejected {
                    self.emit(
                        flow_id,
                        RuntimeEvent::SessionRejected {
                            session_id,
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                    return Ok(Derived::Failure(FlowError::SessionRejected(reason)));
                }
                if record.accepted {
                    self.emit(flow_id, RuntimeEvent::SessionAccepted { session_id })
                        .await?;
                    return Ok(Derived::Input(StepInput::SessionEstablished {
                        session: session_id,
                    }));
                }
                if redeliver {
                    let frame = self.open_frame(ctx, session_id);
                    self.transport.deliver(&record.peer, frame).await?;
                }
                Ok(Derived::Park(WaitDesc::SessionInit { session_id }))
            }

            WaitState::Sent { message } => {
                if redeliver {
                    let session_id = message.session_id;
                    let dedup_id =
                        DeduplicationId::derive(flow_id, ctx.instance.current_step_index);
                    if self.store.dedupe_get(&dedup_id).await?.is_none() {
                        // The crash struck between the checkpoint and the
                        // ledger write: the checkpointed frame is the only
                        // durable copy. Backfill the ledger so a later
                        // replay of this step suppresses the send.
                        self.store
                            .dedupe_put(
                                &dedup_id,
                                &DedupeRecord::SendRecorded {
                                    message: message.clone(),
                                },
                            )
                            .await?;
                    }
                    let peer = ctx
                        .channels
                        .get(&session_id)
                        .map(|c| c.peer.clone())
                        .ok_or_else(|| anyhow!("missing channel {session_id}"))?;
                    debug!(%flow_id, %session_id, seq = message.seq, "re-delivering recorded send");
                    self.transport.deliver(&peer, message).await?;
                }
                Ok(Derived::Input(StepInput::Delivered))
            }

            WaitState::Receive { session_id } => {
                let channel = ctx
                    .channels
                    .get_mut(&session_id)
                    .ok_or_else(|| anyhow!("missing channel {session_id}"))?;
                match next_inbound(self.store.as_ref(), channel).await? {
                    InboundDisposition::Pending => {
                        Ok(Derived::Park(WaitDesc::Receive { session_id }))
                    }
                    InboundDisposition::Closed => {
                        channel.peer_closed = true;
                        Ok(Derived::Failure(FlowError::UnexpectedSessionEnd))
                    }
                    InboundDisposition::Payload(payload) => {
                        let seq = channel.next_recv_seq;
                        // Cursor advance becomes durable only at the next
                        // checkpoint; a replay consumes this frame again.
                        channel.next_recv_seq += 1;
                        self.emit(flow_id, RuntimeEvent::MessageReceived { session_id, seq })
                            .await?;
                        Ok(Derived::Input(StepInput::Message {
                            session: session_id,
                            payload,
                        }))
                    }
                }
            }

            WaitState::AsyncOp { op, input } => {
                let dedup_id = DeduplicationId::derive(flow_id, ctx.instance.current_step_index);
                if let Some(DedupeRecord::AsyncCompleted { value }) =
                    self.store.dedupe_get(&dedup_id).await?
                {
                    self.emit(
                        flow_id,
                        RuntimeEvent::AsyncOpReplayed {
                            dedup_id: dedup_id.clone(),
                        },
                    )
                    .await?;
                    return Ok(Derived::Input(StepInput::AsyncResult { value }));
                }

                let operation = self.ops.read().unwrap().get(&op).cloned();
                let Some(operation) = operation else {
                    return Ok(Derived::Failure(FlowError::Unregistered(op)));
                };
                self.emit(
                    flow_id,
                    RuntimeEvent::AsyncOpStarted {
                        dedup_id: dedup_id.clone(),
                        op: op.clone(),
                    },
                )
                .await?;
                let executed = match self.op_timeout {
                    Some(budget) => {
                        match tokio::time::timeout(budget, operation.execute(&dedup_id, &input))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(FlowError::SuspensionTimeout {
                                step_index: ctx.instance.current_step_index,
                            }),
                        }
                    }
                    None => operation.execute(&dedup_id, &input).await,
                };
                match executed {
                    Ok(value) => {
                        self.store
                            .dedupe_put(
                                &dedup_id,
                                &DedupeRecord::AsyncCompleted {
                                    value: value.clone(),
                                },
                            )
                            .await?;
                        self.emit(
                            flow_id,
                            RuntimeEvent::AsyncOpCompleted {
                                dedup_id: dedup_id.clone(),
                            },
                        )
                        .await?;
                        Ok(Derived::Input(StepInput::AsyncResult { value }))
                    }
                    Err(error) => Ok(Derived::Failure(error)),
                }
            }
        }
    }

    // ── Terminal dispositions ──

    async fn complete(&self, ctx: &mut DriveCtx, result: Value) -> Result<RunOutcome> {
        let flow_id = ctx.instance.flow_id;
        // Session end is itself a message; replay-suppressed like any other
        // externally-visible effect.
        for channel in ctx.channels.values() {
            if channel.peer_closed {
                continue;
            }
            let close_id = DeduplicationId::for_close(flow_id, channel.session_id);
            match self.store.dedupe_get(&close_id).await? {
                Some(DedupeRecord::SendRecorded { message }) => {
                    // Recorded but possibly never delivered; the receiver
                    // dedups by sequence, so repeating the frame is safe.
                    self.transport.deliver(&channel.peer, message).await?;
                    continue;
                }
                Some(_) => continue,
                None => {}
            }
            let message = SessionMessage {
                session_id: channel.session_id,
                seq: channel.next_send_seq,
                frame: SessionFrame::Close,
            };
            self.store
                .dedupe_put(
                    &close_id,
                    &DedupeRecord::SendRecorded {
                        message: message.clone(),
                    },
                )
                .await?;
            self.emit(
                flow_id,
                RuntimeEvent::SessionClosed {
                    session_id: channel.session_id,
                },
            )
            .await?;
            self.transport.deliver(&channel.peer, message).await?;
        }

        ctx.instance.status = FlowStatus::Completed;
        ctx.instance.result = Some(result.clone());
        self.store.save_instance(&ctx.instance).await?;
        self.store.delete_checkpoints(flow_id).await?;
        self.emit(flow_id, RuntimeEvent::Completed { at: now_ms() })
            .await?;
        info!(%flow_id, "flow completed");
        Ok(RunOutcome::Completed { result })
    }

    async fn fail(&self, instance: &mut FlowInstance, error: FlowError) -> Result<RunOutcome> {
        let failure = FailureRecord {
            class: error.class(),
            message: error.to_string(),
        };
        // Only transient failures consume an attempt; a fatal failure
        // hospitalizes with the count it found.
        if failure.class == ErrorClass::Transient {
            instance.retry_count += 1;
        }
        instance.last_failure = Some(failure.clone());
        match self.retry.decide(failure.class, instance.retry_count) {
            RetryDecision::Retry { after } => {
                instance.status = FlowStatus::Failed;
                self.store.save_instance(instance).await?;
                self.emit(
                    instance.flow_id,
                    RuntimeEvent::RetryScheduled {
                        step_index: instance.current_step_index,
                        retry_count: instance.retry_count,
                        after_ms: after.as_millis() as u64,
                        error: failure.message.clone(),
                    },
                )
                .await?;
                debug!(flow_id = %instance.flow_id, retry_count = instance.retry_count,
                       "transient failure, retry scheduled");
                Ok(RunOutcome::RetryScheduled { after })
            }
            RetryDecision::GiveUp => self.hospitalize(instance, failure).await,
        }
    }

    async fn hospitalize(
        &self,
        instance: &mut FlowInstance,
        failure: FailureRecord,
    ) -> Result<RunOutcome> {
        instance.status = FlowStatus::Hospitalized;
        instance.last_failure = Some(failure.clone());
        self.store.save_instance(instance).await?;
        self.emit(
            instance.flow_id,
            RuntimeEvent::Hospitalized {
                retry_count: instance.retry_count,
                error: failure.message.clone(),
            },
        )
        .await?;
        warn!(flow_id = %instance.flow_id, error = %failure.message, "flow hospitalized");
        Ok(RunOutcome::Hospitalized { failure })
    }

    // ── Plumbing ──

    async fn checkpoint(&self, ctx: &mut DriveCtx) -> Result<()> {
        let wait = ctx
            .wait
            .clone()
            .ok_or_else(|| anyhow!("checkpoint without wait state"))?;
        let serialized = serde_json::to_vec(&ctx.logic_state)?;
        let checkpoint = Checkpoint {
            flow_id: ctx.instance.flow_id,
            step_index: ctx.instance.current_step_index,
            logic_state: ctx.logic_state.clone(),
            state_hash: Sha256::digest(&serialized).into(),
            channels: ctx.channels.clone(),
            wait: wait.clone(),
            written_at: now_ms(),
        };
        self.store.put_checkpoint(&checkpoint).await?;
        self.store.save_instance(&ctx.instance).await?;
        self.emit(
            ctx.instance.flow_id,
            RuntimeEvent::CheckpointWritten {
                step_index: checkpoint.step_index,
                wait: WaitDesc::from(&wait),
            },
        )
        .await?;
        Ok(())
    }

    fn open_frame(&self, ctx: &DriveCtx, session_id: SessionId) -> SessionMessage {
        SessionMessage {
            session_id,
            seq: 0,
            frame: SessionFrame::Open {
                initiator: self.local_name.clone(),
                initiator_flow: ctx.instance.flow_id,
                descriptor: ctx.instance.descriptor.clone(),
            },
        }
    }

    async fn emit(&self, flow_id: FlowId, event: RuntimeEvent) -> Result<()> {
        self.store.append_event(flow_id, &event).await?;
        Ok(())
    }
}
