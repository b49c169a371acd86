use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Globally unique flow instance identifier, stable across retries and restarts.
pub type FlowId = Uuid;

/// Session channel identifier.
pub type SessionId = Uuid;

/// Monotonic counter of suspension points reached by a flow instance.
pub type StepIndex = u64;

/// Per-session, per-direction monotonic message sequence number.
pub type SequenceNumber = u64;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ─── Deduplication id ─────────────────────────────────────────

/// Deterministic identifier for one logical step of one flow instance.
///
/// Derived from `(flow_id, step_index)` only, so the same instance reaching
/// the same suspension point always derives the same id, across retries and
/// across process restarts. Externally-visible effects are keyed by this id
/// to stay idempotent under replay.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeduplicationId(String);

impl DeduplicationId {
    pub fn derive(flow_id: FlowId, step_index: StepIndex) -> Self {
        DeduplicationId(format!("{flow_id}:{step_index}"))
    }

    /// Key for the session-end frame sent during completion. Not tied to a
    /// step index: completion is not a suspension point, but the Close must
    /// still be replay-suppressed.
    pub fn for_close(flow_id: FlowId, session_id: SessionId) -> Self {
        DeduplicationId(format!("{flow_id}:close:{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeduplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Flow status ──────────────────────────────────────────────

/// Lifecycle status of a flow instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
    Hospitalized,
}

impl FlowStatus {
    /// Returns true if no further progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Hospitalized)
    }
}

// ─── Error classification ─────────────────────────────────────

/// Retry Policy input: how a failure is classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Contention or infrastructure hiccup, retryable with backoff.
    Transient,
    /// Everything else. Never retried.
    Fatal,
}

/// Durable record of the last failure seen by an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub class: ErrorClass,
    pub message: String,
}

// ─── Flow instance ────────────────────────────────────────────

/// One running protocol execution, the top-level unit the scheduler owns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    pub flow_id: FlowId,
    /// Registry key of the logic this instance runs.
    pub descriptor: String,
    /// Arguments the instance was constructed with. Kept so a failure
    /// before the first checkpoint can re-run the logic from construction.
    pub args: Value,
    /// Identity of whoever started the flow: an operator or API caller for
    /// locally started flows, the initiating peer for responder flows.
    pub invoked_by: Option<String>,
    pub status: FlowStatus,
    /// Suspension points reached so far. Dedup ids derive from this.
    pub current_step_index: StepIndex,
    /// Transient failures recorded so far. Fatal failures hospitalize
    /// without touching it.
    pub retry_count: u32,
    pub last_failure: Option<FailureRecord>,
    /// Final result once `status == Completed`.
    pub result: Option<Value>,
    /// Cooperative hospitalization request from an operator. Honored at the
    /// next checkpoint boundary, never mid-step.
    pub hospitalize_requested: bool,
    pub created_at: Timestamp,
}

impl FlowInstance {
    pub fn new(
        flow_id: FlowId,
        descriptor: String,
        args: Value,
        invoked_by: Option<String>,
    ) -> Self {
        Self {
            flow_id,
            descriptor,
            args,
            invoked_by,
            status: FlowStatus::Created,
            current_step_index: 0,
            retry_count: 0,
            last_failure: None,
            result: None,
            hospitalize_requested: false,
            created_at: now_ms(),
        }
    }
}

// ─── Session channel state ────────────────────────────────────

/// Which side of the session this flow instance is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Per-flow view of one session channel. Checkpointed with the flow so that
/// replay restores the exact send/receive cursors; advancing a cursor only
/// becomes durable at the next checkpoint, which is what makes a re-executed
/// `receive` yield the same message again instead of skipping one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelState {
    pub session_id: SessionId,
    pub peer: String,
    pub role: SessionRole,
    /// Sequence the next locally-originated frame will carry.
    pub next_send_seq: SequenceNumber,
    /// Sequence of the next inbound frame `receive` will consume.
    pub next_recv_seq: SequenceNumber,
    /// Set once a Close frame from the peer has been consumed.
    pub peer_closed: bool,
}

impl ChannelState {
    pub fn new(session_id: SessionId, peer: String, role: SessionRole) -> Self {
        // Seq 0 is the handshake frame (Open or Accept); data starts at 1.
        Self {
            session_id,
            peer,
            role,
            next_send_seq: 1,
            next_recv_seq: 1,
            peer_closed: false,
        }
    }
}

// ─── Wait state ───────────────────────────────────────────────

/// What a checkpointed flow is parked on, recorded in the checkpoint so
/// resume knows which input to derive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WaitState {
    /// Session handshake in flight; waiting for Accept or Reject.
    SessionInit { session_id: SessionId },
    /// Outbound frame committed with this checkpoint. Carrying the whole
    /// frame makes the single atomic checkpoint write its durable record:
    /// recovery can re-deliver it even if the crash struck before the
    /// dedupe ledger entry landed. Never parks: resume derivation is
    /// immediate.
    Sent { message: SessionMessage },
    /// Waiting for the next in-order frame on the session.
    Receive { session_id: SessionId },
    /// Async operation in flight, keyed by the step's dedup id.
    AsyncOp { op: String, input: Value },
}

// ─── Checkpoint ───────────────────────────────────────────────

/// Durable snapshot of a flow instance at a suspension point.
///
/// Keyed `(flow_id, step_index)`; the store retains only the latest per
/// flow. Committed before any outbound frame implied by reaching the
/// suspension point is handed to the transport (checkpoint-before-send).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    pub step_index: StepIndex,
    /// Opaque canonical JSON, never parsed by the scheduler.
    pub logic_state: Value,
    /// SHA-256 of the serialized logic state.
    pub state_hash: [u8; 32],
    /// All session channels this flow holds, with their cursors.
    pub channels: BTreeMap<SessionId, ChannelState>,
    pub wait: WaitState,
    pub written_at: Timestamp,
}

// ─── Session wire types ───────────────────────────────────────

/// Frame payloads carried over a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionFrame {
    /// Session establishment request (seq 0 from the initiator).
    Open {
        initiator: String,
        initiator_flow: FlowId,
        /// Descriptor of the flow that initiated; the receiving node maps
        /// it to the registered responder logic.
        descriptor: String,
    },
    /// Establishment confirmed (seq 0 from the responder).
    Accept { responder_flow: FlowId },
    /// Establishment refused; the session is dead.
    Reject { reason: String },
    Data { payload: Value },
    /// Session end. An ended session accepts no further sends.
    Close,
}

/// One transport delivery unit. The transport may deliver the same message
/// more than once; `(session_id, seq)` is the receiver's dedup key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub seq: SequenceNumber,
    pub frame: SessionFrame,
}

/// Node-local registry row for one session this node participates in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// Flow instance on this node that owns the channel.
    pub local_flow: FlowId,
    pub role: SessionRole,
    pub peer: String,
    /// Initiator side: set once the peer accepted.
    pub accepted: bool,
    /// Initiator side: set if the peer refused the session.
    pub rejected: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_id_is_stable_and_step_distinct() {
        let flow_id = Uuid::now_v7();
        let a = DeduplicationId::derive(flow_id, 3);
        let b = DeduplicationId::derive(flow_id, 3);
        let c = DeduplicationId::derive(flow_id, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dedup_id_distinct_across_flows() {
        let a = DeduplicationId::derive(Uuid::now_v7(), 1);
        let b = DeduplicationId::derive(Uuid::now_v7(), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn terminal_statuses() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Hospitalized.is_terminal());
        assert!(!FlowStatus::Failed.is_terminal());
        assert!(!FlowStatus::Suspended.is_terminal());
    }
}
