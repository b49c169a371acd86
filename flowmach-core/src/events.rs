use crate::types::*;
use serde::{Deserialize, Serialize};

/// Serializable description of a wait state for the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WaitDesc {
    SessionInit { session_id: SessionId },
    Sent { session_id: SessionId, seq: SequenceNumber },
    Receive { session_id: SessionId },
    AsyncOp { op: String },
}

impl From<&WaitState> for WaitDesc {
    fn from(wait: &WaitState) -> Self {
        match wait {
            WaitState::SessionInit { session_id } => WaitDesc::SessionInit {
                session_id: *session_id,
            },
            WaitState::Sent { message } => WaitDesc::Sent {
                session_id: message.session_id,
                seq: message.seq,
            },
            WaitState::Receive { session_id } => WaitDesc::Receive {
                session_id: *session_id,
            },
            WaitState::AsyncOp { op, .. } => WaitDesc::AsyncOp { op: op.clone() },
        }
    }
}

/// Runtime events: the durable audit trail and monitoring surface for every
/// flow instance. Status, retry counts, terminal failures and progress
/// labels all land here for operator inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    FlowStarted {
        flow_id: FlowId,
        descriptor: String,
    },
    /// Coarse milestone label emitted by flow logic for observability.
    ProgressLabel {
        label: String,
    },
    CheckpointWritten {
        step_index: StepIndex,
        wait: WaitDesc,
    },
    SessionInitiated {
        session_id: SessionId,
        peer: String,
    },
    SessionAccepted {
        session_id: SessionId,
    },
    SessionRejected {
        session_id: SessionId,
        reason: String,
    },
    MessageSent {
        session_id: SessionId,
        seq: SequenceNumber,
    },
    /// A replayed send suppressed because the step's dedup id was already
    /// recorded.
    SendSuppressed {
        session_id: SessionId,
        seq: SequenceNumber,
    },
    MessageReceived {
        session_id: SessionId,
        seq: SequenceNumber,
    },
    /// Duplicate transport delivery discarded by sequence number.
    DuplicateDeliveryDropped {
        session_id: SessionId,
        seq: SequenceNumber,
    },
    SessionClosed {
        session_id: SessionId,
    },
    AsyncOpStarted {
        dedup_id: DeduplicationId,
        op: String,
    },
    AsyncOpCompleted {
        dedup_id: DeduplicationId,
    },
    /// A cached async-op completion was reused instead of re-invoking.
    AsyncOpReplayed {
        dedup_id: DeduplicationId,
    },
    RetryScheduled {
        step_index: StepIndex,
        retry_count: u32,
        after_ms: u64,
        error: String,
    },
    Hospitalized {
        retry_count: u32,
        error: String,
    },
    Completed {
        at: Timestamp,
    },
}
