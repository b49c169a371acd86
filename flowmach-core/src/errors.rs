use crate::types::ErrorClass;
use thiserror::Error;

/// Failure taxonomy for flow execution.
///
/// Failures are values returned from each step, classified by the retry
/// policy as data; the scheduler never relies on unwinding for retry
/// control flow.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FlowError {
    /// Raised before the first suspension point while the flow was being
    /// constructed. Reported synchronously to the caller, never retried,
    /// and leaves zero checkpoints behind.
    #[error("flow construction failed: {0}")]
    Construction(String),

    /// Contention or infrastructure hiccup. Retryable per policy.
    #[error("transient execution failure: {0}")]
    Transient(String),

    /// Non-retryable logic failure. Hospitalizes immediately.
    #[error("fatal execution failure: {0}")]
    Fatal(String),

    /// Peer ended the session before sending what we were waiting for.
    #[error("peer ended session before sending")]
    UnexpectedSessionEnd,

    /// Session establishment refused by the peer.
    #[error("session rejected by peer: {0}")]
    SessionRejected(String),

    /// Inbound payload did not have the shape the flow expected.
    #[error("unexpected message shape: {0}")]
    UnexpectedMessageShape(String),

    /// A configured per-suspension timeout elapsed. Subject to retry policy.
    #[error("suspension timed out at step {step_index}")]
    SuspensionTimeout { step_index: u64 },

    /// Unknown async operation or flow descriptor.
    #[error("unknown registration: {0}")]
    Unregistered(String),
}

impl FlowError {
    /// Classification consumed by the retry policy.
    ///
    /// Session protocol failures are fatal unless the flow logic catches
    /// them itself; timeouts are treated as transient so contention at the
    /// peer gets another attempt.
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowError::Transient(_) | FlowError::SuspensionTimeout { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_construction(&self) -> bool {
        matches!(self, FlowError::Construction(_))
    }
}
