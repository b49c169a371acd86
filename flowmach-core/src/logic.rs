use crate::errors::FlowError;
use crate::types::SessionId;
use serde_json::Value;

/// Input fed into a flow's next step: the resumption value of the
/// suspension point the flow last parked on.
#[derive(Clone, Debug, PartialEq)]
pub enum StepInput {
    /// First entry after construction.
    Begin,
    /// `Initiate` resolved; the peer accepted the session.
    SessionEstablished { session: SessionId },
    /// `Send` was durably recorded.
    Delivered,
    /// `Receive` resolved with the next in-order payload.
    Message { session: SessionId, payload: Value },
    /// `ExecuteAsync` resolved with the operation's result.
    AsyncResult { value: Value },
}

/// One of the four suspension points a flow may reach. Nothing else
/// suspends.
#[derive(Clone, Debug, PartialEq)]
pub enum SuspendRequest {
    /// Establish a session with the named peer.
    Initiate { peer: String },
    /// Enqueue a payload on the session. Resumes once durably recorded;
    /// does not wait for peer acknowledgement.
    Send { session: SessionId, payload: Value },
    /// Wait for the next in-order payload on the session.
    Receive { session: SessionId },
    /// Run a registered async operation exactly once for this step.
    ExecuteAsync { op: String, input: Value },
}

/// What a step resolved to.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Logic returned; the flow is done.
    Completed(Value),
    /// Logic reached a suspension point.
    Suspend(SuspendRequest),
}

/// Result of one step execution: the successor logic state plus the outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct StepTransition {
    pub state: Value,
    pub outcome: StepOutcome,
    /// Milestone labels to emit before acting on the outcome.
    pub progress: Vec<String>,
}

impl StepTransition {
    pub fn suspend(state: Value, request: SuspendRequest) -> Self {
        Self {
            state,
            outcome: StepOutcome::Suspend(request),
            progress: Vec::new(),
        }
    }

    pub fn complete(state: Value, result: Value) -> Self {
        Self {
            state,
            outcome: StepOutcome::Completed(result),
            progress: Vec::new(),
        }
    }

    pub fn with_progress(mut self, label: impl Into<String>) -> Self {
        self.progress.push(label.into());
        self
    }
}

/// A flow's business logic, written as an explicit step-indexed state
/// machine whose entire live state is plain data.
///
/// The scheduler calls `construct` once, then `step` repeatedly, feeding the
/// resumption value for the suspension point the previous call parked on.
/// The logic state passed in and out is opaque canonical JSON: the scheduler
/// checkpoints it verbatim and never parses it. Because any step may be
/// replayed after a crash or retry, steps must be pure transitions over
/// `(state, input)`: all externally-visible effects go through `Send` /
/// `ExecuteAsync`, which the scheduler deduplicates.
///
/// Retries are transparent: nothing in `StepInput` reveals whether this is
/// the first execution of a step or a replay, and branching on it is an
/// anti-pattern this interface deliberately makes impossible.
pub trait FlowLogic: Send + Sync {
    /// Set up the initial logic state from the caller's arguments.
    ///
    /// A failure here is a `Construction` error: reported synchronously to
    /// whoever started the flow, never retried.
    fn construct(&self, args: &Value) -> Result<Value, FlowError>;

    /// Run from the given state until the next suspension point or
    /// completion.
    fn step(&self, state: Value, input: StepInput) -> Result<StepTransition, FlowError>;
}
