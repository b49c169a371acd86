//! flowmach-core: durable flow state machine.
//!
//! Runs long-lived, multi-step protocols ("flows") between independent
//! nodes, checkpointing at every suspension point so a crash, restart or
//! transient failure never loses or duplicates work. Flow logic is written
//! as an explicit step-indexed state machine ([`FlowLogic`]); the scheduler
//! ([`FlowMachine`]) drives it, enforcing checkpoint-before-send, sequence
//! deduplicated sessions, exactly-once async operations and policy-driven
//! retry.

pub mod errors;
pub mod events;
pub mod logic;
pub mod machine;
pub mod ops;
pub mod resolve;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;

pub use errors::FlowError;
pub use events::{RuntimeEvent, WaitDesc};
pub use logic::{FlowLogic, StepInput, StepOutcome, StepTransition, SuspendRequest};
pub use machine::{FlowMachine, RunOutcome, StartOutcome};
pub use ops::AsyncOperation;
pub use resolve::{MemoryResolver, ResolveError, ResolvedState, StatePointer, StateRef, StateResolver};
pub use retry::{RetryDecision, RetryPolicy};
pub use session::{InboundDisposition, Transport};
pub use store::{CheckpointStore, DedupeRecord, MemoryStore};
pub use types::{
    ChannelState, Checkpoint, DeduplicationId, ErrorClass, FailureRecord, FlowId, FlowInstance,
    FlowStatus, SequenceNumber, SessionFrame, SessionId, SessionMessage, SessionRecord,
    SessionRole, StepIndex, WaitState,
};
