use crate::errors::FlowError;
use crate::types::DeduplicationId;
use async_trait::async_trait;
use serde_json::Value;

/// An externally-visible side effect wrapped so the scheduler can run it at
/// most once per logical step.
///
/// The scheduler checkpoints the flow before the first invocation, derives
/// the step's [`DeduplicationId`], and caches the successful result in the
/// dedupe ledger, so a replayed step reuses the cached result instead of
/// re-invoking. On a retryable failure the operation is re-invoked with the
/// *same* id, so the implementation is responsible for using the id to make
/// its own external effect idempotent (e.g. refusing to re-apply a write
/// already recorded under that id). The scheduler never inspects or
/// transforms the result.
#[async_trait]
pub trait AsyncOperation: Send + Sync {
    async fn execute(&self, dedup_id: &DeduplicationId, input: &Value) -> Result<Value, FlowError>;
}
