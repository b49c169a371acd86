//! Ledger state resolution, the external collaborator interface.
//!
//! Flow logic may hold pointers to ledger states instead of the states
//! themselves: a static pointer names one specific prior output, a linear
//! pointer names a logical identity whose latest version is found via a
//! query service. Resolution is consumed by flow logic, not by the
//! scheduler, and is not a suspension point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Reference to one specific output of a recorded transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateRef {
    /// Hex-encoded transaction hash.
    pub tx_hash: String,
    pub output_index: u32,
}

/// A pointer to a ledger state, resolvable via a query service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatePointer {
    /// Points at one immutable output. The pointed-to state may have been
    /// consumed by the time it is resolved.
    Static { state_ref: StateRef },
    /// Points at a logical identity; resolves to the latest unconsumed
    /// version the resolving node knows about.
    Linear { linear_id: Uuid },
}

/// A resolved ledger state and the reference it was found under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedState {
    pub state_ref: StateRef,
    pub data: Value,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ResolveError {
    /// The reference is unknown to the resolving node.
    #[error("state reference unknown: {0}")]
    Unknown(String),
    /// Every known version of the pointed-to state has left the ledger.
    #[error("state no longer active: {0}")]
    Inactive(String),
}

/// Query service that resolves state pointers: a vault-style lookup
/// provided by the surrounding node, external to the flow core.
#[async_trait]
pub trait StateResolver: Send + Sync {
    async fn resolve(&self, pointer: &StatePointer) -> Result<ResolvedState, ResolveError>;
}

// ── MemoryResolver ──

/// In-memory resolver for tests: a flat map of recorded states with a
/// consumed flag, supporting both pointer kinds.
#[derive(Default)]
pub struct MemoryResolver {
    states: std::sync::Mutex<Vec<RecordedState>>,
}

struct RecordedState {
    state_ref: StateRef,
    linear_id: Option<Uuid>,
    data: Value,
    consumed: bool,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, state_ref: StateRef, linear_id: Option<Uuid>, data: Value) {
        let mut states = self.states.lock().unwrap();
        // A new version of a linear state consumes its predecessor.
        if let Some(id) = linear_id {
            for prior in states.iter_mut().filter(|s| s.linear_id == Some(id)) {
                prior.consumed = true;
            }
        }
        states.push(RecordedState {
            state_ref,
            linear_id,
            data,
            consumed: false,
        });
    }

    pub fn consume(&self, state_ref: &StateRef) {
        let mut states = self.states.lock().unwrap();
        for state in states.iter_mut().filter(|s| &s.state_ref == state_ref) {
            state.consumed = true;
        }
    }
}

#[async_trait]
impl StateResolver for MemoryResolver {
    async fn resolve(&self, pointer: &StatePointer) -> Result<ResolvedState, ResolveError> {
        let states = self.states.lock().unwrap();
        match pointer {
            StatePointer::Static { state_ref } => states
                .iter()
                .find(|s| &s.state_ref == state_ref)
                .map(|s| ResolvedState {
                    state_ref: s.state_ref.clone(),
                    data: s.data.clone(),
                })
                .ok_or_else(|| {
                    ResolveError::Unknown(format!(
                        "{}:{}",
                        state_ref.tx_hash, state_ref.output_index
                    ))
                }),
            StatePointer::Linear { linear_id } => {
                let versions: Vec<&RecordedState> = states
                    .iter()
                    .filter(|s| s.linear_id == Some(*linear_id))
                    .collect();
                if versions.is_empty() {
                    return Err(ResolveError::Unknown(linear_id.to_string()));
                }
                versions
                    .iter()
                    .find(|s| !s.consumed)
                    .map(|s| ResolvedState {
                        state_ref: s.state_ref.clone(),
                        data: s.data.clone(),
                    })
                    .ok_or_else(|| ResolveError::Inactive(linear_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_ref(n: u32) -> StateRef {
        StateRef {
            tx_hash: format!("{n:064x}"),
            output_index: 0,
        }
    }

    #[tokio::test]
    async fn static_pointer_resolves_even_when_consumed() {
        let resolver = MemoryResolver::new();
        resolver.record(state_ref(1), None, json!({ "v": 1 }));
        resolver.consume(&state_ref(1));

        let resolved = resolver
            .resolve(&StatePointer::Static {
                state_ref: state_ref(1),
            })
            .await
            .unwrap();
        assert_eq!(resolved.data, json!({ "v": 1 }));
    }

    #[tokio::test]
    async fn linear_pointer_resolves_latest_unconsumed_version() {
        let resolver = MemoryResolver::new();
        let id = Uuid::now_v7();
        resolver.record(state_ref(1), Some(id), json!({ "v": 1 }));
        resolver.record(state_ref(2), Some(id), json!({ "v": 2 }));

        let resolved = resolver
            .resolve(&StatePointer::Linear { linear_id: id })
            .await
            .unwrap();
        assert_eq!(resolved.data, json!({ "v": 2 }));
    }

    #[tokio::test]
    async fn linear_pointer_errors() {
        let resolver = MemoryResolver::new();
        let id = Uuid::now_v7();
        assert_eq!(
            resolver
                .resolve(&StatePointer::Linear { linear_id: id })
                .await,
            Err(ResolveError::Unknown(id.to_string()))
        );

        resolver.record(state_ref(1), Some(id), json!({ "v": 1 }));
        resolver.consume(&state_ref(1));
        assert_eq!(
            resolver
                .resolve(&StatePointer::Linear { linear_id: id })
                .await,
            Err(ResolveError::Inactive(id.to_string()))
        );
    }
}
