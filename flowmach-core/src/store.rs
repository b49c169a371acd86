use crate::events::RuntimeEvent;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// One entry in the dedupe ledger: the durable record of an
/// externally-visible effect performed under a step's dedup id.
///
/// A replayed step finds its entry here and reuses it instead of performing
/// the effect again: session creation yields the same session id, a send is
/// suppressed, an async operation returns its cached result.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum DedupeRecord {
    SessionOpened { session_id: SessionId },
    SendRecorded { message: SessionMessage },
    AsyncCompleted { value: Value },
}

/// Persistence trait for all flow state.
///
/// The scheduler operates exclusively through this trait, enabling pluggable
/// backends (MemoryStore for tests/POC, a relational store for production).
/// `put_checkpoint` must be atomic and durable before returning; the store
/// retains only the latest checkpoint per flow.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    // ── Instances ──

    async fn save_instance(&self, instance: &FlowInstance) -> Result<()>;
    async fn load_instance(&self, flow_id: FlowId) -> Result<Option<FlowInstance>>;
    /// All instances not in a terminal status: the crash-recovery working
    /// set enumerated on process restart.
    async fn non_terminal_instances(&self) -> Result<Vec<FlowInstance>>;

    // ── Checkpoints ──

    /// Durable, atomic write. Supersedes any earlier checkpoint for the flow.
    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn latest_checkpoint(&self, flow_id: FlowId) -> Result<Option<Checkpoint>>;
    /// Discard checkpoints on completion.
    async fn delete_checkpoints(&self, flow_id: FlowId) -> Result<()>;

    // ── Dedupe ledger ──

    async fn dedupe_get(&self, key: &DeduplicationId) -> Result<Option<DedupeRecord>>;
    async fn dedupe_put(&self, key: &DeduplicationId, record: &DedupeRecord) -> Result<()>;

    // ── Session registry ──

    async fn save_session(&self, record: &SessionRecord) -> Result<()>;
    async fn load_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>>;
    /// All sessions owned by a flow instance on this node.
    async fn sessions_for_flow(&self, flow_id: FlowId) -> Result<Vec<SessionRecord>>;

    // ── Session inbox ──

    /// Buffer an inbound frame. Returns false if `(session_id, seq)` was
    /// already observed, meaning the at-least-once transport duplicated it.
    async fn push_inbox(
        &self,
        session_id: SessionId,
        seq: SequenceNumber,
        frame: &SessionFrame,
    ) -> Result<bool>;
    async fn peek_inbox(
        &self,
        session_id: SessionId,
        seq: SequenceNumber,
    ) -> Result<Option<SessionFrame>>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, flow_id: FlowId, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(&self, flow_id: FlowId, from_seq: u64)
        -> Result<Vec<(u64, RuntimeEvent)>>;
}

// ── MemoryStore ──

#[derive(Default)]
struct MemoryInner {
    instances: HashMap<FlowId, FlowInstance>,
    checkpoints: HashMap<FlowId, Checkpoint>,
    dedupe: HashMap<DeduplicationId, DedupeRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    inboxes: HashMap<SessionId, BTreeMap<SequenceNumber, SessionFrame>>,
    events: HashMap<FlowId, Vec<RuntimeEvent>>,
}

/// In-memory store for tests and single-process POC deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints currently retained for a flow (0 or 1).
    pub fn checkpoint_count(&self, flow_id: FlowId) -> usize {
        let inner = self.inner.lock().unwrap();
        usize::from(inner.checkpoints.contains_key(&flow_id))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save_instance(&self, instance: &FlowInstance) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(instance.flow_id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, flow_id: FlowId) -> Result<Option<FlowInstance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.instances.get(&flow_id).cloned())
    }

    async fn non_terminal_instances(&self) -> Result<Vec<FlowInstance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .instances
            .values()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .checkpoints
            .insert(checkpoint.flow_id, checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, flow_id: FlowId) -> Result<Option<Checkpoint>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.checkpoints.get(&flow_id).cloned())
    }

    async fn delete_checkpoints(&self, flow_id: FlowId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.checkpoints.remove(&flow_id);
        Ok(())
    }

    async fn dedupe_get(&self, key: &DeduplicationId) -> Result<Option<DedupeRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.dedupe.get(key).cloned())
    }

    async fn dedupe_put(&self, key: &DeduplicationId, record: &DedupeRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dedupe.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(record.session_id, record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.get(&session_id).cloned())
    }

    async fn sessions_for_flow(&self, flow_id: FlowId) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sessions
            .values()
            .filter(|r| r.local_flow == flow_id)
            .cloned()
            .collect())
    }

    async fn push_inbox(
        &self,
        session_id: SessionId,
        seq: SequenceNumber,
        frame: &SessionFrame,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let inbox = inner.inboxes.entry(session_id).or_default();
        if inbox.contains_key(&seq) {
            return Ok(false);
        }
        inbox.insert(seq, frame.clone());
        Ok(true)
    }

    async fn peek_inbox(
        &self,
        session_id: SessionId,
        seq: SequenceNumber,
    ) -> Result<Option<SessionFrame>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .inboxes
            .get(&session_id)
            .and_then(|inbox| inbox.get(&seq))
            .cloned())
    }

    async fn append_event(&self, flow_id: FlowId, event: &RuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.events.entry(flow_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_events(
        &self,
        flow_id: FlowId,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .get(&flow_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from_seq as usize)
                    .map(|(i, e)| (i as u64, e.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn only_latest_checkpoint_is_retained() {
        let store = MemoryStore::new();
        let flow_id = Uuid::now_v7();
        for step in 1..=3u64 {
            let cp = Checkpoint {
                flow_id,
                step_index: step,
                logic_state: json!({ "step": step }),
                state_hash: [0; 32],
                channels: Default::default(),
                wait: WaitState::Receive {
                    session_id: Uuid::now_v7(),
                },
                written_at: now_ms(),
            };
            store.put_checkpoint(&cp).await.unwrap();
        }
        assert_eq!(store.checkpoint_count(flow_id), 1);
        let latest = store.latest_checkpoint(flow_id).await.unwrap().unwrap();
        assert_eq!(latest.step_index, 3);
    }

    #[tokio::test]
    async fn inbox_rejects_duplicate_sequence() {
        let store = MemoryStore::new();
        let session = Uuid::now_v7();
        let frame = SessionFrame::Data {
            payload: json!("hello"),
        };
        assert!(store.push_inbox(session, 1, &frame).await.unwrap());
        assert!(!store.push_inbox(session, 1, &frame).await.unwrap());
        assert_eq!(store.peek_inbox(session, 1).await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn event_log_is_append_only_with_sequence() {
        let store = MemoryStore::new();
        let flow_id = Uuid::now_v7();
        let a = store
            .append_event(flow_id, &RuntimeEvent::ProgressLabel { label: "one".into() })
            .await
            .unwrap();
        let b = store
            .append_event(flow_id, &RuntimeEvent::ProgressLabel { label: "two".into() })
            .await
            .unwrap();
        assert_eq!((a, b), (0, 1));
        let events = store.read_events(flow_id, 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 1);
    }
}
