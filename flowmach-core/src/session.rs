use crate::store::CheckpointStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Transport contract consumed by the session layer.
///
/// Delivery is at-least-once: the same message may arrive more than once
/// and retried deliveries are not ordered, but sequence numbers are
/// monotonic per sender. Everything above relies on `(session_id, seq)`
/// deduplication, never on the transport behaving better than this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, to: &str, message: SessionMessage) -> Result<()>;
}

/// What the next in-order inbound frame resolves to for a `receive`.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundDisposition {
    /// Nothing buffered at the channel's receive cursor yet.
    Pending,
    /// The next in-order frame is a payload.
    Payload(Value),
    /// The next in-order frame is the peer's session end.
    Closed,
}

/// Look up the frame at the channel's receive cursor.
///
/// Consuming it (advancing `next_recv_seq`) is the caller's business: the
/// cursor only becomes durable at the next checkpoint, which is exactly what
/// makes a replayed `receive` yield the same payload again.
pub async fn next_inbound(
    store: &dyn CheckpointStore,
    channel: &ChannelState,
) -> Result<InboundDisposition> {
    if channel.peer_closed {
        return Ok(InboundDisposition::Closed);
    }
    match store
        .peek_inbox(channel.session_id, channel.next_recv_seq)
        .await?
    {
        None => Ok(InboundDisposition::Pending),
        Some(SessionFrame::Data { payload }) => Ok(InboundDisposition::Payload(payload)),
        Some(SessionFrame::Close) => Ok(InboundDisposition::Closed),
        Some(other) => {
            // Handshake frames never occupy a data sequence slot.
            anyhow::bail!(
                "unexpected frame at seq {} on session {}: {:?}",
                channel.next_recv_seq,
                channel.session_id,
                other
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    fn channel(session_id: SessionId) -> ChannelState {
        ChannelState::new(session_id, "peer".into(), SessionRole::Initiator)
    }

    #[tokio::test]
    async fn pending_until_cursor_frame_arrives() {
        let store = MemoryStore::new();
        let session = Uuid::now_v7();
        let ch = channel(session);

        assert_eq!(
            next_inbound(&store, &ch).await.unwrap(),
            InboundDisposition::Pending
        );

        // Out-of-order arrival: seq 2 first. Still pending at cursor 1.
        store
            .push_inbox(session, 2, &SessionFrame::Data { payload: json!(2) })
            .await
            .unwrap();
        assert_eq!(
            next_inbound(&store, &ch).await.unwrap(),
            InboundDisposition::Pending
        );

        store
            .push_inbox(session, 1, &SessionFrame::Data { payload: json!(1) })
            .await
            .unwrap();
        assert_eq!(
            next_inbound(&store, &ch).await.unwrap(),
            InboundDisposition::Payload(json!(1))
        );
    }

    #[tokio::test]
    async fn close_frame_reports_closed() {
        let store = MemoryStore::new();
        let session = Uuid::now_v7();
        let ch = channel(session);
        store
            .push_inbox(session, 1, &SessionFrame::Close)
            .await
            .unwrap();
        assert_eq!(
            next_inbound(&store, &ch).await.unwrap(),
            InboundDisposition::Closed
        );
    }
}
