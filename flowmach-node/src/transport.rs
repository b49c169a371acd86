use anyhow::Result;
use async_trait::async_trait;
use flowmach_core::session::Transport;
use flowmach_core::types::{SessionFrame, SessionMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// In-process transport hub wiring nodes together by name.
///
/// Deliveries go through an unbounded channel per node, consumed via
/// [`crate::Node::serve_inbox`]. Frames addressed to an unknown or detached
/// node are dropped, like a lossy network. With `duplicate_data_frames` set,
/// every Data frame is delivered twice to exercise the at-least-once
/// contract in tests.
#[derive(Default)]
pub struct LoopbackHub {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<SessionMessage>>>,
    duplicate_data_frames: AtomicBool,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver every Data frame twice from now on.
    pub fn duplicate_data_frames(&self, enabled: bool) {
        self.duplicate_data_frames.store(enabled, Ordering::SeqCst);
    }

    /// Register a node inbox and return the receiving end. The node side
    /// consumes it via [`crate::Node::serve_inbox`].
    pub fn register(&self, name: impl Into<String>) -> mpsc::UnboundedReceiver<SessionMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().unwrap().insert(name.into(), tx);
        rx
    }
}

#[async_trait]
impl Transport for LoopbackHub {
    async fn deliver(&self, to: &str, message: SessionMessage) -> Result<()> {
        let sender = self.inboxes.lock().unwrap().get(to).cloned();
        let Some(sender) = sender else {
            warn!(to, "no node registered, dropping frame");
            return Ok(());
        };
        let duplicate = self.duplicate_data_frames.load(Ordering::SeqCst)
            && matches!(message.frame, SessionFrame::Data { .. });
        if duplicate && sender.send(message.clone()).is_err() {
            warn!(to, "inbox closed, dropping duplicate frame");
        }
        if sender.send(message).is_err() {
            warn!(to, "inbox closed, dropping frame");
        }
        Ok(())
    }
}
