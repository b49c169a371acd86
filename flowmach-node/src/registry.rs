use flowmach_core::logic::FlowLogic;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps flow descriptors to their logic, and initiating descriptors to the
/// responder logic a peer's session-open spawns.
#[derive(Default)]
pub struct FlowRegistry {
    logics: HashMap<String, Arc<dyn FlowLogic>>,
    /// Initiator descriptor → responder descriptor.
    initiated_by: HashMap<String, String>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow startable on this node.
    pub fn register(
        mut self,
        descriptor: impl Into<String>,
        logic: Arc<dyn FlowLogic>,
    ) -> Self {
        self.logics.insert(descriptor.into(), logic);
        self
    }

    /// Register the responder spawned when a peer's flow with
    /// `initiator_descriptor` opens a session to this node.
    pub fn register_responder(
        mut self,
        initiator_descriptor: impl Into<String>,
        responder_descriptor: impl Into<String>,
        logic: Arc<dyn FlowLogic>,
    ) -> Self {
        let responder = responder_descriptor.into();
        self.logics.insert(responder.clone(), logic);
        self.initiated_by
            .insert(initiator_descriptor.into(), responder);
        self
    }

    pub fn get(&self, descriptor: &str) -> Option<Arc<dyn FlowLogic>> {
        self.logics.get(descriptor).cloned()
    }

    /// Responder descriptor and logic for an inbound session open.
    pub fn responder_for(&self, initiator_descriptor: &str) -> Option<(String, Arc<dyn FlowLogic>)> {
        let responder = self.initiated_by.get(initiator_descriptor)?;
        let logic = self.logics.get(responder)?;
        Some((responder.clone(), logic.clone()))
    }
}
