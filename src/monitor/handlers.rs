use crate::message::Message;
use crate::monitor::RemoteNodeState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives application messages for one topic. Runs on a dispatch-pool thread and must return
/// promptly; a slow handler holds up its worker, never the reactor.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn handle_message(&self, message: Message) {
        self(message)
    }
}

/// Receives every liveness transition of every peer. Runs on a dispatch-pool thread.
pub trait NodeStateChangeHandler: Send + Sync {
    fn node_state_changed(&self, node: &str, state: RemoteNodeState, last_seen_millis: i64);
}

impl<F> NodeStateChangeHandler for F
where
    F: Fn(&str, RemoteNodeState, i64) + Send + Sync,
{
    fn node_state_changed(&self, node: &str, state: RemoteNodeState, last_seen_millis: i64) {
        self(node, state, last_seen_millis)
    }
}

/// HandlerRegistry is shared between the public API (any thread), the reactor (lookups to decide
/// whether to dispatch) and the dispatch workers (lookups to invoke). Handlers are cloned out
/// of the locks before they are called.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    message_handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    node_state_change_handlers: Mutex<Vec<Arc<dyn NodeStateChangeHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns false if `topic` already had a handler, which is kept.
    pub(crate) fn add_message_handler(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> bool {
        let mut handlers = self.lock_message_handlers();
        if handlers.contains_key(topic) {
            return false;
        }
        handlers.insert(topic.to_string(), handler);
        true
    }

    pub(crate) fn add_or_replace_message_handler(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.lock_message_handlers().insert(topic.to_string(), handler)
    }

    pub(crate) fn remove_message_handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.lock_message_handlers().remove(topic)
    }

    pub(crate) fn message_handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.lock_message_handlers().get(topic).cloned()
    }

    pub(crate) fn has_message_handler(&self, topic: &str) -> bool {
        self.lock_message_handlers().contains_key(topic)
    }

    /// Set semantics by identity of the `Arc`. Returns false if this exact handler is present.
    pub(crate) fn add_node_state_change_handler(&self, handler: Arc<dyn NodeStateChangeHandler>) -> bool {
        let mut handlers = self.lock_node_state_change_handlers();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub(crate) fn remove_node_state_change_handler(&self, handler: &Arc<dyn NodeStateChangeHandler>) -> bool {
        let mut handlers = self.lock_node_state_change_handlers();
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    pub(crate) fn node_state_change_handlers(&self) -> Vec<Arc<dyn NodeStateChangeHandler>> {
        self.lock_node_state_change_handlers().clone()
    }

    fn lock_message_handlers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn MessageHandler>>> {
        self.message_handlers
            .lock()
            .expect("HandlerRegistry message handlers mutex guard poison")
    }

    fn lock_node_state_change_handlers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn NodeStateChangeHandler>>> {
        self.node_state_change_handlers
            .lock()
            .expect("HandlerRegistry node state handlers mutex guard poison")
    }
}

// Compare data pointers only. Vtable pointers of the same type may differ across codegen units.
fn same_handler(a: &Arc<dyn NodeStateChangeHandler>, b: &Arc<dyn NodeStateChangeHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
