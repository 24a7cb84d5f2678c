use crate::message::Message;
use crate::monitor::{MessageHandler, NodeStateChangeHandler, SendError};
use std::sync::Arc;

/// The messaging and liveness surface of a running node, as seen by components layered on top
/// of it. `NodeMonitor` is the production implementation.
pub trait MessageBus: Send + Sync + 'static {
    fn my_identity(&self) -> &str;

    fn is_running(&self) -> bool;

    fn logger(&self) -> &slog::Logger;

    fn send_message(&self, message: Message) -> Result<(), SendError>;

    fn add_or_replace_message_handler(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>>;

    fn remove_message_handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>>;

    fn add_node_state_change_handler(&self, handler: Arc<dyn NodeStateChangeHandler>) -> bool;

    fn remove_node_state_change_handler(&self, handler: &Arc<dyn NodeStateChangeHandler>) -> bool;
}
