mod bus;
mod config;
mod dispatch;
mod handlers;
mod ingress;
mod lifecycle;
mod liveness;
mod node_monitor;
mod publisher;
mod reactor;
mod relay;

pub use bus::MessageBus;
pub use config::MonitorOptions;
pub use config::NodeMonitorConfig;
pub use config::NodeMonitorCreationError;
pub use handlers::MessageHandler;
pub use handlers::NodeStateChangeHandler;
pub use liveness::NodeStateChange;
pub use liveness::RemoteNodeState;
pub use node_monitor::NodeMonitor;
pub use node_monitor::SendError;
pub use node_monitor::StartError;

pub(crate) use config::validate_port;
pub(crate) use config::ClusterView;
