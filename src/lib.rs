mod client;
mod election;
mod message;
mod monitor;

pub use client::LocalClient;
pub use client::LocalClientConfig;
pub use client::LocalClientError;
pub use election::ElectionError;
pub use election::PrimarySecondaryMonitor;
pub use election::RandomRanks;
pub use election::RankSource;
pub use election::Role;
pub use election::RoleChangeHandler;
pub use election::ANNOUNCE_TOPIC;
pub use message::is_reserved_topic;
pub use message::FrameCodec;
pub use message::Message;
pub use message::MessageError;
pub use message::ALIVE_TOPIC;
pub use message::RELAY_TOPIC;
pub use message::STOP_TOPIC;
pub use message::WILDCARD;
pub use monitor::MessageBus;
pub use monitor::MessageHandler;
pub use monitor::MonitorOptions;
pub use monitor::NodeMonitor;
pub use monitor::NodeMonitorConfig;
pub use monitor::NodeMonitorCreationError;
pub use monitor::NodeStateChange;
pub use monitor::NodeStateChangeHandler;
pub use monitor::RemoteNodeState;
pub use monitor::SendError;
pub use monitor::StartError;
