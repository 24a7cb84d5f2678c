use crate::message::{Message, WILDCARD};
use crate::monitor::{MessageHandler, NodeStateChangeHandler};
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

pub struct NodeMonitorConfig {
    /// Network-resolvable name of this node. Peers connect to it on `port`.
    pub my_identity: String,
    /// Every node in the cluster. This node may be included; it is filtered out.
    pub cluster_members: Vec<String>,
    /// Cluster traffic uses `port`, same-host clients use `port + 1`.
    pub port: u16,
    pub logger: slog::Logger,
    pub options: MonitorOptions,
    pub node_state_change_handler: Option<Arc<dyn NodeStateChangeHandler>>,
    pub message_handlers: Vec<(String, Arc<dyn MessageHandler>)>,
}

#[derive(Clone, Default)]
pub struct MonitorOptions {
    pub heartbeat_period: Option<Duration>,
    pub expiry_window: Option<Duration>,
    pub dispatch_threads: Option<usize>,
    pub io_threads: Option<usize>,
    /// Address of the cluster listener. Defaults to all interfaces.
    pub bind_ip: Option<IpAddr>,
    /// Address of the same-host client listener. Defaults to localhost.
    pub local_ip: Option<IpAddr>,
}

#[derive(Clone, Debug)]
pub(crate) struct MonitorOptionsValidated {
    pub(crate) heartbeat_period: Duration,
    pub(crate) expiry_window: Duration,
    pub(crate) dispatch_threads: usize,
    pub(crate) io_threads: usize,
    pub(crate) bind_ip: IpAddr,
    pub(crate) local_ip: IpAddr,
}

impl MonitorOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_period == Duration::from_millis(0) {
            return Err("Heartbeat period must be greater than zero");
        }
        if self.expiry_window <= self.heartbeat_period {
            return Err("Expiry window must be greater than the heartbeat period");
        }
        if self.dispatch_threads == 0 {
            return Err("At least one dispatch thread is required");
        }
        if self.io_threads == 0 {
            return Err("At least one I/O thread is required");
        }

        Ok(())
    }
}

impl TryFrom<MonitorOptions> for MonitorOptionsValidated {
    type Error = &'static str;

    fn try_from(options: MonitorOptions) -> Result<Self, Self::Error> {
        let heartbeat_period = options.heartbeat_period.unwrap_or(Duration::from_millis(1000));
        let values = MonitorOptionsValidated {
            heartbeat_period,
            expiry_window: options.expiry_window.unwrap_or(heartbeat_period * 5 / 2),
            dispatch_threads: options.dispatch_threads.unwrap_or(3),
            io_threads: options.io_threads.unwrap_or(1),
            bind_ip: options.bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            local_ip: options.local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum NodeMonitorCreationError {
    #[error("Invalid identity '{0}': {1}")]
    InvalidIdentity(String, &'static str),
    #[error("Invalid cluster member '{0}': {1}")]
    InvalidClusterMember(String, &'static str),
    #[error("Port {0} is privileged, it must be greater than 1024")]
    PrivilegedPort(u16),
    #[error("Port {0} is out of range, it must be less than 65535")]
    PortOutOfRange(u16),
    #[error("Cannot register a handler for reserved topic '{0}'")]
    ReservedTopic(String),
    #[error("Illegal options: {0}")]
    IllegalOptions(&'static str),
}

pub(crate) fn validate_identity(identity: &str) -> Result<(), &'static str> {
    if identity.trim().is_empty() {
        return Err("identity cannot be blank");
    }
    if identity == WILDCARD {
        return Err("identity cannot be the wildcard");
    }
    if identity.contains(',') {
        return Err("identity cannot contain ','");
    }

    Ok(())
}

/// Both ports must be unprivileged and `port + 1` must fit.
pub(crate) fn validate_port(port: u16) -> Result<(), NodeMonitorCreationError> {
    if port <= 1024 {
        return Err(NodeMonitorCreationError::PrivilegedPort(port));
    }
    if port >= u16::MAX {
        return Err(NodeMonitorCreationError::PortOutOfRange(port));
    }

    Ok(())
}

/// This node plus its static set of peers.
#[derive(Clone, Debug)]
pub(crate) struct ClusterView {
    my_identity: String,
    peers: BTreeSet<String>,
}

impl ClusterView {
    pub(crate) fn new(my_identity: String, cluster_members: Vec<String>) -> Result<Self, NodeMonitorCreationError> {
        validate_identity(&my_identity).map_err(|e| NodeMonitorCreationError::InvalidIdentity(my_identity.clone(), e))?;

        let mut peers = BTreeSet::new();
        for member in cluster_members.into_iter() {
            validate_identity(&member).map_err(|e| NodeMonitorCreationError::InvalidClusterMember(member.clone(), e))?;
            if member != my_identity {
                peers.insert(member);
            }
        }

        Ok(ClusterView { my_identity, peers })
    }

    pub(crate) fn my_identity(&self) -> &str {
        &self.my_identity
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = &String> {
        self.peers.iter()
    }

    pub(crate) fn is_member(&self, node: &str) -> bool {
        node == self.my_identity || self.peers.contains(node)
    }

    /// Expand the wildcard to every peer plus this node. Other targets are kept.
    pub(crate) fn resolve_targets(&self, mut message: Message) -> Message {
        if !message.is_wildcard() {
            return message;
        }

        let resolved: BTreeSet<String> = message
            .targets()
            .filter(|t| *t != WILDCARD)
            .map(str::to_string)
            .chain(self.peers.iter().cloned())
            .chain(std::iter::once(self.my_identity.clone()))
            .collect();
        // Never empty: this node is always included.
        let _ = message.replace_targets(resolved);

        message
    }
}
