use crate::message::{is_reserved_topic, FrameCodec, Message};
use crate::monitor::{validate_port, ClusterView, NodeMonitorCreationError};
use futures::SinkExt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;

pub struct LocalClientConfig {
    /// Must match the identity of the node monitor running on this host.
    pub my_identity: String,
    pub cluster_members: Vec<String>,
    /// The node monitor's cluster port. The client connects to `port + 1`.
    pub port: u16,
    pub logger: slog::Logger,
    /// Defaults to `127.0.0.1`.
    pub local_ip: Option<IpAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum LocalClientError {
    #[error("Sender '{sender}' does not match this client's identity '{my_identity}'")]
    SpoofedSender { sender: String, my_identity: String },
    #[error("Topic '{0}' is reserved")]
    ReservedTopic(String),
    #[error("Failed to connect to node monitor at {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to send to node monitor at {addr}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// LocalClient injects messages into the node monitor running on the same host, through its
/// local listener. The monitor publishes them to the cluster on the client's behalf.
///
/// The connection is opened on first send. A failed send drops it and returns the error; the
/// next send connects again.
pub struct LocalClient {
    cluster: ClusterView,
    addr: SocketAddr,
    logger: slog::Logger,
    connection: Option<FramedWrite<TcpStream, FrameCodec>>,
}

impl LocalClient {
    pub fn new(config: LocalClientConfig) -> Result<Self, NodeMonitorCreationError> {
        let cluster = ClusterView::new(config.my_identity, config.cluster_members)?;
        validate_port(config.port)?;
        let addr = SocketAddr::new(
            config.local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            config.port + 1,
        );
        let logger = config.logger.new(slog::o!(
            "node" => cluster.my_identity().to_string(),
            "component" => "local_client",
        ));

        Ok(LocalClient {
            cluster,
            addr,
            logger,
            connection: None,
        })
    }

    pub fn my_identity(&self) -> &str {
        self.cluster.my_identity()
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), LocalClientError> {
        if message.sender() != self.cluster.my_identity() {
            return Err(LocalClientError::SpoofedSender {
                sender: message.sender().to_string(),
                my_identity: self.cluster.my_identity().to_string(),
            });
        }
        if is_reserved_topic(message.topic()) {
            return Err(LocalClientError::ReservedTopic(message.topic().to_string()));
        }

        let wire_frames = self.cluster.resolve_targets(message).to_wire_frames();
        let mut connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };

        match connection.send(wire_frames).await {
            Ok(()) => {
                self.connection = Some(connection);
                Ok(())
            }
            Err(source) => {
                slog::warn!(self.logger, "Send failed, dropping connection: {}", source);
                Err(LocalClientError::Send { addr: self.addr, source })
            }
        }
    }

    /// Flush and drop the connection, if any.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = SinkExt::<Vec<String>>::close(&mut connection).await {
                slog::debug!(self.logger, "Error while closing connection: {}", e);
            }
        }
    }

    async fn connect(&self) -> Result<FramedWrite<TcpStream, FrameCodec>, LocalClientError> {
        match TcpStream::connect(self.addr).await {
            Ok(stream) => {
                slog::debug!(self.logger, "Connected to node monitor"; "addr" => %self.addr);
                Ok(FramedWrite::new(stream, FrameCodec))
            }
            Err(source) => {
                slog::warn!(self.logger, "Failed to connect to node monitor at {}: {}", self.addr, source);
                Err(LocalClientError::Connect { addr: self.addr, source })
            }
        }
    }
}
