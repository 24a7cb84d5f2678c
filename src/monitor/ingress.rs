use crate::message::FrameCodec;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum IngressSource {
    /// Heartbeats and messages published by peers.
    Cluster,
    /// Messages pushed by same-host clients.
    Local,
}

#[derive(Debug)]
pub(crate) struct Ingress {
    pub(crate) source: IngressSource,
    pub(crate) wire_frames: Vec<String>,
}

/// Bind a listener the blocking way, so bind failures surface to the caller of `start()`.
pub(crate) fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;

    Ok(listener)
}

/// Accept connections on `listener` and forward every decoded message to the reactor. Must be
/// called from within the I/O runtime.
pub(crate) fn spawn_listener(
    listener: std::net::TcpListener,
    source: IngressSource,
    ingress: mpsc::UnboundedSender<Ingress>,
    logger: slog::Logger,
) -> io::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    tokio::spawn(accept_loop(listener, source, ingress, logger));

    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    source: IngressSource,
    ingress: mpsc::UnboundedSender<Ingress>,
    logger: slog::Logger,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = ingress.closed() => break,
        };

        match accepted {
            Ok((stream, remote)) => {
                let logger = logger.new(slog::o!("remote" => remote.to_string()));
                slog::debug!(logger, "Accepted {:?} connection", source);
                tokio::spawn(read_connection(stream, source, ingress.clone(), logger));
            }
            Err(e) => {
                slog::warn!(logger, "Failed to accept {:?} connection: {}", source, e);
            }
        }
    }
}

async fn read_connection(
    stream: TcpStream,
    source: IngressSource,
    ingress: mpsc::UnboundedSender<Ingress>,
    logger: slog::Logger,
) {
    let mut frames = FramedRead::new(stream, FrameCodec);
    while let Some(next) = frames.next().await {
        match next {
            Ok(wire_frames) => {
                if ingress.send(Ingress { source, wire_frames }).is_err() {
                    return;
                }
            }
            Err(e) => {
                slog::warn!(logger, "Dropping connection after bad input: {}", e);
                return;
            }
        }
    }
    slog::debug!(logger, "Connection closed by remote");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio_util::codec::FramedWrite;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn forwards_decoded_messages_with_source() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, IngressSource::Local, tx, logger()).unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut sink = FramedWrite::new(stream, FrameCodec);
        sink.send(vec!["topic", "node-b", "node-a", "payload"]).await.unwrap();

        let ingress = rx.recv().await.unwrap();
        assert_eq!(ingress.source, IngressSource::Local);
        assert_eq!(ingress.wire_frames, vec!["topic", "node-b", "node-a", "payload"]);
    }

    #[tokio::test]
    async fn bad_input_closes_only_that_connection() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_listener(listener, IngressSource::Cluster, tx, logger()).unwrap();

        let mut bad = TcpStream::connect(addr).await.unwrap();
        // One part, two bytes, not UTF-8.
        tokio::io::AsyncWriteExt::write_all(&mut bad, &[0, 0, 0, 1, 0, 0, 0, 2, 0xC3, 0x28])
            .await
            .unwrap();

        let good = TcpStream::connect(addr).await.unwrap();
        let mut sink = FramedWrite::new(good, FrameCodec);
        sink.send(vec!["ALIVE", "node-b"]).await.unwrap();

        let ingress = rx.recv().await.unwrap();
        assert_eq!(ingress.source, IngressSource::Cluster);
        assert_eq!(ingress.wire_frames, vec!["ALIVE", "node-b"]);
    }

    #[test]
    fn bind_reports_address_in_use() {
        let first = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        assert_eq!(bind(addr).unwrap_err().kind(), io::ErrorKind::AddrInUse);
    }
}
