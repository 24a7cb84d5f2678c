use crate::message::encode_parts;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

/// High-water mark of one link, applied both to its inbound queue and to the frames it holds
/// while disconnected. Newer frames are dropped once either is full.
const BACKLOG_LIMIT: usize = 1000;

/// The outbound side of the cluster transport. Only the reactor thread holds one.
pub(crate) trait Publish: Send {
    fn publish(&mut self, wire_frames: &[String]);

    fn close(&mut self) {}
}

pub(crate) struct PublisherSpec {
    pub(crate) peers: Vec<String>,
    pub(crate) port: u16,
    pub(crate) retry_period: Duration,
    pub(crate) logger: slog::Logger,
}

/// Builds the publisher on the reactor thread, inside the I/O runtime.
pub(crate) type PublisherFactory = Arc<dyn Fn(PublisherSpec) -> Box<dyn Publish> + Send + Sync>;

pub(crate) fn tcp_publisher_factory() -> PublisherFactory {
    Arc::new(|spec: PublisherSpec| -> Box<dyn Publish> { Box::new(TcpPublisher::start(spec)) })
}

/// TcpPublisher fans each message out to one writer task per peer. A frame is encoded once and
/// shared between the links.
///
/// Delivery is best effort: while a link is down or stalled its frames queue up to
/// `BACKLOG_LIMIT` and are flushed in order once it drains; past that they are dropped. A link
/// tries to reconnect at most once per retry period.
pub(crate) struct TcpPublisher {
    links: Vec<PeerLink>,
    logger: slog::Logger,
}

struct PeerLink {
    peer: String,
    sender: mpsc::Sender<Bytes>,
}

impl TcpPublisher {
    fn start(spec: PublisherSpec) -> Self {
        let PublisherSpec {
            peers,
            port,
            retry_period,
            logger,
        } = spec;
        let logger = logger.new(slog::o!("component" => "publisher"));
        let links = peers
            .into_iter()
            .map(|peer| {
                let (sender, receiver) = mpsc::channel(BACKLOG_LIMIT);
                let writer = LinkWriter {
                    address: (peer.clone(), port),
                    retry_period,
                    frames: receiver,
                    backlog: VecDeque::new(),
                    stream: None,
                    next_connect_attempt: Instant::now(),
                    logger: logger.new(slog::o!("peer" => peer.clone())),
                };
                tokio::spawn(writer.run());

                PeerLink { peer, sender }
            })
            .collect();

        TcpPublisher { links, logger }
    }
}

impl Publish for TcpPublisher {
    fn publish(&mut self, wire_frames: &[String]) {
        let mut encoded = BytesMut::new();
        if let Err(e) = encode_parts(wire_frames, &mut encoded) {
            slog::warn!(self.logger, "Failed to encode outbound message: {}", e);
            return;
        }
        let encoded = encoded.freeze();

        for link in self.links.iter() {
            match link.sender.try_send(encoded.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    slog::trace!(self.logger, "Link queue full, dropping frame"; "peer" => &link.peer);
                }
                Err(TrySendError::Closed(_)) => {
                    slog::warn!(self.logger, "Link writer has exited"; "peer" => &link.peer);
                }
            }
        }
    }

    fn close(&mut self) {
        // Writer tasks exit once their queue closes.
        self.links.clear();
    }
}

struct LinkWriter {
    address: (String, u16),
    retry_period: Duration,
    frames: mpsc::Receiver<Bytes>,
    backlog: VecDeque<Bytes>,
    stream: Option<TcpStream>,
    next_connect_attempt: Instant,
    logger: slog::Logger,
}

impl LinkWriter {
    async fn run(mut self) {
        while let Some(frame) = self.frames.recv().await {
            self.enqueue(frame);
            if self.stream.is_none() {
                self.try_connect().await;
            }
            self.flush().await;
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        slog::debug!(self.logger, "Link writer exiting");
    }

    fn enqueue(&mut self, frame: Bytes) {
        if self.backlog.len() >= BACKLOG_LIMIT {
            slog::trace!(self.logger, "Backlog full, dropping frame");
            return;
        }
        self.backlog.push_back(frame);
    }

    async fn flush(&mut self) {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return,
        };
        while let Some(frame) = self.backlog.pop_front() {
            if let Err(e) = stream.write_all(&frame).await {
                slog::warn!(self.logger, "Send failed, dropping link: {}", e);
                self.stream = None;
                self.next_connect_attempt = Instant::now() + self.retry_period;
                return;
            }
        }
    }

    async fn try_connect(&mut self) {
        let now = Instant::now();
        if now < self.next_connect_attempt {
            return;
        }
        self.next_connect_attempt = now + self.retry_period;

        let (host, port) = &self.address;
        let connect = TcpStream::connect((host.as_str(), *port));
        match tokio::time::timeout(self.retry_period, connect).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                slog::info!(self.logger, "Connected to peer");
                self.stream = Some(stream);
            }
            Ok(Err(e)) => {
                slog::trace!(self.logger, "Peer not reachable: {}", e);
            }
            Err(_) => {
                slog::trace!(self.logger, "Peer connect timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FrameCodec;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn publishes_to_every_peer() {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // Cluster members share one port on different addresses.
        let port = listener_a.local_addr().unwrap().port();
        let listener_b = TcpListener::bind(("127.0.0.2", port)).await.unwrap();

        let mut publisher = TcpPublisher::start(PublisherSpec {
            peers: vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()],
            port,
            retry_period: Duration::from_millis(100),
            logger: logger(),
        });
        publisher.publish(&["ALIVE".to_string(), "node-a".to_string()]);

        for listener in vec![listener_a, listener_b].into_iter() {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = FramedRead::new(stream, FrameCodec);
            let received = frames.next().await.unwrap().unwrap();
            assert_eq!(received, vec!["ALIVE", "node-a"]);
        }
    }

    #[tokio::test]
    async fn queues_frames_while_peer_is_down_then_flushes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let retry_period = Duration::from_millis(100);
        let mut publisher = TcpPublisher::start(PublisherSpec {
            peers: vec!["127.0.0.1".to_string()],
            port,
            retry_period,
            logger: logger(),
        });
        publisher.publish(&["early".to_string()]);
        tokio::time::sleep(retry_period).await;

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (first_tx, mut first_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = FramedRead::new(stream, FrameCodec);
            let _ = first_tx.send(frames.next().await.unwrap().unwrap());
        });

        // Keep publishing, as heartbeats do, until the link is back.
        let deadline = Instant::now() + Duration::from_secs(5);
        let first = loop {
            assert!(Instant::now() < deadline, "link never reconnected");
            publisher.publish(&["kept".to_string()]);
            tokio::time::sleep(retry_period / 2).await;
            if let Ok(first) = first_rx.try_recv() {
                break first;
            }
        };

        assert_eq!(first, vec!["early"]);
    }

    #[test]
    fn backlog_is_bounded() {
        let (_sender, frames) = mpsc::channel(BACKLOG_LIMIT);
        let mut writer = LinkWriter {
            address: ("127.0.0.1".to_string(), 46900),
            retry_period: Duration::from_millis(100),
            frames,
            backlog: VecDeque::new(),
            stream: None,
            next_connect_attempt: Instant::now(),
            logger: logger(),
        };

        for i in 0..BACKLOG_LIMIT + 10 {
            writer.enqueue(Bytes::from(i.to_string()));
        }

        assert_eq!(writer.backlog.len(), BACKLOG_LIMIT);
        assert_eq!(writer.backlog.front(), Some(&Bytes::from("0")));
        assert_eq!(writer.backlog.back(), Some(&Bytes::from((BACKLOG_LIMIT - 1).to_string())));
    }

    #[test]
    fn stalled_link_queue_drops_past_the_high_water_mark() {
        // No writer drains this queue, as when a peer accepts but never reads.
        let (sender, mut receiver) = mpsc::channel(BACKLOG_LIMIT);
        let mut publisher = TcpPublisher {
            links: vec![PeerLink {
                peer: "127.0.0.1".to_string(),
                sender,
            }],
            logger: logger(),
        };

        for i in 0..BACKLOG_LIMIT * 3 {
            publisher.publish(&["greeting".to_string(), i.to_string()]);
        }

        let mut queued = 0;
        while receiver.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, BACKLOG_LIMIT);
    }
}
