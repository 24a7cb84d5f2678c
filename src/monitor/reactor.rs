use crate::message::{is_reserved_topic, Message, ALIVE_TOPIC};
use crate::monitor::config::ClusterView;
use crate::monitor::dispatch::{Dispatcher, Work};
use crate::monitor::handlers::HandlerRegistry;
use crate::monitor::ingress::{Ingress, IngressSource};
use crate::monitor::liveness::{LivenessTable, UnknownPeer};
use crate::monitor::publisher::Publish;
use crate::monitor::relay::RelayCommand;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Everything the reactor loop mutates. It lives on the reactor thread only, so none of it is
/// locked; the handler registry is the one shared piece and carries its own locks.
pub(crate) struct ReactorState {
    cluster: ClusterView,
    liveness: LivenessTable,
    publisher: Box<dyn Publish>,
    dispatcher: Dispatcher,
    registry: Arc<HandlerRegistry>,
    logger: slog::Logger,
}

impl ReactorState {
    pub(crate) fn new(
        cluster: ClusterView,
        expiry_window: Duration,
        publisher: Box<dyn Publish>,
        dispatcher: Dispatcher,
        registry: Arc<HandlerRegistry>,
        logger: slog::Logger,
    ) -> Self {
        let liveness = LivenessTable::new(cluster.peers().cloned(), expiry_window);

        ReactorState {
            cluster,
            liveness,
            publisher,
            dispatcher,
            registry,
            logger,
        }
    }

    /// Tell state-change handlers where every peer stands before any traffic is handled.
    pub(crate) fn report_startup_snapshot(&mut self) {
        for change in self.liveness.snapshot().into_iter() {
            self.dispatcher.submit(Work::NodeStateChanged(change));
        }
    }

    pub(crate) fn send_heartbeat(&mut self) {
        let heartbeat = [ALIVE_TOPIC.to_string(), self.cluster.my_identity().to_string()];
        self.publisher.publish(&heartbeat);
    }

    pub(crate) fn check_expiry(&mut self, now_millis: i64) {
        for change in self.liveness.tick(now_millis).into_iter() {
            slog::info!(self.logger, "Peer is missing"; "peer" => &change.node);
            self.dispatcher.submit(Work::NodeStateChanged(change));
        }
    }

    pub(crate) fn publish(&mut self, wire_frames: &[String]) {
        slog::debug!(self.logger, "Relaying message to cluster"; "topic" => wire_frames.first());
        self.publisher.publish(wire_frames);
    }

    pub(crate) fn handle_ingress(&mut self, ingress: Ingress, now_millis: i64) {
        match ingress.source {
            IngressSource::Cluster => self.handle_cluster_frames(ingress.wire_frames, now_millis),
            IngressSource::Local => self.handle_local_frames(ingress.wire_frames),
        }
    }

    fn handle_cluster_frames(&mut self, wire_frames: Vec<String>, now_millis: i64) {
        if wire_frames.first().map(String::as_str) == Some(ALIVE_TOPIC) {
            match wire_frames.get(1) {
                Some(sender) => self.record_heartbeat(sender, now_millis),
                None => slog::warn!(self.logger, "Heartbeat without a sender"),
            }
            return;
        }

        let message = match Message::from_wire_frames(wire_frames) {
            Ok(message) => message,
            Err(e) => {
                slog::warn!(self.logger, "Dropping malformed cluster message: {}", e);
                return;
            }
        };

        if is_reserved_topic(message.topic()) {
            slog::warn!(self.logger, "Dropping cluster message on reserved topic"; "message" => %message);
            return;
        }
        if !self.liveness.contains(message.sender()) {
            slog::warn!(self.logger, "Dropping message from unknown sender"; "sender" => message.sender());
            return;
        }

        self.deliver_if_targeted(message);
    }

    fn record_heartbeat(&mut self, sender: &str, now_millis: i64) {
        match self.liveness.record_heartbeat(sender, now_millis) {
            Ok(Some(change)) => {
                slog::info!(self.logger, "Peer is active"; "peer" => sender);
                self.dispatcher.submit(Work::NodeStateChanged(change));
            }
            Ok(None) => slog::trace!(self.logger, "Heartbeat"; "peer" => sender),
            Err(UnknownPeer(peer)) => slog::warn!(self.logger, "Heartbeat from unknown node"; "peer" => peer),
        }
    }

    /// A same-host client message is handled here if it targets this node, then sent on to the
    /// cluster.
    fn handle_local_frames(&mut self, wire_frames: Vec<String>) {
        let message = match Message::from_wire_frames(wire_frames) {
            Ok(message) => self.cluster.resolve_targets(message),
            Err(e) => {
                slog::warn!(self.logger, "Dropping malformed local message: {}", e);
                return;
            }
        };

        if is_reserved_topic(message.topic()) {
            slog::warn!(self.logger, "Dropping local message on reserved topic"; "message" => %message);
            return;
        }
        if !self.cluster.is_member(message.sender()) {
            slog::warn!(self.logger, "Dropping local message from unknown sender"; "sender" => message.sender());
            return;
        }

        let wire_frames = message.to_wire_frames();
        self.deliver_if_targeted(message);
        self.publisher.publish(&wire_frames);
    }

    fn deliver_if_targeted(&mut self, message: Message) {
        if !message.targets_contains(self.cluster.my_identity()) {
            slog::trace!(self.logger, "Message not for me"; "topic" => message.topic());
            return;
        }
        if !self.registry.has_message_handler(message.topic()) {
            slog::debug!(self.logger, "No handler registered, dropping message"; "topic" => message.topic());
            return;
        }

        self.dispatcher.submit(Work::MessageReceived(message));
    }

    pub(crate) fn shut_down(&mut self) {
        self.publisher.close();
    }
}

/// The reactor's event loop. It multiplexes relay commands, inbound traffic and two timers, and
/// returns once told to stop.
pub(crate) struct Reactor {
    state: ReactorState,
    relay: mpsc::UnboundedReceiver<RelayCommand>,
    ingress: mpsc::UnboundedReceiver<Ingress>,
    interrupt: Arc<AtomicBool>,
    heartbeat_period: Duration,
}

impl Reactor {
    pub(crate) fn new(
        state: ReactorState,
        relay: mpsc::UnboundedReceiver<RelayCommand>,
        ingress: mpsc::UnboundedReceiver<Ingress>,
        interrupt: Arc<AtomicBool>,
        heartbeat_period: Duration,
    ) -> Self {
        Reactor {
            state,
            relay,
            ingress,
            interrupt,
            heartbeat_period,
        }
    }

    pub(crate) async fn run(mut self) -> ReactorState {
        let mut heartbeat = tokio::time::interval(self.heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Expiry is checked twice per heartbeat period.
        let mut expiry_check = tokio::time::interval((self.heartbeat_period / 2).max(Duration::from_millis(1)));
        expiry_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.interrupt.load(Ordering::Acquire) {
                slog::debug!(self.state.logger, "Reactor interrupted");
                break;
            }

            tokio::select! {
                command = self.relay.recv() => match command {
                    Some(RelayCommand::Publish(wire_frames)) => self.state.publish(&wire_frames),
                    Some(RelayCommand::Stop) => {
                        slog::debug!(self.state.logger, "Stop requested");
                        break;
                    }
                    None => break,
                },
                Some(ingress) = self.ingress.recv() => self.state.handle_ingress(ingress, now_millis()),
                _ = heartbeat.tick() => self.state.send_heartbeat(),
                _ = expiry_check.tick() => self.state.check_expiry(now_millis()),
            }
        }

        self.state
    }
}
