use crate::election::election_state::ElectionState;
use crate::election::{RandomRanks, RankSource, Role};
use crate::message::Message;
use crate::monitor::{MessageBus, MessageHandler, NodeStateChangeHandler, RemoteNodeState};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Topic the election announces ranks on. Not reserved by the monitor, so it travels like any
/// application message.
pub const ANNOUNCE_TOPIC: &str = "_ANNOUNCE_";

/// Told about this node's role transitions. Runs on a dispatch-pool thread, except for the
/// initial `Primary` which runs on the thread constructing the monitor.
pub trait RoleChangeHandler: Send + Sync {
    fn role_changed(&self, role: Role);
}

impl<F> RoleChangeHandler for F
where
    F: Fn(Role) + Send + Sync,
{
    fn role_changed(&self, role: Role) {
        self(role)
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ElectionError {
    #[error("The node monitor must be running before an election can be layered on it")]
    MonitorNotRunning,
}

/// PrimarySecondaryMonitor elects one primary among the live members of a cluster, on top of a
/// running `MessageBus`. It uses no threads of its own: everything runs on the bus's dispatch
/// pool.
///
/// Every node starts out believing it is primary and announces a random rank. Nodes that are
/// outranked step down; a node whose primary goes missing re-evaluates without it; a node that
/// sees a peer become active re-announces so the newcomer learns its rank.
pub struct PrimarySecondaryMonitor<B: MessageBus> {
    shared: Arc<Shared<B>>,
    state_handler: Arc<dyn NodeStateChangeHandler>,
    announce_handler: Arc<dyn MessageHandler>,
}

struct Shared<B> {
    bus: Weak<B>,
    my_identity: String,
    // Role callbacks are invoked with this held, so they are serialized and never reordered.
    election: Mutex<ElectionState<Box<dyn RankSource>>>,
    // Mirrors `election` so it can be read from inside a role callback.
    view: Mutex<ElectionView>,
    role_change_handler: Arc<dyn RoleChangeHandler>,
    logger: slog::Logger,
}

#[derive(Clone)]
struct ElectionView {
    role: Role,
    primary: String,
    my_rank: i32,
}

impl<B: MessageBus> PrimarySecondaryMonitor<B> {
    pub fn new(bus: Arc<B>, role_change_handler: Arc<dyn RoleChangeHandler>) -> Result<Self, ElectionError> {
        Self::with_rank_source(bus, role_change_handler, Box::new(RandomRanks))
    }

    pub fn with_rank_source(
        bus: Arc<B>,
        role_change_handler: Arc<dyn RoleChangeHandler>,
        rank_source: Box<dyn RankSource>,
    ) -> Result<Self, ElectionError> {
        if !bus.is_running() {
            return Err(ElectionError::MonitorNotRunning);
        }

        let my_identity = bus.my_identity().to_string();
        let election = ElectionState::new(my_identity.clone(), rank_source);
        let logger = bus.logger().new(slog::o!("component" => "election"));
        let shared = Arc::new(Shared {
            bus: Arc::downgrade(&bus),
            view: Mutex::new(ElectionView {
                role: election.role(),
                primary: my_identity.clone(),
                my_rank: election.my_rank(),
            }),
            my_identity,
            election: Mutex::new(election),
            role_change_handler,
            logger,
        });

        // Bootstrap before any handler is registered, so no announce can be evaluated ahead of
        // the initial Primary.
        shared.bootstrap();

        let state_handler: Arc<dyn NodeStateChangeHandler> = {
            let shared = Arc::downgrade(&shared);
            Arc::new(move |node: &str, state: RemoteNodeState, _last_seen_millis: i64| {
                if let Some(shared) = shared.upgrade() {
                    shared.node_state_changed(node, state);
                }
            })
        };
        let announce_handler: Arc<dyn MessageHandler> = {
            let shared = Arc::downgrade(&shared);
            Arc::new(move |message: Message| {
                if let Some(shared) = shared.upgrade() {
                    shared.announce_received(message);
                }
            })
        };

        bus.add_node_state_change_handler(state_handler.clone());
        let monitor = PrimarySecondaryMonitor {
            shared,
            state_handler,
            announce_handler,
        };
        monitor.enable_handler(true);

        let my_rank = monitor.shared.lock_election().my_rank();
        monitor.shared.announce(my_rank);

        Ok(monitor)
    }

    /// Attach or detach the announce handler. While detached, this node neither hears ranks nor
    /// answers them, but still reacts to peers going missing.
    pub fn enable_handler(&self, enable: bool) {
        let bus = match self.shared.bus.upgrade() {
            Some(bus) => bus,
            None => return,
        };
        if enable {
            bus.add_or_replace_message_handler(ANNOUNCE_TOPIC, self.announce_handler.clone());
        } else {
            bus.remove_message_handler(ANNOUNCE_TOPIC);
        }
        slog::info!(self.shared.logger, "Announce handler {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn current_role(&self) -> Role {
        self.shared.lock_view().role
    }

    /// The node this node currently believes is primary.
    pub fn primary(&self) -> String {
        self.shared.lock_view().primary.clone()
    }

    pub fn my_rank(&self) -> i32 {
        self.shared.lock_view().my_rank
    }
}

impl<B: MessageBus> Drop for PrimarySecondaryMonitor<B> {
    fn drop(&mut self) {
        if let Some(bus) = self.shared.bus.upgrade() {
            bus.remove_node_state_change_handler(&self.state_handler);
            bus.remove_message_handler(ANNOUNCE_TOPIC);
        }
    }
}

impl<B: MessageBus> Shared<B> {
    fn lock_election(&self) -> MutexGuard<'_, ElectionState<Box<dyn RankSource>>> {
        self.election.lock().expect("election mutex guard poison")
    }

    fn lock_view(&self) -> MutexGuard<'_, ElectionView> {
        self.view.lock().expect("election view mutex guard poison")
    }

    fn bootstrap(&self) {
        let mut election = self.lock_election();
        let role = election.bootstrap();
        self.role_changed(&election, role);
    }

    fn node_state_changed(&self, node: &str, state: RemoteNodeState) {
        slog::debug!(self.logger, "Peer state changed"; "peer" => node, "state" => %state);
        match state {
            RemoteNodeState::Active => {
                let my_rank = self.lock_election().my_rank();
                self.announce(my_rank);
            }
            RemoteNodeState::Missing => {
                let mut election = self.lock_election();
                if let Some(role) = election.on_peer_missing(node) {
                    self.role_changed(&election, role);
                } else {
                    self.refresh_view(&election);
                }
            }
        }
    }

    fn announce_received(&self, message: Message) {
        if message.sender() == self.my_identity {
            return;
        }
        let rank = match message.frames_iter().next().map(str::parse::<i32>) {
            Some(Ok(rank)) => rank,
            _ => {
                slog::warn!(self.logger, "Dropping malformed announce"; "message" => %message);
                return;
            }
        };
        slog::debug!(self.logger, "Received announce"; "peer" => message.sender(), "peer_rank" => rank);

        let mut election = self.lock_election();
        let outcome = election.on_announce(message.sender(), rank);
        match outcome.role_change {
            Some(role) => self.role_changed(&election, role),
            None => self.refresh_view(&election),
        }
        if outcome.reannounce {
            self.announce(election.my_rank());
        }
    }

    fn role_changed(&self, election: &ElectionState<Box<dyn RankSource>>, role: Role) {
        self.refresh_view(election);
        slog::info!(self.logger, "Role changed to {}", role; "primary" => election.primary());
        self.role_change_handler.role_changed(role);
    }

    fn refresh_view(&self, election: &ElectionState<Box<dyn RankSource>>) {
        let mut view = self.lock_view();
        view.role = election.role();
        view.my_rank = election.my_rank();
        if view.primary != election.primary() {
            view.primary = election.primary().to_string();
        }
    }

    fn announce(&self, rank: i32) {
        let bus = match self.bus.upgrade() {
            Some(bus) => bus,
            None => return,
        };
        let message = match Message::broadcast(ANNOUNCE_TOPIC, self.my_identity.as_str(), vec![rank.to_string()]) {
            Ok(message) => message,
            Err(e) => {
                slog::warn!(self.logger, "Failed to build announce: {}", e);
                return;
            }
        };
        match bus.send_message(message) {
            Ok(()) => slog::debug!(self.logger, "Announced rank {}", rank),
            Err(e) => slog::warn!(self.logger, "Failed to announce rank {}: {}", rank, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::rank::test_utils::ScriptedRanks;
    use crate::monitor::SendError;
    use std::collections::HashMap;

    /// In-memory bus: records what is sent and exposes registered handlers for the test to drive.
    struct FakeBus {
        identity: String,
        running: bool,
        logger: slog::Logger,
        sent: Mutex<Vec<Message>>,
        message_handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
        state_handlers: Mutex<Vec<Arc<dyn NodeStateChangeHandler>>>,
    }

    impl FakeBus {
        fn new(identity: &str) -> Arc<Self> {
            Self::with_running(identity, true)
        }

        fn with_running(identity: &str, running: bool) -> Arc<Self> {
            Arc::new(FakeBus {
                identity: identity.to_string(),
                running,
                logger: slog::Logger::root(slog::Discard, slog::o!()),
                sent: Mutex::new(Vec::new()),
                message_handlers: Mutex::new(HashMap::new()),
                state_handlers: Mutex::new(Vec::new()),
            })
        }

        fn take_sent(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn deliver(&self, message: Message) {
            let handler = self.message_handlers.lock().unwrap().get(message.topic()).cloned();
            if let Some(handler) = handler {
                handler.handle_message(message);
            }
        }

        fn peer_changed(&self, node: &str, state: RemoteNodeState) {
            let handlers = self.state_handlers.lock().unwrap().clone();
            for handler in handlers {
                handler.node_state_changed(node, state, 0);
            }
        }

        fn has_announce_handler(&self) -> bool {
            self.message_handlers.lock().unwrap().contains_key(ANNOUNCE_TOPIC)
        }
    }

    impl MessageBus for FakeBus {
        fn my_identity(&self) -> &str {
            &self.identity
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn logger(&self) -> &slog::Logger {
            &self.logger
        }

        fn send_message(&self, message: Message) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn add_or_replace_message_handler(
            &self,
            topic: &str,
            handler: Arc<dyn MessageHandler>,
        ) -> Option<Arc<dyn MessageHandler>> {
            self.message_handlers.lock().unwrap().insert(topic.to_string(), handler)
        }

        fn remove_message_handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
            self.message_handlers.lock().unwrap().remove(topic)
        }

        fn add_node_state_change_handler(&self, handler: Arc<dyn NodeStateChangeHandler>) -> bool {
            self.state_handlers.lock().unwrap().push(handler);
            true
        }

        fn remove_node_state_change_handler(&self, handler: &Arc<dyn NodeStateChangeHandler>) -> bool {
            let mut handlers = self.state_handlers.lock().unwrap();
            let before = handlers.len();
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            handlers.len() != before
        }
    }

    fn recording_handler() -> (Arc<dyn RoleChangeHandler>, Arc<Mutex<Vec<Role>>>) {
        let roles = Arc::new(Mutex::new(Vec::new()));
        let recorded = roles.clone();
        let handler: Arc<dyn RoleChangeHandler> = Arc::new(move |role: Role| recorded.lock().unwrap().push(role));
        (handler, roles)
    }

    fn election(bus: &Arc<FakeBus>, ranks: Vec<i32>) -> (PrimarySecondaryMonitor<FakeBus>, Arc<Mutex<Vec<Role>>>) {
        let (handler, roles) = recording_handler();
        let monitor =
            PrimarySecondaryMonitor::with_rank_source(bus.clone(), handler, Box::new(ScriptedRanks::new(ranks)))
                .unwrap();
        (monitor, roles)
    }

    fn announce(from: &str, rank: i32) -> Message {
        Message::broadcast(ANNOUNCE_TOPIC, from, vec![rank.to_string()]).unwrap()
    }

    /// Moves every sent message to every other bus until nothing is left in flight.
    fn pump(buses: &[Arc<FakeBus>]) {
        for _ in 0..100 {
            let mut in_flight = Vec::new();
            for (i, bus) in buses.iter().enumerate() {
                for message in bus.take_sent() {
                    in_flight.push((i, message));
                }
            }
            if in_flight.is_empty() {
                return;
            }
            for (from, message) in in_flight {
                for (to, bus) in buses.iter().enumerate() {
                    if to != from {
                        bus.deliver(message.clone());
                    }
                }
            }
        }
        panic!("announces never settled");
    }

    #[test]
    fn refuses_a_stopped_bus() {
        let bus = FakeBus::with_running("a", false);
        let (handler, roles) = recording_handler();

        let result = PrimarySecondaryMonitor::new(bus.clone(), handler);

        assert_eq!(result.err(), Some(ElectionError::MonitorNotRunning));
        assert!(roles.lock().unwrap().is_empty());
        assert!(!bus.has_announce_handler());
    }

    #[test]
    fn construction_bootstraps_primary_and_announces() {
        let bus = FakeBus::new("a");
        let (monitor, roles) = election(&bus, vec![42]);

        assert_eq!(*roles.lock().unwrap(), vec![Role::Primary]);
        assert_eq!(monitor.current_role(), Role::Primary);
        assert_eq!(monitor.primary(), "a");
        assert!(bus.has_announce_handler());

        let sent = bus.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic(), ANNOUNCE_TOPIC);
        assert!(sent[0].is_wildcard());
        assert_eq!(sent[0].frames(), &["42".to_string()]);
    }

    #[test]
    fn three_nodes_elect_the_highest_rank() {
        let buses = vec![FakeBus::new("a"), FakeBus::new("b"), FakeBus::new("c")];
        let (a, a_roles) = election(&buses[0], vec![5]);
        let (b, b_roles) = election(&buses[1], vec![9]);
        let (c, c_roles) = election(&buses[2], vec![2]);

        pump(&buses);

        assert_eq!(*a_roles.lock().unwrap(), vec![Role::Primary, Role::Secondary]);
        assert_eq!(*b_roles.lock().unwrap(), vec![Role::Primary]);
        assert_eq!(*c_roles.lock().unwrap(), vec![Role::Primary, Role::Secondary]);
        for monitor in [&a, &b, &c].iter() {
            assert_eq!(monitor.primary(), "b");
        }
        assert_eq!(b.current_role(), Role::Primary);
    }

    #[test]
    fn missing_primary_hands_over() {
        let buses = vec![FakeBus::new("a"), FakeBus::new("b"), FakeBus::new("c")];
        let (a, a_roles) = election(&buses[0], vec![5]);
        let (_b, _) = election(&buses[1], vec![9]);
        let (c, c_roles) = election(&buses[2], vec![2]);
        pump(&buses);

        buses[0].peer_changed("b", RemoteNodeState::Missing);
        buses[2].peer_changed("b", RemoteNodeState::Missing);

        assert_eq!(
            *a_roles.lock().unwrap(),
            vec![Role::Primary, Role::Secondary, Role::Primary]
        );
        assert_eq!(*c_roles.lock().unwrap(), vec![Role::Primary, Role::Secondary]);
        assert_eq!(a.primary(), "a");
        assert_eq!(c.primary(), "a");
    }

    #[test]
    fn active_peer_triggers_announce() {
        let bus = FakeBus::new("a");
        let (monitor, _) = election(&bus, vec![5]);
        bus.take_sent();

        bus.peer_changed("b", RemoteNodeState::Active);

        let sent = bus.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frames(), &[monitor.my_rank().to_string()]);
    }

    #[test]
    fn colliding_announce_redraws_and_reannounces() {
        let bus = FakeBus::new("a");
        let (monitor, roles) = election(&bus, vec![7, 3]);
        bus.take_sent();

        bus.deliver(announce("b", 7));

        assert_eq!(monitor.my_rank(), 3);
        assert_eq!(*roles.lock().unwrap(), vec![Role::Primary, Role::Secondary]);
        let sent = bus.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frames(), &["3".to_string()]);
    }

    #[test]
    fn malformed_and_own_announces_are_ignored() {
        let bus = FakeBus::new("a");
        let (monitor, roles) = election(&bus, vec![5]);
        bus.take_sent();

        bus.deliver(Message::broadcast(ANNOUNCE_TOPIC, "b", vec!["not-a-rank"]).unwrap());
        bus.deliver(Message::broadcast(ANNOUNCE_TOPIC, "b", Vec::<String>::new()).unwrap());
        bus.deliver(announce("a", 100));

        assert_eq!(monitor.current_role(), Role::Primary);
        assert_eq!(*roles.lock().unwrap(), vec![Role::Primary]);
        assert!(bus.take_sent().is_empty());
    }

    #[test]
    fn role_callback_can_read_the_monitor_state() {
        let bus = FakeBus::new("a");
        let slot: Arc<Mutex<Option<Arc<PrimarySecondaryMonitor<FakeBus>>>>> = Arc::new(Mutex::new(None));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn RoleChangeHandler> = {
            let slot = slot.clone();
            let observed = observed.clone();
            Arc::new(move |role: Role| {
                if let Some(monitor) = slot.lock().unwrap().as_ref() {
                    observed.lock().unwrap().push((role, monitor.current_role(), monitor.primary()));
                }
            })
        };
        let monitor = Arc::new(
            PrimarySecondaryMonitor::with_rank_source(bus.clone(), handler, Box::new(ScriptedRanks::new(vec![5])))
                .unwrap(),
        );
        *slot.lock().unwrap() = Some(monitor.clone());

        bus.deliver(announce("b", 9));

        assert_eq!(
            *observed.lock().unwrap(),
            vec![(Role::Secondary, Role::Secondary, "b".to_string())]
        );
        slot.lock().unwrap().take();
    }

    #[test]
    fn role_callback_can_read_the_redrawn_rank() {
        let bus = FakeBus::new("a");
        let slot: Arc<Mutex<Option<Arc<PrimarySecondaryMonitor<FakeBus>>>>> = Arc::new(Mutex::new(None));
        let ranks_seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn RoleChangeHandler> = {
            let slot = slot.clone();
            let ranks_seen = ranks_seen.clone();
            Arc::new(move |role: Role| {
                if let Some(monitor) = slot.lock().unwrap().as_ref() {
                    ranks_seen.lock().unwrap().push((role, monitor.my_rank()));
                }
            })
        };
        let monitor = Arc::new(
            PrimarySecondaryMonitor::with_rank_source(bus.clone(), handler, Box::new(ScriptedRanks::new(vec![7, 3])))
                .unwrap(),
        );
        *slot.lock().unwrap() = Some(monitor.clone());

        // Delivered off the test thread, so a callback stuck on a lock fails the test instead of hanging it.
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let delivering_bus = bus.clone();
        std::thread::spawn(move || {
            delivering_bus.deliver(announce("b", 7));
            let _ = done_tx.send(());
        });

        assert!(
            done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok(),
            "role callback blocked reading the rank"
        );
        assert_eq!(*ranks_seen.lock().unwrap(), vec![(Role::Secondary, 3)]);
        slot.lock().unwrap().take();
    }

    #[test]
    fn disabled_handler_stops_listening() {
        let bus = FakeBus::new("a");
        let (monitor, roles) = election(&bus, vec![5]);

        monitor.enable_handler(false);
        assert!(!bus.has_announce_handler());
        bus.deliver(announce("b", 9));
        assert_eq!(monitor.current_role(), Role::Primary);

        monitor.enable_handler(true);
        bus.deliver(announce("b", 9));
        assert_eq!(monitor.current_role(), Role::Secondary);
        assert_eq!(*roles.lock().unwrap(), vec![Role::Primary, Role::Secondary]);
    }

    #[test]
    fn drop_unregisters_handlers() {
        let bus = FakeBus::new("a");
        let (monitor, _) = election(&bus, vec![5]);
        assert_eq!(bus.state_handlers.lock().unwrap().len(), 1);

        drop(monitor);

        assert!(!bus.has_announce_handler());
        assert!(bus.state_handlers.lock().unwrap().is_empty());
    }
}
