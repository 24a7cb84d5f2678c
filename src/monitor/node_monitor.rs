use crate::message::{is_reserved_topic, Message};
use crate::monitor::config::{validate_port, ClusterView, MonitorOptionsValidated};
use crate::monitor::dispatch::DispatchPool;
use crate::monitor::handlers::HandlerRegistry;
use crate::monitor::ingress::{self, IngressSource};
use crate::monitor::lifecycle::{Lifecycle, LifecycleCell};
use crate::monitor::publisher::{self, PublisherFactory, PublisherSpec};
use crate::monitor::reactor::{Reactor, ReactorState};
use crate::monitor::relay::{RelayCommand, RelaySlot};
use crate::monitor::{
    MessageBus, MessageHandler, NodeMonitorConfig, NodeMonitorCreationError, NodeStateChangeHandler,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create I/O runtime")]
    Runtime(#[source] io::Error),
    #[error("Failed to spawn thread")]
    Spawn(#[source] io::Error),
    #[error("Reactor exited before it was ready")]
    ReactorExited,
    #[error("Previous reactor is still stopping")]
    StillStopping,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum SendError {
    #[error("Node monitor is not running")]
    NotRunning,
    #[error("Topic '{0}' is reserved")]
    ReservedTopic(String),
}

/// NodeMonitor is one node of the cluster. It heartbeats to every peer, tracks which peers are
/// alive, and routes targeted messages between nodes.
///
/// All network I/O is owned by a single reactor thread. Handlers run on a separate dispatch
/// pool. Every method here may be called from any thread.
pub struct NodeMonitor {
    cluster: ClusterView,
    port: u16,
    options: MonitorOptionsValidated,
    logger: slog::Logger,
    registry: Arc<HandlerRegistry>,
    relay: RelaySlot,
    lifecycle: Arc<LifecycleCell>,
    control: Mutex<Option<ReactorHandle>>,
    exit_signal: Mutex<Option<Receiver<()>>>,
    publisher_factory: PublisherFactory,
}

struct ReactorHandle {
    // None when the reactor runs on the thread that called `start(true)`.
    thread: Option<JoinHandle<()>>,
    reactor_thread: ThreadId,
    dispatch_threads: Vec<ThreadId>,
    interrupt: Arc<AtomicBool>,
    exited: Receiver<()>,
}

impl NodeMonitor {
    pub fn new(config: NodeMonitorConfig) -> Result<Self, NodeMonitorCreationError> {
        Self::with_publisher_factory(config, publisher::tcp_publisher_factory())
    }

    pub(crate) fn with_publisher_factory(
        config: NodeMonitorConfig,
        publisher_factory: PublisherFactory,
    ) -> Result<Self, NodeMonitorCreationError> {
        let cluster = ClusterView::new(config.my_identity, config.cluster_members)?;
        validate_port(config.port)?;
        let options =
            MonitorOptionsValidated::try_from(config.options).map_err(NodeMonitorCreationError::IllegalOptions)?;

        let registry = Arc::new(HandlerRegistry::new());
        if let Some(handler) = config.node_state_change_handler {
            registry.add_node_state_change_handler(handler);
        }
        for (topic, handler) in config.message_handlers.into_iter() {
            if is_reserved_topic(&topic) {
                return Err(NodeMonitorCreationError::ReservedTopic(topic));
            }
            registry.add_or_replace_message_handler(&topic, handler);
        }

        let logger = config
            .logger
            .new(slog::o!("node" => cluster.my_identity().to_string()));

        Ok(NodeMonitor {
            cluster,
            port: config.port,
            options,
            logger,
            registry,
            relay: RelaySlot::new(),
            lifecycle: Arc::new(LifecycleCell::new()),
            control: Mutex::new(None),
            exit_signal: Mutex::new(None),
            publisher_factory,
        })
    }

    /// Start the reactor. With `blocking` the calling thread becomes the reactor thread and this
    /// returns once the monitor is stopped; it must not be called from within an async runtime.
    /// Otherwise the reactor gets its own thread and this returns once it is serving.
    ///
    /// Starting a running monitor is a no-op. Failing to bind either listener is an error.
    pub fn start(&self, blocking: bool) -> Result<(), StartError> {
        let mut control = self.lock_control();
        match self.lifecycle.get() {
            Lifecycle::Starting | Lifecycle::Running => {
                slog::debug!(self.logger, "Start requested while already running");
                return Ok(());
            }
            Lifecycle::Stopping => return Err(StartError::StillStopping),
            Lifecycle::Stopped => {}
        }

        self.lifecycle.set(Lifecycle::Starting);
        let mut launch = match self.prepare_launch() {
            Ok(launch) => launch,
            Err(e) => {
                self.lifecycle.set(Lifecycle::Stopped);
                return Err(e);
            }
        };
        let interrupt = launch.interrupt.clone();
        let dispatch_threads = launch.pool.thread_ids();
        let (exit_guard, exited) = crossbeam_channel::bounded::<()>(0);
        launch.exit_guard = Some(exit_guard);
        *self.lock_exit_signal() = Some(exited.clone());

        if blocking {
            *control = Some(ReactorHandle {
                thread: None,
                reactor_thread: thread::current().id(),
                dispatch_threads,
                interrupt,
                exited,
            });
            drop(control);

            slog::info!(self.logger, "Starting reactor on the calling thread");
            launch.run();
            return Ok(());
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        launch.ready = Some(ready_tx);
        let spawned = thread::Builder::new()
            .name(format!("{}-reactor", self.cluster.my_identity()))
            .spawn(move || launch.run());
        let reactor_thread = match spawned {
            Ok(reactor_thread) => reactor_thread,
            Err(e) => {
                self.relay.close();
                self.lifecycle.set(Lifecycle::Stopped);
                return Err(StartError::Spawn(e));
            }
        };

        if ready_rx.recv().is_err() {
            let _ = reactor_thread.join();
            return Err(StartError::ReactorExited);
        }

        *control = Some(ReactorHandle {
            reactor_thread: reactor_thread.thread().id(),
            thread: Some(reactor_thread),
            dispatch_threads,
            interrupt,
            exited,
        });

        Ok(())
    }

    fn prepare_launch(&self) -> Result<Launch, StartError> {
        let cluster_addr = SocketAddr::new(self.options.bind_ip, self.port);
        let local_addr = SocketAddr::new(self.options.local_ip, self.port + 1);
        let cluster_listener = ingress::bind(cluster_addr).map_err(|source| StartError::Bind {
            addr: cluster_addr,
            source,
        })?;
        let local_listener = ingress::bind(local_addr).map_err(|source| StartError::Bind {
            addr: local_addr,
            source,
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.options.io_threads)
            .thread_name(format!("{}-io", self.cluster.my_identity()))
            .enable_all()
            .build()
            .map_err(StartError::Runtime)?;

        let pool = match DispatchPool::start(
            self.options.dispatch_threads,
            self.cluster.my_identity(),
            self.registry.clone(),
            self.logger.clone(),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                runtime.shutdown_background();
                return Err(StartError::Spawn(e));
            }
        };

        let relay = self.relay.open();

        Ok(Launch {
            cluster: self.cluster.clone(),
            port: self.port,
            options: self.options.clone(),
            cluster_listener,
            local_listener,
            runtime,
            pool,
            relay,
            relay_slot: self.relay.clone(),
            registry: self.registry.clone(),
            lifecycle: self.lifecycle.clone(),
            interrupt: Arc::new(AtomicBool::new(false)),
            publisher_factory: self.publisher_factory.clone(),
            logger: self.logger.new(slog::o!("component" => "reactor")),
            ready: None,
            exit_guard: None,
        })
    }

    /// Stop the reactor and wait (bounded) for it to exit. Never fails; a second call is a no-op.
    ///
    /// Called from a handler, this only requests the stop, since the dispatch pool is torn down as
    /// part of stopping.
    pub fn stop(&self) {
        let handle = match self.lock_control().take() {
            Some(handle) => handle,
            None => {
                slog::debug!(self.logger, "Stop requested while not running");
                return;
            }
        };
        if !self.lifecycle.transition(Lifecycle::Running, Lifecycle::Stopping) {
            self.lifecycle.transition(Lifecycle::Starting, Lifecycle::Stopping);
        }
        slog::info!(self.logger, "Stopping");

        let current = thread::current().id();
        if current == handle.reactor_thread {
            handle.interrupt.store(true, Ordering::Release);
            return;
        }

        if self.relay.send(RelayCommand::Stop).is_err() {
            slog::debug!(self.logger, "Reactor is already exiting");
        }
        if handle.dispatch_threads.contains(&current) {
            slog::debug!(self.logger, "Stop requested from a handler, not waiting for exit");
            return;
        }

        if let Err(RecvTimeoutError::Timeout) = handle.exited.recv_timeout(STOP_TIMEOUT) {
            slog::warn!(self.logger, "Reactor did not stop within {:?}", STOP_TIMEOUT);
            return;
        }
        if let Some(reactor_thread) = handle.thread {
            if reactor_thread.join().is_err() {
                slog::warn!(self.logger, "Reactor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.get() == Lifecycle::Running
    }

    /// Block until the current reactor has fully stopped. Returns at once if it never started.
    pub fn wait_for_exit(&self) {
        let exited = self.lock_exit_signal().clone();
        if let Some(exited) = exited {
            // Nothing is ever sent; this returns when the reactor drops its end.
            let _ = exited.recv();
        }
    }

    pub fn my_identity(&self) -> &str {
        self.cluster.my_identity()
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    /// Send `message` to its targets. The wildcard target is expanded here to every peer plus
    /// this node. A copy is not delivered back to this node.
    ///
    /// The message is handed to the reactor thread, which alone writes to the network.
    pub fn send_message(&self, message: Message) -> Result<(), SendError> {
        if is_reserved_topic(message.topic()) {
            return Err(SendError::ReservedTopic(message.topic().to_string()));
        }

        let message = self.cluster.resolve_targets(message);
        self.relay
            .send(RelayCommand::Publish(message.to_wire_frames()))
            .map_err(|_| SendError::NotRunning)
    }

    /// Register `handler` for `topic` unless one is already registered. Returns whether it was
    /// registered.
    pub fn add_message_handler(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> bool {
        if is_reserved_topic(topic) {
            slog::warn!(self.logger, "Refusing handler for reserved topic"; "topic" => topic);
            return false;
        }
        self.registry.add_message_handler(topic, handler)
    }

    /// Register `handler` for `topic`, returning the handler it replaced.
    pub fn add_or_replace_message_handler(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        if is_reserved_topic(topic) {
            slog::warn!(self.logger, "Refusing handler for reserved topic"; "topic" => topic);
            return None;
        }
        self.registry.add_or_replace_message_handler(topic, handler)
    }

    pub fn remove_message_handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        self.registry.remove_message_handler(topic)
    }

    pub fn add_node_state_change_handler(&self, handler: Arc<dyn NodeStateChangeHandler>) -> bool {
        self.registry.add_node_state_change_handler(handler)
    }

    pub fn remove_node_state_change_handler(&self, handler: &Arc<dyn NodeStateChangeHandler>) -> bool {
        self.registry.remove_node_state_change_handler(handler)
    }

    fn lock_control(&self) -> MutexGuard<'_, Option<ReactorHandle>> {
        self.control.lock().expect("NodeMonitor control mutex guard poison")
    }

    fn lock_exit_signal(&self) -> MutexGuard<'_, Option<Receiver<()>>> {
        self.exit_signal
            .lock()
            .expect("NodeMonitor exit signal mutex guard poison")
    }
}

impl Drop for NodeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MessageBus for NodeMonitor {
    fn my_identity(&self) -> &str {
        NodeMonitor::my_identity(self)
    }

    fn is_running(&self) -> bool {
        NodeMonitor::is_running(self)
    }

    fn logger(&self) -> &slog::Logger {
        NodeMonitor::logger(self)
    }

    fn send_message(&self, message: Message) -> Result<(), SendError> {
        NodeMonitor::send_message(self, message)
    }

    fn add_or_replace_message_handler(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        NodeMonitor::add_or_replace_message_handler(self, topic, handler)
    }

    fn remove_message_handler(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        NodeMonitor::remove_message_handler(self, topic)
    }

    fn add_node_state_change_handler(&self, handler: Arc<dyn NodeStateChangeHandler>) -> bool {
        NodeMonitor::add_node_state_change_handler(self, handler)
    }

    fn remove_node_state_change_handler(&self, handler: &Arc<dyn NodeStateChangeHandler>) -> bool {
        NodeMonitor::remove_node_state_change_handler(self, handler)
    }
}

/// Everything one reactor generation needs, moved onto the reactor thread.
struct Launch {
    cluster: ClusterView,
    port: u16,
    options: MonitorOptionsValidated,
    cluster_listener: TcpListener,
    local_listener: TcpListener,
    runtime: Runtime,
    pool: DispatchPool,
    relay: mpsc::UnboundedReceiver<RelayCommand>,
    relay_slot: RelaySlot,
    registry: Arc<HandlerRegistry>,
    lifecycle: Arc<LifecycleCell>,
    interrupt: Arc<AtomicBool>,
    publisher_factory: PublisherFactory,
    logger: slog::Logger,
    ready: Option<Sender<()>>,
    // Dropped last, which wakes everyone waiting for exit.
    exit_guard: Option<Sender<()>>,
}

impl Launch {
    fn run(self) {
        let Launch {
            cluster,
            port,
            options,
            cluster_listener,
            local_listener,
            runtime,
            pool,
            relay,
            relay_slot,
            registry,
            lifecycle,
            interrupt,
            publisher_factory,
            logger,
            ready,
            exit_guard,
        } = self;

        let served = runtime.block_on(async {
            let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
            ingress::spawn_listener(
                cluster_listener,
                IngressSource::Cluster,
                ingress_tx.clone(),
                logger.clone(),
            )?;
            ingress::spawn_listener(local_listener, IngressSource::Local, ingress_tx, logger.clone())?;

            let publisher = publisher_factory(PublisherSpec {
                peers: cluster.peers().cloned().collect(),
                port,
                retry_period: options.heartbeat_period,
                logger: logger.clone(),
            });
            let mut state = ReactorState::new(
                cluster,
                options.expiry_window,
                publisher,
                pool.dispatcher(),
                registry,
                logger.clone(),
            );
            state.report_startup_snapshot();

            let reactor = Reactor::new(state, relay, ingress_rx, interrupt, options.heartbeat_period);
            lifecycle.transition(Lifecycle::Starting, Lifecycle::Running);
            if let Some(ready) = ready {
                let _ = ready.send(());
            }
            slog::info!(logger, "Running"; "port" => port);

            let mut state = reactor.run().await;
            state.shut_down();
            Ok::<(), io::Error>(())
        });
        if let Err(e) = served {
            slog::error!(logger, "Reactor failed: {}", e);
        }

        relay_slot.close();
        pool.close();
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        lifecycle.set(Lifecycle::Stopped);
        slog::info!(logger, "Stopped");
        drop(exit_guard);
    }
}
