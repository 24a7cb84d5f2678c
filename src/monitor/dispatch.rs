use crate::message::Message;
use crate::monitor::handlers::HandlerRegistry;
use crate::monitor::NodeStateChange;
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// A unit of work for the dispatch pool. The handler is looked up when the work runs, so a
/// handler removed in the meantime is simply not called.
#[derive(Debug)]
pub(crate) enum Work {
    NodeStateChanged(NodeStateChange),
    MessageReceived(Message),
}

/// Cloneable producer side of the dispatch queue, held by the reactor.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    sender: Sender<Work>,
}

impl Dispatcher {
    #[cfg(test)]
    pub(crate) fn from_sender(sender: Sender<Work>) -> Self {
        Dispatcher { sender }
    }

    /// Never blocks. Returns false if the pool has shut down.
    pub(crate) fn submit(&self, work: Work) -> bool {
        self.sender.send(work).is_ok()
    }
}

/// DispatchPool runs user handlers on a fixed set of worker threads so the reactor never waits
/// on application code. Work is taken from the queue in the order it was submitted.
pub(crate) struct DispatchPool {
    dispatcher: Dispatcher,
    workers: Vec<JoinHandle<()>>,
    logger: slog::Logger,
}

impl DispatchPool {
    pub(crate) fn start(
        num_threads: usize,
        name_prefix: &str,
        registry: Arc<HandlerRegistry>,
        logger: slog::Logger,
    ) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let logger = logger.new(slog::o!("component" => "dispatch"));

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let worker = Worker {
                queue: receiver.clone(),
                registry: registry.clone(),
                logger: logger.new(slog::o!("worker" => i)),
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-dispatch-{}", name_prefix, i))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Let the workers started so far drain and exit.
                    drop(sender);
                    join_all(workers, &logger);
                    return Err(e);
                }
            }
        }

        Ok(DispatchPool {
            dispatcher: Dispatcher { sender },
            workers,
            logger,
        })
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub(crate) fn thread_ids(&self) -> Vec<ThreadId> {
        self.workers.iter().map(|w| w.thread().id()).collect()
    }

    /// Workers finish the queued work and exit once every `Dispatcher` clone is dropped. This
    /// blocks until then.
    pub(crate) fn close(self) {
        let DispatchPool {
            dispatcher,
            workers,
            logger,
        } = self;
        drop(dispatcher);
        join_all(workers, &logger);
    }
}

fn join_all(workers: Vec<JoinHandle<()>>, logger: &slog::Logger) {
    for worker in workers.into_iter() {
        if worker.join().is_err() {
            slog::warn!(logger, "Dispatch worker exited abnormally");
        }
    }
}

struct Worker {
    queue: Receiver<Work>,
    registry: Arc<HandlerRegistry>,
    logger: slog::Logger,
}

impl Worker {
    fn run(self) {
        while let Ok(work) = self.queue.recv() {
            match work {
                Work::NodeStateChanged(change) => self.notify_node_state_changed(change),
                Work::MessageReceived(message) => self.deliver_message(message),
            }
        }
        slog::debug!(self.logger, "Dispatch worker exiting");
    }

    fn notify_node_state_changed(&self, change: NodeStateChange) {
        for handler in self.registry.node_state_change_handlers().into_iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.node_state_changed(&change.node, change.state, change.last_seen_millis)
            }));
            if result.is_err() {
                slog::warn!(
                    self.logger,
                    "Node state change handler panicked";
                    "node" => &change.node,
                    "state" => %change.state,
                );
            }
        }
    }

    fn deliver_message(&self, message: Message) {
        let handler = match self.registry.message_handler(message.topic()) {
            Some(handler) => handler,
            None => {
                slog::debug!(self.logger, "Handler removed before delivery, dropping message"; "topic" => message.topic());
                return;
            }
        };

        let topic = message.topic().to_string();
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(message)));
        if result.is_err() {
            slog::warn!(self.logger, "Message handler panicked"; "topic" => topic);
        }
    }
}
