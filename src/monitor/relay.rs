use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Requests from foreign threads to the reactor thread. Publishing is only ever done by the
/// reactor, so every other thread goes through here.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum RelayCommand {
    /// Wire frames to put on the cluster transport verbatim.
    Publish(Vec<String>),
    Stop,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("Reactor is not running")]
pub(crate) struct RelayClosed;

/// RelaySlot holds the relay sender of the current reactor generation. It is filled when the
/// reactor starts and emptied when the reactor exits.
#[derive(Clone, Default)]
pub(crate) struct RelaySlot {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<RelayCommand>>>>,
}

impl RelaySlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install a fresh channel and return its receiving end.
    pub(crate) fn open(&self) -> mpsc::UnboundedReceiver<RelayCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sender
            .lock()
            .expect("RelaySlot.open() mutex guard poison")
            .replace(tx);

        rx
    }

    pub(crate) fn close(&self) {
        self.sender.lock().expect("RelaySlot.close() mutex guard poison").take();
    }

    pub(crate) fn send(&self, command: RelayCommand) -> Result<(), RelayClosed> {
        let sender = self.sender.lock().expect("RelaySlot.send() mutex guard poison");
        match sender.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| RelayClosed),
            None => Err(RelayClosed),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.sender
            .lock()
            .expect("RelaySlot.is_open() mutex guard poison")
            .is_some()
    }
}
