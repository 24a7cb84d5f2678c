use std::fmt;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct LifecycleCell {
    state: Mutex<Lifecycle>,
}

impl LifecycleCell {
    pub(crate) fn new() -> Self {
        LifecycleCell {
            state: Mutex::new(Lifecycle::Stopped),
        }
    }

    pub(crate) fn get(&self) -> Lifecycle {
        *self.state.lock().expect("LifecycleCell.get() mutex guard poison")
    }

    pub(crate) fn set(&self, new_state: Lifecycle) {
        *self.state.lock().expect("LifecycleCell.set() mutex guard poison") = new_state;
    }

    /// Moves to `to` only if currently `from`. Returns whether it moved.
    pub(crate) fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        let mut state = self.state.lock().expect("LifecycleCell.transition() mutex guard poison");
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}
