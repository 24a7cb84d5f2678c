use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Locally derived liveness of a remote node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RemoteNodeState {
    Active,
    Missing,
}

impl fmt::Display for RemoteNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteNodeState::Active => write!(f, "ACTIVE"),
            RemoteNodeState::Missing => write!(f, "MISSING"),
        }
    }
}

/// A transition observed by the failure detector. `last_seen_millis` is 0 when the node is
/// missing, otherwise the epoch milliseconds of its latest heartbeat.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeStateChange {
    pub node: String,
    pub state: RemoteNodeState,
    pub last_seen_millis: i64,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("Heartbeat from unknown peer '{0}'")]
pub(crate) struct UnknownPeer(pub(crate) String);

#[derive(Clone, Copy, Debug)]
struct LivenessRecord {
    // 0 means never seen or currently missing.
    last_seen_millis: i64,
    state: RemoteNodeState,
}

/// LivenessTable is the failure detector. It holds one record per configured peer (never self)
/// for the lifetime of the service; peers are never added or removed at runtime.
///
/// It is a plain value with no clock of its own. The owner passes `now` in, which keeps every
/// mutation on the owner's thread and makes expiry deterministic to test.
pub(crate) struct LivenessTable {
    records: HashMap<String, LivenessRecord>,
    expiry_window_millis: i64,
}

impl LivenessTable {
    pub(crate) fn new<I>(peers: I, expiry_window: Duration) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let records = peers
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    LivenessRecord {
                        last_seen_millis: 0,
                        state: RemoteNodeState::Missing,
                    },
                )
            })
            .collect();

        LivenessTable {
            records,
            expiry_window_millis: expiry_window.as_millis() as i64,
        }
    }

    pub(crate) fn contains(&self, peer: &str) -> bool {
        self.records.contains_key(peer)
    }

    /// Refresh `peer`'s timestamp. Returns the ACTIVE transition if the peer was missing.
    pub(crate) fn record_heartbeat(&mut self, peer: &str, now_millis: i64) -> Result<Option<NodeStateChange>, UnknownPeer> {
        let record = self
            .records
            .get_mut(peer)
            .ok_or_else(|| UnknownPeer(peer.to_string()))?;

        let previous = record.last_seen_millis;
        record.last_seen_millis = now_millis;
        if previous != 0 {
            return Ok(None);
        }

        record.state = RemoteNodeState::Active;
        Ok(Some(NodeStateChange {
            node: peer.to_string(),
            state: RemoteNodeState::Active,
            last_seen_millis: now_millis,
        }))
    }

    /// Expire every peer whose latest heartbeat is older than the expiry window. Each expiry is
    /// reported once; an expired peer stays silent until its next heartbeat.
    pub(crate) fn tick(&mut self, now_millis: i64) -> Vec<NodeStateChange> {
        let expiry_window_millis = self.expiry_window_millis;
        let mut expired = Vec::new();
        for (peer, record) in self.records.iter_mut() {
            if record.last_seen_millis != 0 && now_millis - record.last_seen_millis > expiry_window_millis {
                record.last_seen_millis = 0;
                record.state = RemoteNodeState::Missing;
                expired.push(NodeStateChange {
                    node: peer.clone(),
                    state: RemoteNodeState::Missing,
                    last_seen_millis: 0,
                });
            }
        }

        expired
    }

    /// Current state of every peer, used to tell handlers where things stand on startup.
    pub(crate) fn snapshot(&self) -> Vec<NodeStateChange> {
        let mut snapshot: Vec<_> = self
            .records
            .iter()
            .map(|(peer, record)| NodeStateChange {
                node: peer.clone(),
                state: record.state,
                last_seen_millis: record.last_seen_millis,
            })
            .collect();
        snapshot.sort_by(|a, b| a.node.cmp(&b.node));

        snapshot
    }

    #[cfg(test)]
    fn state_of(&self, peer: &str) -> Option<(RemoteNodeState, i64)> {
        self.records.get(peer).map(|r| (r.state, r.last_seen_millis))
    }
}
