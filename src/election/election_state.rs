use crate::election::RankSource;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Primary,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the caller must do after an announce was applied.
#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct AnnounceOutcome {
    /// Announce our rank again: either it was redrawn after a collision, or the sender was
    /// unranked until now and may not have heard it.
    pub(crate) reannounce: bool,
    pub(crate) role_change: Option<Role>,
}

/// ElectionState is the randomized bully election of one node. It decides "what" happens: who
/// is primary and which role callbacks fire. Sending announces and invoking callbacks is left
/// to the caller.
///
/// Each node holds a rank per known node, itself included. The primary is the node with the
/// strictly greatest rank; equal ranks are resolved by the colliding nodes redrawing. Peers
/// are unranked (0) until they announce, and drop back to 0 when they go missing.
pub(crate) struct ElectionState<R: RankSource> {
    my_identity: String,
    ranks: BTreeMap<String, i32>,
    primary: String,
    bootstrapped: bool,
    rank_source: R,
}

impl<R: RankSource> ElectionState<R> {
    pub(crate) fn new(my_identity: String, mut rank_source: R) -> Self {
        let mut ranks = BTreeMap::new();
        ranks.insert(my_identity.clone(), rank_source.next_rank());

        ElectionState {
            primary: my_identity.clone(),
            my_identity,
            ranks,
            bootstrapped: false,
            rank_source,
        }
    }

    pub(crate) fn my_rank(&self) -> i32 {
        self.rank_of(&self.my_identity)
    }

    fn rank_of(&self, node: &str) -> i32 {
        self.ranks.get(node).copied().unwrap_or(0)
    }

    /// Optimistically assume this node is primary before hearing from anyone. Peers that
    /// outrank us correct this on their first announce.
    pub(crate) fn bootstrap(&mut self) -> Role {
        self.primary = self.my_identity.clone();
        self.bootstrapped = true;
        Role::Primary
    }

    pub(crate) fn on_announce(&mut self, sender: &str, rank: i32) -> AnnounceOutcome {
        if sender == self.my_identity {
            return AnnounceOutcome::default();
        }

        let previous = self.ranks.insert(sender.to_string(), rank);
        let mut reannounce = previous.unwrap_or(0) == 0;
        while self.my_rank() == rank {
            let redrawn = self.rank_source.next_rank();
            self.ranks.insert(self.my_identity.clone(), redrawn);
            reannounce = true;
        }

        AnnounceOutcome {
            reannounce,
            role_change: self.evaluate(),
        }
    }

    pub(crate) fn on_peer_missing(&mut self, peer: &str) -> Option<Role> {
        self.ranks.insert(peer.to_string(), 0);
        self.evaluate()
    }

    /// Recompute the primary. Returns the new role only when this node's role changed.
    pub(crate) fn evaluate(&mut self) -> Option<Role> {
        let candidate = self.candidate();
        if candidate == self.primary {
            return None;
        }

        let was_primary = self.primary == self.my_identity;
        let is_primary = candidate == self.my_identity;
        self.primary = candidate;

        if !self.bootstrapped {
            return None;
        }
        match (was_primary, is_primary) {
            (true, false) => Some(Role::Secondary),
            (false, true) => Some(Role::Primary),
            _ => None,
        }
    }

    /// This node wins ties; equal peer ranks never outrank each other.
    fn candidate(&self) -> String {
        let mut candidate = &self.my_identity;
        let mut candidate_rank = self.my_rank();
        for (node, rank) in self.ranks.iter() {
            if *rank > candidate_rank {
                candidate = node;
                candidate_rank = *rank;
            }
        }

        candidate.clone()
    }

    pub(crate) fn primary(&self) -> &str {
        &self.primary
    }

    pub(crate) fn role(&self) -> Role {
        if self.primary == self.my_identity {
            Role::Primary
        } else {
            Role::Secondary
        }
    }
}
