//! A peer's cached copy of the router's directory.

use crate::protocol::{Peer, Rank};

#[derive(Debug, Clone, Default)]
pub struct Presence {
    peers: Vec<Peer>,
}

impl Presence {
    /// Replace the snapshot wholesale; the router always sends the full table.
    pub fn replace(&mut self, peers: Vec<Peer>) {
        self.peers = peers;
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn by_rank(&self, rank: Rank) -> Option<&Peer> {
        self.peers.iter().find(|p| p.rank == rank)
    }

    pub fn by_identity(&self, identity: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(rank: Rank, identity: &str) -> Peer {
        Peer {
            identity: identity.into(),
            display_name: format!("User_{}", rank),
            rank,
        }
    }

    #[test]
    fn replace_does_not_merge() {
        let mut presence = Presence::default();
        presence.replace(vec![peer(1, "a"), peer(2, "b")]);
        presence.replace(vec![peer(3, "c")]);
        assert_eq!(presence.len(), 1);
        assert!(presence.by_rank(1).is_none());
        assert_eq!(presence.by_identity("c").map(|p| p.rank), Some(3));
    }
}
