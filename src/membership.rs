//! Cluster configuration: the set of servers and their voting status.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A single server in a [`Configuration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    pub address: String,
    pub voting: bool,
}

/// An ordered list of servers with no duplicate ids.
///
/// Replaces a whole configuration entry in the log; there is no joint
/// (old+new) configuration — a change is a single configuration entry
/// derived from the previous one (one-server-at-a-time, per the Raft
/// dissertation §4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    servers: Vec<Server>,
}

impl Configuration {
    /// The initial configuration installed by bootstrap: a single voting
    /// member, this node.
    pub fn new_initial(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            servers: vec![Server {
                id,
                address: address.into(),
                voting: true,
            }],
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn get(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Is `id` present and voting?
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.get(id).map(|s| s.voting).unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.voting)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Strict majority of the voting members.
    pub fn quorum_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.servers.iter().map(|s| s.id)
    }

    /// Returns a copy of this configuration with `id` added as a
    /// non-voting member. Fails (returns `None`) if `id` already exists.
    pub fn with_added_non_voter(&self, id: NodeId, address: impl Into<String>) -> Option<Self> {
        if self.contains(id) {
            return None;
        }
        let mut servers = self.servers.clone();
        servers.push(Server {
            id,
            address: address.into(),
            voting: false,
        });
        Some(Self { servers })
    }

    /// Returns a copy of this configuration with `id` switched to voting.
    /// Fails if `id` is absent or already voting.
    pub fn with_promoted(&self, id: NodeId) -> Option<Self> {
        if !self.contains(id) || self.is_voter(id) {
            return None;
        }
        let mut servers = self.servers.clone();
        for s in servers.iter_mut() {
            if s.id == id {
                s.voting = true;
            }
        }
        Some(Self { servers })
    }

    /// Returns a copy of this configuration with `id` removed entirely.
    /// Fails if `id` is absent.
    pub fn with_removed(&self, id: NodeId) -> Option<Self> {
        if !self.contains(id) {
            return None;
        }
        let servers = self.servers.iter().filter(|s| s.id != id).cloned().collect();
        Some(Self { servers })
    }
}
