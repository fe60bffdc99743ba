//! Shared cluster view: node list, leader cell, and failure counters.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::failure::FailureCounters;
use crate::leader::LeaderCell;
use crate::node::ServerNode;

/// The executor-wide view of the cluster.
///
/// The node list is replaced wholesale by pointer swap on topology refresh:
/// concurrent readers observe either the old or the new list, never a torn
/// one.
#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: RwLock<Arc<Vec<Arc<ServerNode>>>>,
    pub leader: LeaderCell,
    pub failures: FailureCounters,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the currently known membership
    pub fn node_list(&self) -> Arc<Vec<Arc<ServerNode>>> {
        self.nodes.read().clone()
    }

    /// Atomically install a new membership list
    pub fn replace_nodes(&self, nodes: Vec<Arc<ServerNode>>) {
        *self.nodes.write() = Arc::new(nodes);
    }

    /// Find a known node by URL (trailing-slash insensitive)
    pub fn find_node(&self, url: &str) -> Option<Arc<ServerNode>> {
        let url = url.trim_end_matches('/');
        self.node_list().iter().find(|n| n.url == url).cloned()
    }
}
