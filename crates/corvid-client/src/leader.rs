//! Atomic holder of the current cluster leader.
//!
//! The cell pairs the leader value with a latch that request dispatch blocks
//! on while no leader is known. The latch is raised exactly when a real
//! leader is installed and reset when the cell transitions back to empty, so
//! outside of a transition the two always agree.
//!
//! All leadership transitions go through the three compare-and-swap style
//! operations below; writers serialize on the cell lock, which makes
//! transitions linearizable with respect to request dispatch.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::node::ServerNode;

/// Holder of the current leader with a "leader known" wait primitive
#[derive(Debug)]
pub struct LeaderCell {
    cell: RwLock<Option<Arc<ServerNode>>>,
    latch: watch::Sender<bool>,
}

impl Default for LeaderCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderCell {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            cell: RwLock::new(None),
            latch,
        }
    }

    /// Snapshot the current leader
    pub fn get(&self) -> Option<Arc<ServerNode>> {
        self.cell.read().clone()
    }

    /// Whether the "leader known" latch is currently raised
    pub fn is_leader_known(&self) -> bool {
        *self.latch.borrow()
    }

    /// Install a confirmed leader and raise the latch
    pub fn set_known_leader(&self, node: Arc<ServerNode>) {
        let mut cell = self.cell.write();
        info!(url = %node.url, "cluster leader installed");
        *cell = Some(node);
        self.latch.send_replace(true);
    }

    /// Clear the cell iff it still holds `prev`.
    ///
    /// Returns true when the clear happened or the cell was already empty;
    /// false when someone installed a different leader in the meantime. On a
    /// real non-empty-to-empty transition the latch is reset.
    pub fn compare_and_clear(&self, prev: Option<&ServerNode>) -> bool {
        let mut cell = self.cell.write();
        match (cell.as_ref(), prev) {
            (None, _) => true,
            (Some(current), Some(prev)) if current.url == prev.url => {
                debug!(url = %current.url, "cluster leader cleared");
                *cell = None;
                self.latch.send_replace(false);
                true
            }
            _ => false,
        }
    }

    /// Install `node` iff no leader is currently held.
    ///
    /// The latch is raised only when `raise_latch` is set, letting a caller
    /// record a fallback node without claiming the leader is known.
    pub fn set_if_none(&self, node: Arc<ServerNode>, raise_latch: bool) -> bool {
        let mut cell = self.cell.write();
        if cell.is_some() {
            return false;
        }
        debug!(url = %node.url, raise_latch, "installing node into empty leader cell");
        *cell = Some(node);
        if raise_latch {
            self.latch.send_replace(true);
        }
        true
    }

    /// Unconditionally clear the cell and reset the latch.
    ///
    /// Only safe during a controlled topology refresh; concurrent dispatch
    /// observes the cleared cell and re-enters the leader wait.
    pub fn force_clear(&self) {
        let mut cell = self.cell.write();
        *cell = None;
        self.latch.send_replace(false);
    }

    /// Block until the latch is raised or `timeout` elapses.
    ///
    /// Returns true when a leader became known within the window.
    pub async fn await_leader(&self, timeout: Duration) -> bool {
        let mut latch = self.latch.subscribe();
        if *latch.borrow() {
            return true;
        }
        let result = tokio::time::timeout(timeout, latch.wait_for(|raised| *raised)).await;
        matches!(result, Ok(Ok(_)))
    }
}
