//! Client conventions: failover policy, timeouts, and static failover servers.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::node::FailoverServer;

/// Default wait for a leader to be elected before a request gives up
const DEFAULT_WAIT_FOR_LEADER_TIMEOUT: Duration = Duration::from_secs(5);
/// Default overall deadline for a topology probe fan-out
const DEFAULT_TOPOLOGY_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
/// Default minimum age before a non-forced refresh re-probes the cluster
const DEFAULT_TOPOLOGY_REFRESH_THROTTLE: Duration = Duration::from_secs(300);
/// Default retry budget per request (attempts = retries + 1)
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Where reads and writes go when the leader is unknown or unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailoverBehavior {
    /// Reads and writes both go to the leader; no leader is an error
    #[default]
    ReadFromLeaderWriteToLeader,
    /// Reads are striped across all nodes, writes go to the leader
    ReadFromAllWriteToLeader,
    /// Striped reads, leader writes, and surviving-node failover when the
    /// leader is unknown
    ReadFromAllWriteToLeaderWithFailovers,
    /// Leader reads and writes, with surviving-node failover when the leader
    /// is unknown
    ReadFromLeaderWriteToLeaderWithFailovers,
}

impl FailoverBehavior {
    /// Whether dispatch may proceed without a known leader by walking the
    /// surviving nodes
    pub fn tolerates_missing_leader(&self) -> bool {
        matches!(
            self,
            FailoverBehavior::ReadFromAllWriteToLeaderWithFailovers
                | FailoverBehavior::ReadFromLeaderWriteToLeaderWithFailovers
        )
    }

    /// Whether reads are striped across the whole node list
    pub fn reads_from_all(&self) -> bool {
        matches!(
            self,
            FailoverBehavior::ReadFromAllWriteToLeader
                | FailoverBehavior::ReadFromAllWriteToLeaderWithFailovers
        )
    }
}

/// Failover overrides a server can push to its clients inside a topology
/// document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_behavior: Option<FailoverBehavior>,
}

/// Conventions governing routing, failover, and topology refresh.
///
/// The failover behavior is the only runtime-mutable field: the server can
/// override it through the `ClientConfiguration` attached to a topology
/// document.
#[derive(Debug)]
pub struct Conventions {
    failover_behavior: RwLock<FailoverBehavior>,
    pub wait_for_leader_timeout: Duration,
    pub topology_fetch_timeout: Duration,
    pub topology_refresh_throttle: Duration,
    pub failover_servers: Vec<FailoverServer>,
    /// When no node answers a topology probe and no failover servers are
    /// configured, install the primary node as leader so requests can still
    /// be attempted against it.
    pub promote_primary_when_no_topology: bool,
    pub max_retries: u32,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            failover_behavior: RwLock::new(FailoverBehavior::default()),
            wait_for_leader_timeout: DEFAULT_WAIT_FOR_LEADER_TIMEOUT,
            topology_fetch_timeout: DEFAULT_TOPOLOGY_FETCH_TIMEOUT,
            topology_refresh_throttle: DEFAULT_TOPOLOGY_REFRESH_THROTTLE,
            failover_servers: Vec::new(),
            promote_primary_when_no_topology: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Conventions {
    /// Create a new builder
    pub fn builder() -> ConventionsBuilder {
        ConventionsBuilder::default()
    }

    /// Current failover behavior
    pub fn failover_behavior(&self) -> FailoverBehavior {
        *self.failover_behavior.read()
    }

    /// Apply a server-pushed configuration override
    pub fn update_from(&self, configuration: &ClientConfiguration) {
        if let Some(behavior) = configuration.failover_behavior {
            let mut current = self.failover_behavior.write();
            if *current != behavior {
                info!(?behavior, "failover behavior overridden by server configuration");
                *current = behavior;
            }
        }
    }
}

/// Builder for [`Conventions`]
#[derive(Debug, Default)]
pub struct ConventionsBuilder {
    conventions: Conventions,
}

impl ConventionsBuilder {
    pub fn failover_behavior(self, behavior: FailoverBehavior) -> Self {
        *self.conventions.failover_behavior.write() = behavior;
        self
    }

    pub fn wait_for_leader_timeout(mut self, timeout: Duration) -> Self {
        self.conventions.wait_for_leader_timeout = timeout;
        self
    }

    pub fn topology_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.conventions.topology_fetch_timeout = timeout;
        self
    }

    pub fn topology_refresh_throttle(mut self, throttle: Duration) -> Self {
        self.conventions.topology_refresh_throttle = throttle;
        self
    }

    pub fn failover_servers(mut self, servers: Vec<FailoverServer>) -> Self {
        self.conventions.failover_servers = servers;
        self
    }

    pub fn promote_primary_when_no_topology(mut self, promote: bool) -> Self {
        self.conventions.promote_primary_when_no_topology = promote;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.conventions.max_retries = retries;
        self
    }

    pub fn build(self) -> Conventions {
        self.conventions
    }
}
