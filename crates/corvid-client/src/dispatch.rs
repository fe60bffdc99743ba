//! Request routing: node selection, read striping, and the per-call
//! dispatch context.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::config::FailoverBehavior;
use crate::failure::FailureCounters;
use crate::node::ServerNode;

/// Header attached to every cluster-aware request
pub const CLUSTER_AWARE_HEADER: &str = "Raven-Cluster-Aware";
/// Header announcing that reads may be served by any node
pub const READ_BEHAVIOR_HEADER: &str = "Raven-Cluster-Read-Behavior";
/// Header asking the server to accept a request during failover
pub const FAILOVER_BEHAVIOR_HEADER: &str = "Raven-Cluster-Failover-Behavior";
/// Response header marking a 302 as a leader hint
pub const LEADER_REDIRECT_HEADER: &str = "Raven-Leader-Redirect";

/// Striping base value that pins all reads to the leader
const FORCED_TO_MASTER: i64 = -1;

/// HTTP method of the dispatched operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Reads may be striped across the cluster; everything else goes to the
    /// leader
    pub fn is_read(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Per-call routing hints handed to the operation closure.
///
/// Node descriptors are immutable; everything request-scoped, including the
/// failover header raised after a failure, lives here.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Reads may be answered by any node under the current policy
    pub read_behavior_all: bool,
    /// Ask the server to serve the request even though the cluster is
    /// failing over
    pub cluster_failover_header: bool,
}

impl DispatchContext {
    pub(crate) fn new(read_behavior_all: bool, cluster_failover_header: bool) -> Self {
        Self {
            read_behavior_all,
            cluster_failover_header,
        }
    }

    /// Wire headers the transport must attach to the outgoing request
    pub fn header_pairs(&self) -> Vec<(&'static str, &'static str)> {
        let mut headers = vec![(CLUSTER_AWARE_HEADER, "true")];
        if self.read_behavior_all {
            headers.push((READ_BEHAVIOR_HEADER, "All"));
        }
        if self.cluster_failover_header {
            headers.push((FAILOVER_BEHAVIOR_HEADER, "true"));
        }
        headers
    }
}

/// Round-robin base used to distribute reads across the node list
#[derive(Debug, Default)]
pub struct ReadStriping {
    base: AtomicI64,
}

impl ReadStriping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current base without modifying it
    pub fn base(&self) -> i64 {
        self.base.load(Ordering::Relaxed)
    }

    /// Return the striping base, post-incrementing it when `increment` is set
    pub fn read_striping_base(&self, increment: bool) -> i64 {
        if increment {
            self.base.fetch_add(1, Ordering::Relaxed)
        } else {
            self.base.load(Ordering::Relaxed)
        }
    }

    /// Pin all reads to the leader until the returned guard is dropped.
    ///
    /// The previous base is restored on every exit path, including panics.
    pub fn force_read_from_master(&self) -> ForceReadFromMaster<'_> {
        let previous = self.base.swap(FORCED_TO_MASTER, Ordering::Relaxed);
        ForceReadFromMaster {
            striping: self,
            previous,
        }
    }
}

/// Scope guard restoring the read striping base on drop
#[derive(Debug)]
pub struct ForceReadFromMaster<'a> {
    striping: &'a ReadStriping,
    previous: i64,
}

impl Drop for ForceReadFromMaster<'_> {
    fn drop(&mut self) {
        self.striping.base.store(self.previous, Ordering::Relaxed);
    }
}

/// Outcome of node selection for a single dispatch
#[derive(Debug, Clone)]
pub enum Choice {
    /// Send the operation to this node
    Node(Arc<ServerNode>),
    /// Probe this striped read target first, falling back to the leader
    Striped {
        node: Arc<ServerNode>,
        leader: Arc<ServerNode>,
    },
    /// No leader known; walk the surviving nodes in order
    FailoverWalk,
    /// No leader known and the policy does not tolerate that
    NoStableLeader,
}

/// Select the target node for an operation.
pub fn route(
    leader: Option<&Arc<ServerNode>>,
    nodes: &[Arc<ServerNode>],
    method: HttpMethod,
    behavior: FailoverBehavior,
    striping_base: i64,
    failures: &FailureCounters,
) -> Choice {
    match behavior {
        FailoverBehavior::ReadFromAllWriteToLeader => match leader {
            Some(leader) => striped_or_leader(leader, nodes, method, striping_base, failures),
            None => Choice::NoStableLeader,
        },
        FailoverBehavior::ReadFromAllWriteToLeaderWithFailovers => match leader {
            Some(leader) => striped_or_leader(leader, nodes, method, striping_base, failures),
            None => Choice::FailoverWalk,
        },
        FailoverBehavior::ReadFromLeaderWriteToLeaderWithFailovers => match leader {
            Some(leader) => Choice::Node(leader.clone()),
            None => Choice::FailoverWalk,
        },
        FailoverBehavior::ReadFromLeaderWriteToLeader => match leader {
            Some(leader) => Choice::Node(leader.clone()),
            None => Choice::NoStableLeader,
        },
    }
}

fn striped_or_leader(
    leader: &Arc<ServerNode>,
    nodes: &[Arc<ServerNode>],
    method: HttpMethod,
    striping_base: i64,
    failures: &FailureCounters,
) -> Choice {
    if method.is_read() && striping_base >= 0 && !nodes.is_empty() {
        let index = (striping_base as u64 % nodes.len() as u64) as usize;
        let candidate = &nodes[index];
        if failures.is_eligible(&candidate.url) {
            if candidate.url == leader.url {
                return Choice::Node(leader.clone());
            }
            return Choice::Striped {
                node: candidate.clone(),
                leader: leader.clone(),
            };
        }
    }
    Choice::Node(leader.clone())
}
