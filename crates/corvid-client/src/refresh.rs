//! Background topology discovery.
//!
//! At most one refresh runs per executor at any time; concurrent requesters
//! join the in-flight task through the handle it returns. A refresh probes
//! the known nodes concurrently, picks the freshest topology document, and
//! installs the resulting node list and leader. When nothing answers, the
//! probe set falls back to the configured failover servers and finally to
//! promoting the primary node so requests still have somewhere to go.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{server_hash, CachedNode, TopologyStore};
use crate::config::Conventions;
use crate::error::Result;
use crate::node::{convert_destinations, ServerNode, Topology};
use crate::state::ClusterState;

/// Pause between refresh rounds while waiting for a leader to emerge
const LEADER_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Port for asking a node about the cluster topology.
///
/// Implementations honor their own per-call timeout; the refresher applies
/// an overall deadline across the whole fan-out on top of it.
#[async_trait]
pub trait TopologyFetcher: Send + Sync {
    async fn topology(&self, node: &ServerNode) -> Result<Topology>;
}

/// Completion handle for an in-flight refresh
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    done: watch::Receiver<bool>,
}

impl RefreshHandle {
    /// Wait for the refresh that produced this handle to finish
    pub async fn await_done(mut self) {
        if *self.done.borrow() {
            return;
        }
        let _ = self.done.wait_for(|done| *done).await;
    }

    /// A handle for a refresh that already ran
    fn completed() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { done: rx }
    }
}

#[derive(Debug, Default)]
struct RefreshSlot {
    in_flight: Option<RefreshHandle>,
    first_refresh_done: bool,
}

/// Single-flight topology refresher
pub struct TopologyRefresher {
    state: Arc<ClusterState>,
    store: Arc<dyn TopologyStore>,
    conventions: Arc<Conventions>,
    slot: Mutex<RefreshSlot>,
    last_update: Mutex<Option<Instant>>,
    refreshes_started: AtomicU64,
    shutdown: CancellationToken,
}

impl TopologyRefresher {
    pub fn new(
        state: Arc<ClusterState>,
        store: Arc<dyn TopologyStore>,
        conventions: Arc<Conventions>,
    ) -> Self {
        Self {
            state,
            store,
            conventions,
            slot: Mutex::new(RefreshSlot::default()),
            last_update: Mutex::new(None),
            refreshes_started: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of refresh tasks started over the lifetime of this instance
    pub fn refreshes_started(&self) -> u64 {
        self.refreshes_started.load(Ordering::Relaxed)
    }

    /// When the last refresh finished
    pub fn last_update(&self) -> Option<Instant> {
        *self.last_update.lock()
    }

    /// Stop any in-flight refresh. Called on executor teardown; individual
    /// request cancellation never reaches the background task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Request a topology refresh, joining the in-flight one when present.
    ///
    /// A non-forced request is a no-op while a leader is known and the last
    /// refresh is younger than the configured throttle. The very first
    /// request additionally restores the cached snapshot before probing the
    /// network; the cache hit never short-circuits the probe.
    pub fn request_refresh(
        self: &Arc<Self>,
        primary: Arc<ServerNode>,
        fetcher: Arc<dyn TopologyFetcher>,
        force: bool,
    ) -> RefreshHandle {
        let bootstrap;
        let handle;
        let completion;
        {
            let mut slot = self.slot.lock();
            if let Some(in_flight) = &slot.in_flight {
                return in_flight.clone();
            }
            if !force && self.state.leader.get().is_some() {
                let fresh_enough = self
                    .last_update
                    .lock()
                    .is_some_and(|at| at.elapsed() < self.conventions.topology_refresh_throttle);
                if fresh_enough {
                    debug!("topology is fresh; skipping refresh");
                    return RefreshHandle::completed();
                }
            }
            bootstrap = !slot.first_refresh_done;
            slot.first_refresh_done = true;
            let (tx, rx) = watch::channel(false);
            completion = tx;
            handle = RefreshHandle { done: rx };
            slot.in_flight = Some(handle.clone());
        }

        self.refreshes_started.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => {
                    debug!("topology refresh aborted by shutdown");
                }
                _ = this.run_refresh(primary, fetcher, bootstrap) => {}
            }
            this.slot.lock().in_flight = None;
            *this.last_update.lock() = Some(Instant::now());
            let _ = completion.send(true);
        });

        handle
    }

    async fn run_refresh(
        &self,
        primary: Arc<ServerNode>,
        fetcher: Arc<dyn TopologyFetcher>,
        bootstrap: bool,
    ) {
        if bootstrap {
            self.bootstrap_from_cache(&primary).await;
        }

        let hash = server_hash(&primary.url);
        let mut tried_failovers = false;

        loop {
            let prev_leader = self.state.leader.get();
            let probe = self.probe_set(&primary, tried_failovers);
            let results = self.fan_out(&probe, &fetcher).await;

            for (node, document) in probe.iter().zip(&results) {
                if document.is_some() {
                    self.state.failures.reset(&node.url);
                }
            }

            let Some((winner, document)) = select_winner(&probe, &results) else {
                if !self.conventions.failover_servers.is_empty() && !tried_failovers {
                    info!("no topology from known nodes; probing configured failover servers");
                    tried_failovers = true;
                    continue;
                }
                if self.conventions.promote_primary_when_no_topology {
                    if self.state.leader.set_if_none(primary.clone(), true) {
                        warn!(url = %primary.url, "no topology reachable; promoting primary node");
                    }
                } else {
                    warn!(url = %primary.url, "no topology reachable and promotion disabled");
                }
                if self.state.node_list().is_empty() {
                    self.state.replace_nodes(vec![primary.clone()]);
                }
                return;
            };

            debug!(
                url = %winner.url,
                term = document.term,
                commit_index = document.cluster_commit_index,
                is_leader = document.cluster_information.is_leader,
                "topology document selected"
            );

            let winner = Arc::new(
                winner
                    .as_ref()
                    .clone()
                    .with_cluster_info(document.cluster_information.clone()),
            );
            let mut nodes = convert_destinations(&document.destinations);
            nodes.retain(|n| n.url != winner.url);
            nodes.push(winner.clone());

            self.state.replace_nodes(nodes.clone());

            let cached: Vec<CachedNode> = nodes.iter().map(|n| CachedNode::from_node(n)).collect();
            self.store.save(&hash, &cached).await;

            if let Some(configuration) = &document.client_configuration {
                self.conventions.update_from(configuration);
            }

            if document.cluster_information.is_leader {
                self.state.leader.set_known_leader(winner);
                return;
            }

            // The freshest document came from a follower. Clear a leader we
            // no longer trust (unless someone else already installed a new
            // one) and probe again shortly.
            if !self
                .state
                .leader
                .compare_and_clear(prev_leader.as_deref())
                && self.state.leader.get().is_some()
            {
                debug!("leader installed elsewhere during refresh");
                return;
            }
            tokio::time::sleep(LEADER_RETRY_BACKOFF).await;
        }
    }

    async fn bootstrap_from_cache(&self, primary: &Arc<ServerNode>) {
        let hash = server_hash(&primary.url);
        let Some(cached) = self.store.load(&hash).await else {
            return;
        };
        if cached.is_empty() {
            return;
        }

        let nodes: Vec<Arc<ServerNode>> = cached
            .iter()
            .map(|c| Arc::new(c.to_node(&primary.credentials)))
            .collect();
        info!(nodes = nodes.len(), "topology restored from local cache");
        self.state.replace_nodes(nodes.clone());

        match nodes.iter().find(|n| n.is_leader()) {
            Some(leader) => self.state.leader.set_known_leader(leader.clone()),
            None => self.state.leader.force_clear(),
        }
    }

    /// Nodes to probe this round: the known membership first, then the
    /// primary plus configured failover servers once the membership has been
    /// exhausted.
    fn probe_set(&self, primary: &Arc<ServerNode>, tried_failovers: bool) -> Vec<Arc<ServerNode>> {
        if !tried_failovers {
            let nodes = self.state.node_list();
            if nodes.is_empty() {
                return vec![primary.clone()];
            }
            return nodes.as_ref().clone();
        }

        let mut probe = vec![primary.clone()];
        for server in &self.conventions.failover_servers {
            let node = Arc::new(server.to_node());
            if !probe.iter().any(|n| n.url == node.url) {
                probe.push(node);
            }
        }
        probe
    }

    async fn fan_out(
        &self,
        probe: &[Arc<ServerNode>],
        fetcher: &Arc<dyn TopologyFetcher>,
    ) -> Vec<Option<Topology>> {
        let deadline = self.conventions.topology_fetch_timeout;
        let probes = probe.iter().map(|node| {
            let fetcher = fetcher.clone();
            let node = node.clone();
            async move {
                match tokio::time::timeout(deadline, fetcher.topology(&node)).await {
                    Ok(Ok(document)) => Some(document),
                    Ok(Err(error)) => {
                        debug!(url = %node.url, %error, "topology probe failed");
                        None
                    }
                    Err(_) => {
                        debug!(url = %node.url, "topology probe timed out");
                        None
                    }
                }
            }
        });
        futures::future::join_all(probes).await
    }
}

/// Pick the freshest document: highest `(term, commit index + leader bonus)`,
/// first responder winning ties.
fn select_winner<'a>(
    probe: &'a [Arc<ServerNode>],
    results: &'a [Option<Topology>],
) -> Option<(&'a Arc<ServerNode>, &'a Topology)> {
    let mut best: Option<(&Arc<ServerNode>, &Topology)> = None;
    for (node, document) in probe.iter().zip(results) {
        let Some(document) = document else { continue };
        match &best {
            Some((_, current)) if document.sort_key() <= current.sort_key() => {}
            _ => best = Some((node, document)),
        }
    }
    best
}
