//! The public entry point: dispatches operations against the cluster with
//! leader discovery, retries, and failover.
//!
//! Every request flows through [`RequestExecutor::execute`]: snapshot the
//! leader (blocking on election when unknown), pick a target node per the
//! failover policy, invoke the injected operation, and classify the outcome.
//! Server-down and 417 responses retry; a 302 carrying the leader hint is
//! followed and installs the new leader; leader churn during a request is
//! retried without consuming the retry budget.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TopologyStore;
use crate::config::{Conventions, FailoverBehavior};
use crate::dispatch::{route, Choice, DispatchContext, ForceReadFromMaster, HttpMethod, ReadStriping};
use crate::error::{ClientError, ErrorClass, Result};
use crate::node::ServerNode;
use crate::refresh::{RefreshHandle, TopologyFetcher, TopologyRefresher};
use crate::state::ClusterState;

/// Outcome of a single dispatched call after error classification
enum CallOutcome<T> {
    Success(T),
    Failure {
        error: ClientError,
        was_timeout: bool,
    },
}

/// Point-in-time executor statistics
#[derive(Debug, Clone)]
pub struct ExecutorStats {
    pub total_requests: u64,
    pub total_failures: u64,
    pub topology_refreshes: u64,
    pub leader: Option<String>,
    pub nodes: Vec<NodeHealth>,
}

/// Per-node health as seen by the failure counters
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub url: String,
    pub failures: u32,
}

/// Cluster-aware request executor
pub struct RequestExecutor {
    primary: Arc<ServerNode>,
    state: Arc<ClusterState>,
    refresher: Arc<TopologyRefresher>,
    fetcher: Arc<dyn TopologyFetcher>,
    conventions: Arc<Conventions>,
    striping: ReadStriping,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl RequestExecutor {
    /// Create an executor for the cluster reachable through `primary`.
    ///
    /// Nothing is contacted here; topology discovery starts lazily with the
    /// first request (or an explicit [`Self::request_topology_refresh`]).
    pub fn new(
        primary: ServerNode,
        fetcher: Arc<dyn TopologyFetcher>,
        store: Arc<dyn TopologyStore>,
        conventions: Conventions,
    ) -> Self {
        let conventions = Arc::new(conventions);
        let state = Arc::new(ClusterState::new());
        let refresher = Arc::new(TopologyRefresher::new(
            state.clone(),
            store,
            conventions.clone(),
        ));
        Self {
            primary: Arc::new(primary),
            state,
            refresher,
            fetcher,
            conventions,
            striping: ReadStriping::new(),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// The configured primary node
    pub fn primary(&self) -> &Arc<ServerNode> {
        &self.primary
    }

    /// The shared cluster view (node list, leader, failure counters)
    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    /// Current leader, if one is known
    pub fn leader(&self) -> Option<Arc<ServerNode>> {
        self.state.leader.get()
    }

    /// Snapshot of the known membership
    pub fn node_list(&self) -> Arc<Vec<Arc<ServerNode>>> {
        self.state.node_list()
    }

    /// The conventions this executor routes by
    pub fn conventions(&self) -> &Arc<Conventions> {
        &self.conventions
    }

    /// Return the read striping base, post-incrementing when `increment`
    pub fn read_striping_base(&self, increment: bool) -> i64 {
        self.striping.read_striping_base(increment)
    }

    /// Pin reads to the leader until the guard drops
    pub fn force_read_from_master(&self) -> ForceReadFromMaster<'_> {
        self.striping.force_read_from_master()
    }

    /// Kick off a topology refresh without waiting for it, joining an
    /// in-flight one when present
    pub fn request_topology_refresh(&self) -> RefreshHandle {
        self.refresher
            .request_refresh(self.primary.clone(), self.fetcher.clone(), true)
    }

    /// Executor statistics
    pub fn stats(&self) -> ExecutorStats {
        let nodes = self
            .state
            .node_list()
            .iter()
            .map(|n| NodeHealth {
                url: n.url.clone(),
                failures: self.state.failures.get(&n.url),
            })
            .collect();
        ExecutorStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            topology_refreshes: self.refresher.refreshes_started(),
            leader: self.state.leader.get().map(|n| n.url.clone()),
            nodes,
        }
    }

    /// Dispatch `operation` against the cluster.
    ///
    /// The operation is handed the target node and the per-call
    /// [`DispatchContext`] whose headers the transport must attach. It is
    /// invoked once per attempt; server-down and 417 failures are retried up
    /// to the configured budget, leader redirects are followed transparently,
    /// and under the with-failovers policies a missing leader degrades to a
    /// walk over the surviving nodes.
    pub async fn execute<T, F, Fut>(
        &self,
        method: HttpMethod,
        operation: F,
        token: &CancellationToken,
    ) -> Result<T>
    where
        F: Fn(Arc<ServerNode>, DispatchContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let behavior = self.conventions.failover_behavior();
        let mut retries_left = self.conventions.max_retries;
        let mut attempts = 0u32;
        let mut failover_header = false;

        loop {
            if token.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let mut node = self.state.leader.get();
            if node.is_none() {
                let _refresh = self.refresher.request_refresh(
                    self.primary.clone(),
                    self.fetcher.clone(),
                    failover_header,
                );
                let timeout = self.conventions.wait_for_leader_timeout;
                let leader_known = tokio::select! {
                    _ = token.cancelled() => return Err(ClientError::Cancelled),
                    known = self.state.leader.await_leader(timeout) => known,
                };
                if !leader_known && !behavior.tolerates_missing_leader() {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ClientError::NoStableLeader {
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                node = self.state.leader.get();
            }

            let nodes = self.state.node_list();
            let target = match route(
                node.as_ref(),
                &nodes,
                method,
                behavior,
                self.striping.base(),
                &self.state.failures,
            ) {
                Choice::Node(node) => node,
                Choice::Striped { node: striped, leader } => {
                    let ctx = DispatchContext::new(behavior.reads_from_all(), failover_header);
                    match self.try_call(striped.clone(), ctx, &operation, true).await? {
                        CallOutcome::Success(value) => return Ok(value),
                        CallOutcome::Failure { error, .. } => {
                            debug!(url = %striped.url, %error, "striped read failed; falling back to leader");
                            self.state.failures.increment(&striped.url);
                            leader
                        }
                    }
                }
                Choice::FailoverWalk => {
                    return self.failover_walk(&operation, token, behavior).await;
                }
                Choice::NoStableLeader => {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ClientError::NoStableLeader {
                        waited_ms: self.conventions.wait_for_leader_timeout.as_millis() as u64,
                    });
                }
            };

            let ctx = DispatchContext::new(behavior.reads_from_all(), failover_header);
            match self.try_call(target.clone(), ctx, &operation, false).await {
                Ok(CallOutcome::Success(value)) => return Ok(value),
                Ok(CallOutcome::Failure { error, was_timeout }) => {
                    attempts += 1;
                    warn!(url = %target.url, %error, was_timeout, "request attempt failed");

                    if !self.state.leader.compare_and_clear(Some(&target)) {
                        // Someone already rotated the leader out from under
                        // us; this attempt is free.
                        debug!("leader rotated during request; retrying");
                        continue;
                    }

                    self.state.failures.increment(&target.url);
                    if behavior.tolerates_missing_leader() {
                        failover_header = true;
                    }
                    if retries_left == 0 {
                        self.total_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(ClientError::ClusterUnreachable { attempts });
                    }
                    retries_left -= 1;
                }
                Err(error) => {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(error);
                }
            }
        }
    }

    /// Walk the surviving nodes in membership order, trying each eligible
    /// one with the failover header raised.
    async fn failover_walk<T, F, Fut>(
        &self,
        operation: &F,
        token: &CancellationToken,
        behavior: FailoverBehavior,
    ) -> Result<T>
    where
        F: Fn(Arc<ServerNode>, DispatchContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let nodes = self.state.node_list();
        info!(nodes = nodes.len(), "no leader known; walking surviving nodes");

        let total = nodes.len();
        let mut tried = 0u32;
        for (index, node) in nodes.iter().enumerate() {
            if token.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            if !self.state.failures.is_eligible(&node.url) {
                debug!(url = %node.url, "skipping unhealthy node");
                continue;
            }
            tried += 1;

            let ctx = DispatchContext::new(behavior.reads_from_all(), true);
            let avoid_throwing = index + 1 < total;
            match self.try_call(node.clone(), ctx, operation, avoid_throwing).await? {
                CallOutcome::Success(value) => return Ok(value),
                CallOutcome::Failure { error, .. } => {
                    warn!(url = %node.url, %error, "failover candidate failed");
                    self.state.failures.increment(&node.url);
                }
            }
        }

        self.total_failures.fetch_add(1, Ordering::Relaxed);
        Err(ClientError::ClusterUnreachable { attempts: tried })
    }

    /// Invoke the operation against `node` and classify the outcome.
    ///
    /// Leader redirects are followed inline: the redirect target is resolved
    /// against the known membership (falling back to a descriptor inheriting
    /// the original node's credentials), installed as the known leader, and
    /// the operation re-dispatched against it. With `avoid_throwing` every
    /// failure comes back as a structured outcome; otherwise non-retryable
    /// errors propagate.
    async fn try_call<T, F, Fut>(
        &self,
        node: Arc<ServerNode>,
        ctx: DispatchContext,
        operation: &F,
        avoid_throwing: bool,
    ) -> Result<CallOutcome<T>>
    where
        F: Fn(Arc<ServerNode>, DispatchContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut current = node;
        loop {
            let started = Instant::now();
            match operation(current.clone(), ctx.clone()).await {
                Ok(value) => {
                    self.state.failures.reset(&current.url);
                    debug!(
                        url = %current.url,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    return Ok(CallOutcome::Success(value));
                }
                Err(error) => match error.classification() {
                    ErrorClass::ServerDown { was_timeout } => {
                        return Ok(CallOutcome::Failure { error, was_timeout });
                    }
                    ErrorClass::TransientRetry => {
                        return Ok(CallOutcome::Failure {
                            error,
                            was_timeout: false,
                        });
                    }
                    ErrorClass::LeaderRedirect { location } => {
                        info!(from = %current.url, to = %location, "following leader redirect");
                        let next = self
                            .state
                            .find_node(&location)
                            .unwrap_or_else(|| Arc::new(current.redirected_to(&location)));
                        self.state.leader.set_known_leader(next.clone());
                        current = next;
                    }
                    ErrorClass::BadRedirect { location } => {
                        let error = ClientError::BadRedirect { location };
                        if avoid_throwing {
                            return Ok(CallOutcome::Failure {
                                error,
                                was_timeout: false,
                            });
                        }
                        return Err(error);
                    }
                    ErrorClass::Fatal => {
                        if avoid_throwing {
                            return Ok(CallOutcome::Failure {
                                error,
                                was_timeout: false,
                            });
                        }
                        return Err(error);
                    }
                },
            }
        }
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        self.refresher.shutdown();
    }
}
