//! # corvid-client
//!
//! Cluster-aware async client executor for Corvid, the replicated document
//! database. The executor hides a multi-node cluster behind a single
//! request-issuing interface.
//!
//! ## Features
//!
//! - **Leader discovery**: Probes the cluster, compares topology documents by
//!   election term and commit index, and tracks the current leader
//! - **Failover policies**: Leader-only, striped reads, and surviving-node
//!   failover, switchable at runtime by server-pushed configuration
//! - **Automatic retries**: Server-down and 417 responses retry on the
//!   elected leader; leader churn during a request retries for free
//! - **Redirect handling**: A 302 carrying `Raven-Leader-Redirect: true`
//!   installs the new leader and re-dispatches transparently
//! - **Read striping**: Round-robin reads across the membership with a
//!   scoped force-to-leader override
//! - **Durable topology cache**: Startup routes from the last persisted
//!   snapshot even when no node is reachable
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corvid_client::{
//!     Conventions, FailoverBehavior, HttpMethod, MemoryTopologyStore,
//!     RequestExecutor, ServerNode,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(transport: Arc<MyTransport>) -> corvid_client::Result<()> {
//! let conventions = Conventions::builder()
//!     .failover_behavior(FailoverBehavior::ReadFromAllWriteToLeaderWithFailovers)
//!     .build();
//!
//! let executor = RequestExecutor::new(
//!     ServerNode::new("http://db1:8080").with_database("orders"),
//!     transport.clone(),            // implements TopologyFetcher
//!     Arc::new(MemoryTopologyStore::new()),
//!     conventions,
//! );
//!
//! let token = CancellationToken::new();
//! let doc = executor
//!     .execute(
//!         HttpMethod::Get,
//!         |node, ctx| transport.get_document(node, ctx, "orders/1"),
//!         &token,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Collaborators
//!
//! The executor is transport-agnostic. Callers inject:
//!
//! - the operation closure, receiving the target [`ServerNode`] and the
//!   per-call [`DispatchContext`] whose headers must go on the wire;
//! - a [`TopologyFetcher`] that asks a node for the cluster topology;
//! - a [`TopologyStore`] persisting topology snapshots between runs.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod failure;
pub mod leader;
pub mod node;
pub mod refresh;
pub mod state;

pub use cache::{server_hash, CachedNode, MemoryTopologyStore, NoopTopologyStore, TopologyStore};
pub use config::{ClientConfiguration, Conventions, ConventionsBuilder, FailoverBehavior};
pub use dispatch::{
    DispatchContext, ForceReadFromMaster, HttpMethod, ReadStriping, CLUSTER_AWARE_HEADER,
    FAILOVER_BEHAVIOR_HEADER, LEADER_REDIRECT_HEADER, READ_BEHAVIOR_HEADER,
};
pub use error::{ClientError, ErrorClass, Result};
pub use executor::{ExecutorStats, NodeHealth, RequestExecutor};
pub use failure::FailureCounters;
pub use leader::LeaderCell;
pub use node::{
    convert_destinations, root_url, ClusterMemberInfo, Credentials, FailoverServer,
    ReplicationDestination, ServerNode, Topology,
};
pub use refresh::{RefreshHandle, TopologyFetcher, TopologyRefresher};
pub use state::ClusterState;
