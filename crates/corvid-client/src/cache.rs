//! Durable topology snapshots keyed by the primary server.
//!
//! The cache lets a fresh client route requests before any node answered a
//! topology probe. Persistence is injected: the core only requires
//! best-effort, idempotent load/save semantics. Implementations swallow and
//! log their own I/O failures; a failed load is simply a miss.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::node::{ClusterMemberInfo, Credentials, ServerNode};

/// Stable cache key derived from the primary node's URL
pub fn server_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim_end_matches('/').to_ascii_lowercase().as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// The persisted shape of a known node.
///
/// Credentials are never written to disk; they are re-attached from the
/// primary node's credentials when a snapshot is restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedNode {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub is_leader: bool,
}

impl CachedNode {
    pub fn from_node(node: &ServerNode) -> Self {
        Self {
            url: node.url.clone(),
            database: node.database.clone(),
            is_leader: node.is_leader(),
        }
    }

    pub fn to_node(&self, credentials: &Credentials) -> ServerNode {
        ServerNode {
            url: self.url.clone(),
            database: self.database.clone(),
            credentials: credentials.clone(),
            cluster_info: Some(ClusterMemberInfo {
                is_leader: self.is_leader,
            }),
        }
    }
}

/// Port for persisting topology snapshots
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Load the snapshot for `server_hash`, or `None` when absent or unreadable
    async fn load(&self, server_hash: &str) -> Option<Vec<CachedNode>>;

    /// Persist a snapshot. Best-effort: failures must not propagate.
    async fn save(&self, server_hash: &str, nodes: &[CachedNode]);
}

/// In-memory store, used in tests and as the default when no durable
/// persistence is wired in
#[derive(Debug, Default)]
pub struct MemoryTopologyStore {
    snapshots: DashMap<String, Vec<CachedNode>>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn load(&self, server_hash: &str) -> Option<Vec<CachedNode>> {
        self.snapshots.get(server_hash).map(|entry| entry.value().clone())
    }

    async fn save(&self, server_hash: &str, nodes: &[CachedNode]) {
        self.snapshots.insert(server_hash.to_string(), nodes.to_vec());
    }
}

/// Store that never remembers anything
#[derive(Debug, Default)]
pub struct NoopTopologyStore;

#[async_trait]
impl TopologyStore for NoopTopologyStore {
    async fn load(&self, _server_hash: &str) -> Option<Vec<CachedNode>> {
        None
    }

    async fn save(&self, _server_hash: &str, _nodes: &[CachedNode]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_hash_is_stable_and_case_insensitive() {
        let a = server_hash("http://a:8080");
        assert_eq!(a, server_hash("http://a:8080"));
        assert_eq!(a, server_hash("HTTP://A:8080"));
        assert_eq!(a, server_hash("http://a:8080/"));
        assert_ne!(a, server_hash("http://b:8080"));
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_leader_bits() {
        let store = MemoryTopologyStore::new();
        let nodes = vec![
            CachedNode {
                url: "http://a:8080".into(),
                database: Some("orders".into()),
                is_leader: true,
            },
            CachedNode {
                url: "http://b:8080".into(),
                database: None,
                is_leader: false,
            },
        ];

        let hash = server_hash("http://a:8080");
        store.save(&hash, &nodes).await;

        let restored = store.load(&hash).await.unwrap();
        assert_eq!(restored, nodes);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_none() {
        let store = MemoryTopologyStore::new();
        assert!(store.load("deadbeef").await.is_none());
        assert!(NoopTopologyStore.load("deadbeef").await.is_none());
    }

    #[test]
    fn test_cached_node_roundtrip_reattaches_credentials() {
        let node = ServerNode::new("http://a:8080")
            .with_database("orders")
            .with_cluster_info(ClusterMemberInfo::leader());

        let cached = CachedNode::from_node(&node);
        assert!(cached.is_leader);

        let credentials = Credentials {
            api_key: Some("key".into()),
        };
        let restored = cached.to_node(&credentials);
        assert_eq!(restored.url, node.url);
        assert_eq!(restored.database, node.database);
        assert!(restored.is_leader());
        assert_eq!(restored.credentials, credentials);
    }
}
