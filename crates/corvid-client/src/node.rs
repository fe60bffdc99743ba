//! Cluster node descriptors and the topology document returned by servers.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::config::ClientConfiguration;

/// Opaque credential handle attached to every node descriptor.
///
/// The executor never inspects credentials; it only forwards them to the
/// operation and topology-fetch collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Per-node cluster hint carried by topology documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterMemberInfo {
    #[serde(default)]
    pub is_leader: bool,
}

impl ClusterMemberInfo {
    pub fn leader() -> Self {
        Self { is_leader: true }
    }

    pub fn follower() -> Self {
        Self { is_leader: false }
    }
}

/// An addressable cluster member.
///
/// Equality and hashing are by `url` only; two descriptors with the same URL
/// refer to the same server regardless of the hints attached to them. The
/// descriptor is immutable: per-request hints travel in
/// [`DispatchContext`](crate::dispatch::DispatchContext), never here.
#[derive(Debug, Clone)]
pub struct ServerNode {
    pub url: String,
    pub database: Option<String>,
    pub credentials: Credentials,
    pub cluster_info: Option<ClusterMemberInfo>,
}

impl ServerNode {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_url(url.into()),
            database: None,
            credentials: Credentials::default(),
            cluster_info: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        let database = database.into();
        self.url = format!("{}/databases/{}", root_url(&self.url), database);
        self.database = Some(database);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_cluster_info(mut self, cluster_info: ClusterMemberInfo) -> Self {
        self.cluster_info = Some(cluster_info);
        self
    }

    /// True iff the topology that produced this descriptor marked it leader
    pub fn is_leader(&self) -> bool {
        self.cluster_info.as_ref().is_some_and(|i| i.is_leader)
    }

    /// A descriptor for the server a redirect pointed at, inheriting this
    /// node's credentials and cluster hint.
    pub fn redirected_to(&self, url: &str) -> Self {
        Self {
            url: normalize_url(url.to_string()),
            database: self.database.clone(),
            credentials: self.credentials.clone(),
            cluster_info: self.cluster_info.clone(),
        }
    }
}

impl PartialEq for ServerNode {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for ServerNode {}

impl Hash for ServerNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

/// A replication target advertised in a topology document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationDestination {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_visible_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub can_be_failover: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_information: Option<ClusterMemberInfo>,
}

/// The document a node returns when asked for the cluster topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    /// Monotonic election term
    #[serde(default)]
    pub term: u64,
    /// Replication progress of the cluster at the responding node
    #[serde(default)]
    pub cluster_commit_index: u64,
    /// The responding node's view of its own role
    #[serde(default)]
    pub cluster_information: ClusterMemberInfo,
    #[serde(default)]
    pub destinations: Vec<ReplicationDestination>,
    /// Server-pushed override of client failover behavior
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_configuration: Option<ClientConfiguration>,
}

impl Topology {
    /// Freshness key: documents are compared lexicographically by
    /// `(term, commit index + 1 if the responder is leader)`, descending.
    pub fn sort_key(&self) -> (u64, u64) {
        let leader_bonus = u64::from(self.cluster_information.is_leader);
        (self.term, self.cluster_commit_index + leader_bonus)
    }
}

/// A statically configured failover target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverServer {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl FailoverServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
            api_key: None,
        }
    }

    pub(crate) fn to_node(&self) -> ServerNode {
        let mut node = ServerNode::new(self.url.as_str()).with_credentials(Credentials {
            api_key: self.api_key.clone(),
        });
        if let Some(database) = &self.database {
            node = node.with_database(database.clone());
        }
        node
    }
}

/// Turn advertised replication destinations into node descriptors.
///
/// A destination is addressed by `client_visible_url` when present, else by
/// `url`. Destinations without a URL or with `can_be_failover == false` are
/// dropped. When the destination names a database, the address is composed
/// from the root URL of the server and the database name.
pub fn convert_destinations(destinations: &[ReplicationDestination]) -> Vec<Arc<ServerNode>> {
    destinations
        .iter()
        .filter_map(|destination| {
            let url = destination
                .client_visible_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .unwrap_or(destination.url.as_str());
            if url.is_empty() || !destination.can_be_failover {
                return None;
            }
            let mut node = ServerNode::new(url).with_credentials(Credentials {
                api_key: destination.api_key.clone(),
            });
            if let Some(database) = &destination.database {
                node = node.with_database(database.clone());
            }
            node.cluster_info = destination.cluster_information.clone();
            Some(Arc::new(node))
        })
        .collect()
}

/// Strip a `/databases/{name}` suffix, yielding the server root URL
pub fn root_url(url: &str) -> &str {
    match url.find("/databases/") {
        Some(idx) => &url[..idx],
        None => url,
    }
}

fn normalize_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
