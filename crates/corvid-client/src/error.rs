//! Client error types and the classification used by the request executor.

use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the cluster-aware executor
#[derive(Debug, Error)]
pub enum ClientError {
    // ==================== Cluster State Errors ====================
    #[error("cluster is not in a stable state: no leader elected after {waited_ms} ms")]
    NoStableLeader { waited_ms: u64 },

    #[error("cluster is not reachable: out of retries after {attempts} attempts")]
    ClusterUnreachable { attempts: u32 },

    #[error("redirect without leader hint, maybe there is a proxy in the middle (location: {location:?})")]
    BadRedirect { location: Option<String> },

    #[error("operation cancelled")]
    Cancelled,

    // ==================== Transport Errors ====================
    // Produced by the injected operation / topology fetch collaborators and
    // classified here. The executor never builds these itself.
    #[error("server down: {url}: {reason}")]
    ServerDown { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("error response {status} from {url}")]
    Response {
        url: String,
        status: u16,
        /// True iff the response carried `Raven-Leader-Redirect: true`.
        leader_redirect: bool,
        /// Value of the `Location` header, when present.
        location: Option<String>,
    },

    // ==================== Passthrough Errors ====================
    #[error("operation failed: {0}")]
    Operation(String),
}

/// How the executor reacts to a failed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection refused, DNS failure, socket or read timeout. Retryable.
    ServerDown { was_timeout: bool },
    /// 302 with a valid leader hint: follow the redirect.
    LeaderRedirect { location: String },
    /// 302 without the leader hint header. Fatal.
    BadRedirect { location: Option<String> },
    /// 417 Expectation Failed. Retryable.
    TransientRetry,
    /// Everything else propagates to the caller.
    Fatal,
}

impl ClientError {
    /// Classify this error for the retry/failover machinery.
    ///
    /// A redirect only counts as a leader hint when the header value is
    /// exactly "true" and a `Location` was provided; anything else is a
    /// `BadRedirect`.
    pub fn classification(&self) -> ErrorClass {
        match self {
            ClientError::ServerDown { .. } => ErrorClass::ServerDown { was_timeout: false },
            ClientError::Timeout { .. } => ErrorClass::ServerDown { was_timeout: true },
            ClientError::Response {
                status: 302,
                leader_redirect: true,
                location: Some(location),
                ..
            } => ErrorClass::LeaderRedirect {
                location: location.clone(),
            },
            ClientError::Response {
                status: 302,
                location,
                ..
            } => ErrorClass::BadRedirect {
                location: location.clone(),
            },
            ClientError::Response { status: 417, .. } => ErrorClass::TransientRetry,
            _ => ErrorClass::Fatal,
        }
    }

    /// Check if this error indicates the target server is unreachable
    pub fn is_server_down(&self) -> bool {
        matches!(
            self.classification(),
            ErrorClass::ServerDown { .. }
        )
    }

    /// Check if this error was caused by a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}
