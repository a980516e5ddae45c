//! Error types shared by the descriptor codec, call context and pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool and codec operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by descriptor parsing, context handling and acquisition.
///
/// Identities are rendered as `user` or `user[proxy]`; passwords never
/// appear in any variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("malformed connection descriptor: {reason}")]
    MalformedDescriptor { reason: String },

    #[error("authentication failed for {identity}: {reason}")]
    AuthenticationFailed { identity: String, reason: String },

    #[error("{username} is not allowed to connect through to {proxy_target}: {reason}")]
    ProxyGrantDenied {
        username: String,
        proxy_target: String,
        reason: String,
    },

    #[error("proxy target {proxy_target} requested by {username} does not exist: {reason}")]
    ProxyTargetNotFound {
        username: String,
        proxy_target: String,
        reason: String,
    },

    #[error("no username supplied by the call context or the pool descriptor")]
    MissingCredentials,

    #[error("connection pool at capacity ({max_open} open), waited {waited:?}")]
    PoolAtCapacity { max_open: usize, waited: Duration },

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("context canceled")]
    Canceled,

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("session for {identity} is unhealthy and was discarded")]
    SessionUnhealthy { identity: String },

    #[error("session error for {identity}: {reason}")]
    Session { identity: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        PoolError::MalformedDescriptor {
            reason: reason.into(),
        }
    }

    /// Whether the caller may reasonably retry the same call unchanged.
    ///
    /// Authentication and grant failures are never retriable: the same
    /// credentials will be rejected again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolAtCapacity { .. } | PoolError::DeadlineExceeded | PoolError::Canceled
        )
    }

    /// Whether this error was raised by the server-side login or proxy check.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            PoolError::AuthenticationFailed { .. }
                | PoolError::ProxyGrantDenied { .. }
                | PoolError::ProxyTargetNotFound { .. }
                | PoolError::MissingCredentials
        )
    }
}
