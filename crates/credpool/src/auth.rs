//! Identity resolution and classification of authentication failures.

use credpool_core::{CallContext, ConnectionDescriptor, ConnectionIdentity, PoolError, PoolResult};

use crate::session::SessionError;

/// Pick the identity an acquisition authenticates as.
///
/// A heterogeneous pool takes the context's credentials when present and
/// falls back to the descriptor's identity otherwise. A homogeneous pool
/// always uses the descriptor's identity. An empty password supplied for the
/// descriptor's own username inherits the descriptor's password.
pub(crate) fn resolve_identity(
    descriptor: &ConnectionDescriptor,
    ctx: &CallContext,
) -> PoolResult<ConnectionIdentity> {
    let default = &descriptor.identity;

    let identity = match ctx.credentials() {
        Some(requested) if !descriptor.heterogeneous => {
            tracing::debug!(
                requested = %requested.redacted(),
                user = %default.redacted(),
                "homogeneous pool ignores call credentials"
            );
            default.clone()
        }
        Some(requested) => {
            let mut identity = requested.clone();
            if identity.password().is_empty()
                && identity.username() == default.username()
                && !default.password().is_empty()
            {
                identity = identity.with_password(default.password());
            }
            if identity.connection_class().is_none() {
                if let Some(class) = default.connection_class() {
                    identity = identity.with_connection_class(class);
                }
            }
            identity
        }
        None => default.clone(),
    };

    if identity.username().is_empty() {
        return Err(PoolError::MissingCredentials);
    }
    Ok(identity)
}

/// Translate a driver failure during `open` into the pool's taxonomy.
///
/// Grant and target errors are only meaningful for proxy logins; a direct
/// login reporting them is treated as a plain authentication failure.
pub(crate) fn classify_open_error(identity: &ConnectionIdentity, err: SessionError) -> PoolError {
    let reason = err.to_string();
    match (identity.proxy_target(), err) {
        (_, SessionError::InvalidCredentials(_)) => PoolError::AuthenticationFailed {
            identity: identity.redacted(),
            reason,
        },
        (Some(target), SessionError::ProxyNotAuthorized(_)) => PoolError::ProxyGrantDenied {
            username: identity.username().to_string(),
            proxy_target: target.to_string(),
            reason,
        },
        (Some(target), SessionError::Server { code: 1031, .. }) => PoolError::ProxyGrantDenied {
            username: identity.username().to_string(),
            proxy_target: target.to_string(),
            reason,
        },
        (Some(target), SessionError::ProxyTargetUnknown(_)) => PoolError::ProxyTargetNotFound {
            username: identity.username().to_string(),
            proxy_target: target.to_string(),
            reason,
        },
        (None, SessionError::ProxyNotAuthorized(_) | SessionError::ProxyTargetUnknown(_)) => {
            PoolError::AuthenticationFailed {
                identity: identity.redacted(),
                reason,
            }
        }
        _ => PoolError::Session {
            identity: identity.redacted(),
            reason,
        },
    }
}

/// Translate a driver failure on an established session.
pub(crate) fn session_error(identity: &ConnectionIdentity, err: &SessionError) -> PoolError {
    PoolError::Session {
        identity: identity.redacted(),
        reason: err.to_string(),
    }
}
