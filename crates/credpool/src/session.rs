//! Driver contract consumed by the pool.
//!
//! The pool never talks to the network itself. A driver supplies a
//! [`SessionFactory`] that opens authenticated sessions and a [`RawSession`]
//! type the pool pings, hands out, and closes. Both traits are async and
//! used through generics, so a driver is free to keep non-`Sync` state inside
//! its session type.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use credpool_core::ConnectionIdentity;
use thiserror::Error;

/// Failures reported by a driver.
///
/// Authentication outcomes get their own variants so the pool can tell a
/// rejected password from a missing proxy grant. Everything the driver
/// cannot classify is carried as [`SessionError::Server`] with its code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("proxy not authorized: {0}")]
    ProxyNotAuthorized(String),

    #[error("proxy target unknown: {0}")]
    ProxyTargetUnknown(String),

    /// The session can no longer be used; the pool discards it.
    #[error("session broken: {0}")]
    Broken(String),

    #[error("ORA-{code:05}: {message}")]
    Server { code: u32, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Map an Oracle-style server error code onto a variant.
    ///
    /// Codes whose meaning depends on what was being attempted (1031 is
    /// "insufficient privileges", which a proxy open reports for a missing
    /// grant) stay as [`SessionError::Server`]; the pool classifies them with
    /// the identity in hand.
    pub fn from_server_code(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        let text = format!("ORA-{code:05}: {message}");
        match code {
            1017 | 28000 | 28001 => SessionError::InvalidCredentials(text),
            28150 => SessionError::ProxyNotAuthorized(text),
            1918 => SessionError::ProxyTargetUnknown(text),
            28 | 3113 | 3114 | 3135 => SessionError::Broken(text),
            _ => SessionError::Server { code, message },
        }
    }

    /// The server code, when one is known.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            SessionError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, SessionError::Broken(_))
    }
}

/// One authenticated server session.
pub trait RawSession: Send + fmt::Debug + 'static {
    /// Result of a successful [`RawSession::execute`].
    type Output: Send;

    /// Run a statement on the session.
    fn execute(
        &mut self,
        statement: &str,
    ) -> impl Future<Output = Result<Self::Output, SessionError>> + Send;

    /// Round-trip to the server to prove the session is alive.
    fn ping(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Close the underlying session. Called at most once.
    fn close(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// The server-side user statements run as.
    fn effective_user(&self) -> &str;
}

/// Opens sessions for a given identity. Injected into the pool.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: RawSession;

    /// Authenticate `identity` against `connect_string`.
    ///
    /// With a proxy target the driver logs in as the identity's username and
    /// then switches to the target; the server decides whether that is
    /// allowed.
    fn open(
        &self,
        connect_string: &str,
        identity: &ConnectionIdentity,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send;
}

impl<F: SessionFactory> SessionFactory for Arc<F> {
    type Session = F::Session;

    fn open(
        &self,
        connect_string: &str,
        identity: &ConnectionIdentity,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send {
        (**self).open(connect_string, identity)
    }
}
