//! credpool — heterogeneous connection pool with per-call credentials.
//!
//! A [`HeterogeneousPool`] keeps sessions to one database endpoint that may
//! each be authenticated as a different user. Callers choose the identity per
//! acquisition through a [`CallContext`], including proxy logins where the
//! session authenticates as one user and runs as another.
//!
//! - **session**: `RawSession` / `SessionFactory` driver contract and `SessionError`
//! - **pool**: `HeterogeneousPool`, `PooledSession`, `PoolStats`
//! - **auth**: identity resolution and open-error classification
//! - **sweeper**: background idle sweeper

mod auth;
pub mod pool;
pub mod session;
pub mod sweeper;

pub use credpool_core::{
    CallContext, CancelHandle, ConnectionDescriptor, ConnectionIdentity, PoolError, PoolParams,
    PoolResult, ReuseKey, SerializeMode,
};
pub use pool::{HeterogeneousPool, PoolStats, PooledSession};
pub use session::{RawSession, SessionError, SessionFactory};
pub use sweeper::IdleSweeper;
