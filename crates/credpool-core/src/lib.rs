//! credpool-core — value types shared by the pool and its tooling.
//!
//! - **identity**: `ConnectionIdentity` and the `ReuseKey` idle sessions are matched on
//! - **descriptor**: connection descriptor codec with redacted and full output modes
//! - **context**: `CallContext`, the per-call carrier for credentials, deadlines and cancellation
//! - **config**: `credpool.toml` parsing
//! - **error**: `PoolError` taxonomy

pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod identity;

pub use config::{PoolFileConfig, ResolvedConfig};
pub use context::{CallContext, CancelHandle};
pub use descriptor::{ConnectionDescriptor, PoolParams, SerializeMode};
pub use error::{PoolError, PoolResult};
pub use identity::{ConnectionIdentity, ReuseKey};
