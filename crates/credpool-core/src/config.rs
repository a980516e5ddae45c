//! credpool.toml configuration parser.
//!
//! The file names a descriptor and optionally overrides its pool knobs. The
//! password can be kept out of the file and read from an environment
//! variable instead.
//!
//! ```toml
//! descriptor = "user=app connectString=db:1521/svc heterogeneous=1"
//! password_env = "CREDPOOL_PASSWORD"
//! sweep_interval = "30s"
//!
//! [pool]
//! max_idle = 0
//! max_open = 8
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ConnectionDescriptor, SerializeMode, parse_duration};
use crate::identity::ConnectionIdentity;
use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFileConfig {
    pub descriptor: String,
    pub password_env: Option<String>,
    pub sweep_interval: Option<String>,
    pub pool: Option<PoolOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolOverrides {
    pub max_idle: Option<usize>,
    pub max_open: Option<usize>,
    pub idle_timeout: Option<String>,
    pub wait_timeout: Option<String>,
    /// `"off"` disables pings.
    pub ping_interval: Option<String>,
}

/// A configuration file with the descriptor parsed and overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub descriptor: ConnectionDescriptor,
    /// Period of the background idle sweeper, if one should run.
    pub sweep_interval: Option<Duration>,
}

impl PoolFileConfig {
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> PoolResult<String> {
        toml::to_string_pretty(self).map_err(|e| PoolError::Config(e.to_string()))
    }

    /// Scaffold a minimal heterogeneous-pool configuration.
    pub fn scaffold(connect_string: &str, user: &str) -> Self {
        let identity = ConnectionIdentity::new(user, "");
        let descriptor = ConnectionDescriptor::new(connect_string, identity).with_heterogeneous(true);
        PoolFileConfig {
            descriptor: descriptor.serialize(SerializeMode::Redacted),
            password_env: Some("CREDPOOL_PASSWORD".to_string()),
            sweep_interval: Some("30s".to_string()),
            pool: Some(PoolOverrides {
                max_idle: Some(2),
                max_open: Some(10),
                ..PoolOverrides::default()
            }),
        }
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> PoolResult<ResolvedConfig> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve using `env` to look up `password_env`.
    pub fn resolve_with(&self, env: impl Fn(&str) -> Option<String>) -> PoolResult<ResolvedConfig> {
        let mut descriptor = ConnectionDescriptor::parse(&self.descriptor)?;

        if let Some(var) = &self.password_env {
            if descriptor.identity.password().is_empty() {
                let password = env(var).ok_or_else(|| {
                    PoolError::Config(format!("password_env `{var}` is not set"))
                })?;
                descriptor.identity = descriptor.identity.clone().with_password(password);
            } else {
                tracing::warn!(
                    password_env = %var,
                    "descriptor already carries a password; ignoring password_env"
                );
            }
        }

        if let Some(overrides) = &self.pool {
            let pool = &mut descriptor.pool;
            if let Some(n) = overrides.max_idle {
                pool.max_idle = n;
            }
            if let Some(n) = overrides.max_open {
                pool.max_open = n;
            }
            if let Some(s) = &overrides.idle_timeout {
                pool.idle_timeout = config_duration("pool.idle_timeout", s)?;
            }
            if let Some(s) = &overrides.wait_timeout {
                pool.wait_timeout = config_duration("pool.wait_timeout", s)?;
            }
            if let Some(s) = &overrides.ping_interval {
                pool.ping_interval = match s.as_str() {
                    "off" => None,
                    other => Some(config_duration("pool.ping_interval", other)?),
                };
            }
            descriptor.validate()?;
        }

        let sweep_interval = self
            .sweep_interval
            .as_deref()
            .map(|s| config_duration("sweep_interval", s))
            .transpose()?;
        if sweep_interval == Some(Duration::ZERO) {
            return Err(PoolError::Config(
                "`sweep_interval` of zero; omit it to disable the sweeper".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            descriptor,
            sweep_interval,
        })
    }
}

fn config_duration(field: &str, value: &str) -> PoolResult<Duration> {
    parse_duration(value)
        .ok_or_else(|| PoolError::Config(format!("`{field}` expects a duration like 30s, got `{value}`")))
}
