//! Connection descriptor codec.
//!
//! Descriptors are logfmt-style `key=value` pairs separated by whitespace.
//! Values may be double-quoted; inside quotes `\"` and `\\` are the only
//! escapes.
//!
//! ```text
//! user="scott" password="tiger" connectString="db.example.com:1521/orclpdb1"
//! heterogeneous=1 maxIdle=2 maxOpen=10 idleTimeout=5m waitTimeout=30s
//! ```
//!
//! A proxy login can be written either as `proxyUser="hr"` or inline as
//! `user="scott[hr]"`.
//!
//! Serialization has two named modes: [`SerializeMode::Redacted`] omits the
//! password and is what `Display` produces (safe for logs), and
//! [`SerializeMode::WithPassword`] produces text suitable for opening a pool.
//! `parse(serialize(d, WithPassword)) == d` holds for every descriptor that
//! passes [`ConnectionDescriptor::validate`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PoolError, PoolResult};
use crate::identity::ConnectionIdentity;

/// Pool sizing and timing knobs carried by a descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolParams {
    /// Maximum idle sessions kept across all identities (default: 2).
    /// Zero closes every session on release.
    pub max_idle: usize,
    /// Maximum open sessions, idle plus in use (default: 10). Zero means unlimited.
    pub max_open: usize,
    /// Idle sessions unused for longer than this are closed (default: 300s).
    /// Zero disables the timeout.
    pub idle_timeout: Duration,
    /// Longest an acquisition waits for capacity (default: 5s).
    pub wait_timeout: Duration,
    /// Idle sessions unused for longer than this are pinged before reuse
    /// (default: 30s). `None` disables the check.
    pub ping_interval: Option<Duration>,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            max_idle: 2,
            max_open: 10,
            idle_timeout: Duration::from_secs(300),
            wait_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Output modes for [`ConnectionDescriptor::serialize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerializeMode {
    /// Password omitted. Use for logs and diagnostics.
    Redacted,
    /// Password included. Use only to hand the descriptor to a pool.
    WithPassword,
}

/// Parsed form of a connection string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Host/service locator handed to the driver, e.g. `db:1521/svc`.
    pub connect_string: String,
    /// Default identity. For a heterogeneous pool this is only a fallback.
    pub identity: ConnectionIdentity,
    /// Whether acquisitions may override the identity.
    pub heterogeneous: bool,
    pub pool: PoolParams,
}

impl ConnectionDescriptor {
    pub fn new(connect_string: impl Into<String>, identity: ConnectionIdentity) -> Self {
        Self {
            connect_string: connect_string.into(),
            identity,
            heterogeneous: false,
            pool: PoolParams::default(),
        }
    }

    /// Builder method: allow per-acquisition identities.
    pub fn with_heterogeneous(self, heterogeneous: bool) -> Self {
        Self {
            heterogeneous,
            ..self
        }
    }

    /// Builder method: set pool parameters.
    pub fn with_pool_params(self, pool: PoolParams) -> Self {
        Self { pool, ..self }
    }

    /// Parse a descriptor from its text form.
    pub fn parse(text: &str) -> PoolResult<Self> {
        let mut connect_string = None;
        let mut user: Option<String> = None;
        let mut password = None;
        let mut proxy_user: Option<String> = None;
        let mut connection_class = None;
        let mut heterogeneous = None;
        let mut pool = PoolParams::default();
        let mut seen: Vec<&'static str> = Vec::new();

        for (raw_key, value) in tokenize(text)? {
            let key = canonical_key(&raw_key)
                .ok_or_else(|| PoolError::malformed(format!("unknown key `{raw_key}`")))?;
            if seen.contains(&key) {
                return Err(PoolError::malformed(format!("duplicate key `{key}`")));
            }
            seen.push(key);

            match key {
                "user" => user = Some(value),
                "password" => password = Some(value),
                "connectString" => connect_string = Some(value),
                "proxyUser" => proxy_user = Some(value),
                "connectionClass" => connection_class = Some(value),
                "heterogeneous" => heterogeneous = Some(parse_bool(key, &value)?),
                "maxIdle" => pool.max_idle = parse_count(key, &value)?,
                "maxOpen" => pool.max_open = parse_count(key, &value)?,
                "idleTimeout" => pool.idle_timeout = parse_duration_value(key, &value)?,
                "waitTimeout" => pool.wait_timeout = parse_duration_value(key, &value)?,
                "pingInterval" => {
                    pool.ping_interval = match value.as_str() {
                        "off" | "0" => None,
                        other => Some(parse_duration_value(key, other)?),
                    }
                }
                _ => unreachable!("canonical_key returned an unhandled key"),
            }
        }

        let (username, inline_proxy) = split_inline_proxy(user.unwrap_or_default())?;
        let proxy_target = match (inline_proxy, proxy_user) {
            (Some(inline), Some(explicit)) if inline != explicit => {
                return Err(PoolError::malformed(format!(
                    "user names proxy target `{inline}` but proxyUser is `{explicit}`"
                )));
            }
            (inline, explicit) => inline.or(explicit),
        };

        let mut identity = ConnectionIdentity::new(username, password.unwrap_or_default());
        if let Some(target) = proxy_target {
            identity = identity.with_proxy_target(target);
        }
        if let Some(class) = connection_class {
            identity = identity.with_connection_class(class);
        }

        let descriptor = ConnectionDescriptor {
            connect_string: connect_string
                .ok_or_else(|| PoolError::malformed("missing connectString"))?,
            identity,
            heterogeneous: heterogeneous.unwrap_or(false),
            pool,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the invariants every usable descriptor satisfies.
    pub fn validate(&self) -> PoolResult<()> {
        if self.connect_string.trim().is_empty() {
            return Err(PoolError::malformed("missing connectString"));
        }
        let username = self.identity.username();
        if !self.heterogeneous && username.is_empty() {
            return Err(PoolError::malformed(
                "a homogeneous pool needs a user",
            ));
        }
        if username.contains(['[', ']']) {
            return Err(PoolError::malformed(format!(
                "user `{username}` contains proxy brackets"
            )));
        }
        if self.pool.max_open > 0 && self.pool.max_idle > self.pool.max_open {
            return Err(PoolError::malformed(format!(
                "maxIdle ({}) exceeds maxOpen ({})",
                self.pool.max_idle, self.pool.max_open
            )));
        }
        if self.pool.ping_interval == Some(Duration::ZERO) {
            return Err(PoolError::malformed(
                "pingInterval of zero; use `off` to disable pings",
            ));
        }
        Ok(())
    }

    /// Render the descriptor as text.
    pub fn serialize(&self, mode: SerializeMode) -> String {
        let mut parts = vec![format!("user={}", quote(self.identity.username()))];
        if mode == SerializeMode::WithPassword && !self.identity.password().is_empty() {
            parts.push(format!("password={}", quote(self.identity.password())));
        }
        parts.push(format!("connectString={}", quote(&self.connect_string)));
        if let Some(target) = self.identity.proxy_target() {
            parts.push(format!("proxyUser={}", quote(target)));
        }
        if let Some(class) = self.identity.connection_class() {
            parts.push(format!("connectionClass={}", quote(class)));
        }
        parts.push(format!("heterogeneous={}", u8::from(self.heterogeneous)));
        parts.push(format!("maxIdle={}", self.pool.max_idle));
        parts.push(format!("maxOpen={}", self.pool.max_open));
        parts.push(format!("idleTimeout={}", format_duration(self.pool.idle_timeout)));
        parts.push(format!("waitTimeout={}", format_duration(self.pool.wait_timeout)));
        parts.push(format!(
            "pingInterval={}",
            self.pool
                .ping_interval
                .map(format_duration)
                .unwrap_or_else(|| "off".to_string())
        ));
        parts.join(" ")
    }

    /// Shorthand for `serialize(SerializeMode::Redacted)`.
    pub fn to_string_redacted(&self) -> String {
        self.serialize(SerializeMode::Redacted)
    }

    /// Shorthand for `serialize(SerializeMode::WithPassword)`.
    pub fn to_string_with_password(&self) -> String {
        self.serialize(SerializeMode::WithPassword)
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_redacted())
    }
}

// ── Tokenizer ────────────────────────────────────────────────────────

fn tokenize(text: &str) -> PoolResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = text.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        let Some(&(start, _)) = chars.peek() else {
            break;
        };

        let mut key = String::new();
        loop {
            match chars.next() {
                Some((_, '=')) => break,
                Some((_, c)) if c.is_ascii_alphanumeric() || c == '_' || c == '-' => key.push(c),
                _ => {
                    return Err(PoolError::malformed(format!(
                        "expected key=value at offset {start}"
                    )));
                }
            }
        }
        if key.is_empty() {
            return Err(PoolError::malformed(format!("empty key at offset {start}")));
        }

        let mut value = String::new();
        if chars.next_if(|(_, c)| *c == '"').is_some() {
            loop {
                match chars.next() {
                    Some((_, '"')) => break,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, c @ ('"' | '\\'))) => value.push(c),
                        Some((i, c)) => {
                            return Err(PoolError::malformed(format!(
                                "unsupported escape `\\{c}` at offset {i}"
                            )));
                        }
                        None => {
                            return Err(PoolError::malformed(format!(
                                "unterminated quote in value of `{key}`"
                            )));
                        }
                    },
                    Some((_, c)) => value.push(c),
                    None => {
                        return Err(PoolError::malformed(format!(
                            "unterminated quote in value of `{key}`"
                        )));
                    }
                }
            }
            if chars.next_if(|(_, c)| !c.is_whitespace()).is_some() {
                return Err(PoolError::malformed(format!(
                    "missing whitespace after quoted value of `{key}`"
                )));
            }
        } else {
            while let Some((_, c)) = chars.next_if(|(_, c)| !c.is_whitespace()) {
                if c == '"' {
                    return Err(PoolError::malformed(format!(
                        "stray quote in value of `{key}`"
                    )));
                }
                value.push(c);
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

fn canonical_key(key: &str) -> Option<&'static str> {
    let key = match key.to_ascii_lowercase().as_str() {
        "user" | "username" => "user",
        "password" => "password",
        "connectstring" | "connect_string" | "dsn" => "connectString",
        "heterogeneous" | "heterogeneouspool" => "heterogeneous",
        "proxyuser" | "proxy_user" => "proxyUser",
        "connectionclass" | "connection_class" => "connectionClass",
        "maxidle" | "max_idle" => "maxIdle",
        "maxopen" | "max_open" => "maxOpen",
        "idletimeout" | "idle_timeout" => "idleTimeout",
        "waittimeout" | "wait_timeout" => "waitTimeout",
        "pinginterval" | "ping_interval" => "pingInterval",
        _ => return None,
    };
    Some(key)
}

/// `scott[hr]` → (`scott`, Some(`hr`)).
fn split_inline_proxy(user: String) -> PoolResult<(String, Option<String>)> {
    let Some(open) = user.find('[') else {
        return Ok((user, None));
    };
    let Some(inner) = user[open + 1..].strip_suffix(']') else {
        return Err(PoolError::malformed(format!(
            "user `{user}` has an unterminated proxy target"
        )));
    };
    if inner.is_empty() || inner.contains(['[', ']']) {
        return Err(PoolError::malformed(format!(
            "user `{user}` has an invalid proxy target"
        )));
    }
    Ok((user[..open].to_string(), Some(inner.to_string())))
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn parse_bool(key: &str, value: &str) -> PoolResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PoolError::malformed(format!(
            "`{key}` expects a boolean, got `{value}`"
        ))),
    }
}

fn parse_count(key: &str, value: &str) -> PoolResult<usize> {
    value.parse::<usize>().map_err(|_| {
        PoolError::malformed(format!("`{key}` expects a non-negative integer, got `{value}`"))
    })
}

fn parse_duration_value(key: &str, value: &str) -> PoolResult<Duration> {
    parse_duration(value).ok_or_else(|| {
        PoolError::malformed(format!("`{key}` expects a duration like 30s, got `{value}`"))
    })
}

/// Parse `250ms`, `30s`, `5m`, `1h` (also `ns`, `us`); a bare `0` is zero.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let n: u128 = digits.parse().ok()?;
    let unit_nanos: u128 = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => NANOS_PER_SEC,
        "m" => 60 * NANOS_PER_SEC,
        "h" => 3_600 * NANOS_PER_SEC,
        _ => return None,
    };
    // u128 nanoseconds cover the whole `Duration` range.
    let nanos = n.checked_mul(unit_nanos)?;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
    let subsec = u32::try_from(nanos % NANOS_PER_SEC).ok()?;
    Some(Duration::new(secs, subsec))
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (3_600_000_000_000, "h"),
        (60_000_000_000, "m"),
        (1_000_000_000, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
    ];
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    for (size, unit) in UNITS {
        if nanos % size == 0 {
            return format!("{}{unit}", nanos / size);
        }
    }
    format!("{nanos}ns")
}
