//! Connection identities and the key used to match idle sessions.

use std::fmt;

/// The credentials a session authenticates with.
///
/// An empty password means "inherit the pool default" when the username
/// matches the pool's default user. An absent proxy target means a direct
/// login; with a target, the session logs in as `username` and then runs as
/// `proxy_target`, which the server only allows after a CONNECT THROUGH grant.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ConnectionIdentity {
    username: String,
    password: String,
    proxy_target: Option<String>,
    connection_class: Option<String>,
}

impl ConnectionIdentity {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            proxy_target: None,
            connection_class: None,
        }
    }

    /// Builder method: run the session as `target` through proxy authentication.
    /// An empty target clears the proxy.
    pub fn with_proxy_target(self, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            proxy_target: (!target.is_empty()).then_some(target),
            ..self
        }
    }

    /// Builder method: tag the session with a server-side connection class.
    pub fn with_connection_class(self, class: impl Into<String>) -> Self {
        let class = class.into();
        Self {
            connection_class: (!class.is_empty()).then_some(class),
            ..self
        }
    }

    /// Builder method: replace the password.
    pub fn with_password(self, password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..self
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn proxy_target(&self) -> Option<&str> {
        self.proxy_target.as_deref()
    }

    pub fn connection_class(&self) -> Option<&str> {
        self.connection_class.as_deref()
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy_target.is_some()
    }

    /// The user the server executes statements as.
    pub fn effective_user(&self) -> &str {
        self.proxy_target.as_deref().unwrap_or(&self.username)
    }

    /// Key used to match this identity against idle sessions.
    pub fn reuse_key(&self) -> ReuseKey {
        match &self.proxy_target {
            Some(target) => ReuseKey::Proxy {
                username: self.username.clone(),
                target: target.clone(),
            },
            None => ReuseKey::Direct {
                username: self.username.clone(),
            },
        }
    }

    /// Password-free rendering, `user` or `user[target]`.
    pub fn redacted(&self) -> String {
        self.reuse_key().to_string()
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("proxy_target", &self.proxy_target)
            .field("connection_class", &self.connection_class)
            .finish()
    }
}

/// The part of an identity that decides whether an idle session can be reused.
///
/// The password is deliberately absent: once a session has authenticated,
/// only the login user and the proxy target determine what it may do.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReuseKey {
    /// Direct login as `username`.
    Direct { username: String },
    /// Login as `username`, executing as `target`.
    Proxy { username: String, target: String },
}

impl ReuseKey {
    pub fn username(&self) -> &str {
        match self {
            ReuseKey::Direct { username } | ReuseKey::Proxy { username, .. } => username,
        }
    }
}

impl fmt::Display for ReuseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReuseKey::Direct { username } => write!(f, "{username}"),
            ReuseKey::Proxy { username, target } => write!(f, "{username}[{target}]"),
        }
    }
}
