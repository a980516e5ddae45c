//! Call-scoped context carrying per-call credentials, deadlines and cancellation.
//!
//! A [`CallContext`] is an immutable value. Every `with_*` method returns a
//! child and leaves the parent untouched, so credentials attached for one
//! call never leak into another. The pool reads the credentials once, in
//! `acquire`, and honors the deadline and cancellation while it waits.
//!
//! ```text
//! let ctx = CallContext::background()
//!     .with_timeout(Duration::from_secs(30))
//!     .with_credentials("scott", "tiger", "hr");
//! let session = pool.acquire(&ctx).await?;   // runs as hr, through scott
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::PoolError;
use crate::identity::ConnectionIdentity;

/// Immutable per-call context.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    credentials: Option<Arc<ConnectionIdentity>>,
    deadline: Option<Instant>,
    /// Cancellation signals of this context and all of its ancestors.
    cancel: Vec<watch::Receiver<bool>>,
}

/// Cancels the context returned alongside it by [`CallContext::with_cancel`]
/// and every context derived from it.
///
/// Dropping the handle does not cancel.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CallContext {
    /// Root context: no credentials, no deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Attach credentials for the acquisitions made under the returned context.
    ///
    /// An empty `proxy_target` means a direct login. Nested calls shadow
    /// outer ones.
    pub fn with_credentials(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
        proxy_target: impl Into<String>,
    ) -> Self {
        self.with_identity(ConnectionIdentity::new(username, password).with_proxy_target(proxy_target))
    }

    /// Attach a fully built identity.
    pub fn with_identity(&self, identity: ConnectionIdentity) -> Self {
        Self {
            credentials: Some(Arc::new(identity)),
            ..self.clone()
        }
    }

    /// The innermost credentials attached to this context, if any.
    pub fn credentials(&self) -> Option<&ConnectionIdentity> {
        self.credentials.as_deref()
    }

    /// Child context that expires `timeout` from now, or earlier if the
    /// parent already expires earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child context that expires at `deadline` or at the parent's deadline,
    /// whichever comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Child context with its own cancellation signal. Cancelling an
    /// ancestor still cancels the child.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut cancel = self.cancel.clone();
        cancel.push(rx);
        let child = Self {
            cancel,
            ..self.clone()
        };
        (child, CancelHandle { tx: Arc::new(tx) })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.iter().any(|rx| *rx.borrow())
    }

    /// The reason this context has already ended, if it has.
    pub fn err(&self) -> Option<PoolError> {
        if self.is_cancelled() {
            return Some(PoolError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(PoolError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Never resolves for a background context.
    pub async fn done(&self) -> PoolError {
        if let Some(err) = self.err() {
            return err;
        }
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = deadline => PoolError::DeadlineExceeded,
            _ = wait_any_cancelled(self.cancel.clone()) => PoolError::Canceled,
        }
    }

    /// Run `fut` unless the context ends first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, PoolError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

fn wait_any_cancelled(
    mut signals: Vec<watch::Receiver<bool>>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let Some(mut last) = signals.pop() else {
            return std::future::pending().await;
        };
        tokio::select! {
            _ = wait_cancelled(&mut last) => {}
            _ = wait_any_cancelled(signals) => {}
        }
    })
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    // A dropped handle can no longer cancel.
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
