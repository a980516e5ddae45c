//! Heterogeneous connection pool.
//!
//! One pool serves one endpoint. Sessions are bound to the identity they
//! authenticated as and idle sessions are filed under that identity's
//! [`ReuseKey`], so a caller is only ever handed a session that logged in
//! the way it asked for.
//!
//! # Architecture
//!
//! ```text
//! acquire(ctx)
//!   → resolve identity (ctx credentials, else descriptor default)
//!   → idle session under the same ReuseKey → ping if stale → return it
//!   → below max_open → reserve a slot, open outside the lock → return it
//!   → at max_open, another identity idle → evict its LRU session, open
//!   → otherwise park until a release, the ctx ending, or wait_timeout
//! ```
//!
//! A single `std::sync::Mutex` guards the idle map and the counters. It is
//! never held across an `.await`; opening, pinging and closing sessions all
//! happen outside it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use credpool_core::{
    CallContext, ConnectionDescriptor, ConnectionIdentity, PoolError, PoolResult, ReuseKey,
};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::auth;
use crate::session::{RawSession, SessionError, SessionFactory};
use crate::sweeper::IdleSweeper;

/// A driver session with its pool bookkeeping.
#[derive(Debug)]
struct Tracked<S> {
    id: u64,
    session: S,
    identity: ConnectionIdentity,
    key: ReuseKey,
    created_at: Instant,
    /// When the session was last returned to the pool.
    last_used: Instant,
}

/// Point-in-time pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions idle, in use, or being opened.
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Sessions ever opened. Never decreases.
    pub opened_total: u64,
    pub closed_total: u64,
    /// Idle sessions closed to make room for another identity.
    pub evicted_total: u64,
    /// Acquisitions that had to wait for capacity.
    pub wait_count: u64,
    /// Distinct identities with at least one idle session.
    pub identities: usize,
}

#[derive(Debug)]
struct PoolState<S> {
    /// Each queue is ordered by `last_used`, oldest at the front.
    idle: HashMap<ReuseKey, VecDeque<Tracked<S>>>,
    idle_count: usize,
    open: usize,
    in_use: usize,
    max_idle: usize,
    max_open: usize,
    closed: bool,
    opened_total: u64,
    closed_total: u64,
    evicted_total: u64,
    wait_count: u64,
}

/// Outcome of one scan of the pool by `acquire`.
enum Claim<S> {
    Reuse(Tracked<S>),
    /// A slot is reserved. `evicted` is a foreign idle session whose slot was taken.
    Open { evicted: Option<Tracked<S>> },
    Wait,
}

impl<S> PoolState<S> {
    fn new(max_idle: usize, max_open: usize) -> Self {
        Self {
            idle: HashMap::new(),
            idle_count: 0,
            open: 0,
            in_use: 0,
            max_idle,
            max_open,
            closed: false,
            opened_total: 0,
            closed_total: 0,
            evicted_total: 0,
            wait_count: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.max_open == 0 || self.open < self.max_open
    }

    fn push_idle(&mut self, tracked: Tracked<S>) {
        let queue = self.idle.entry(tracked.key.clone()).or_default();
        let at = queue.partition_point(|t| t.last_used <= tracked.last_used);
        queue.insert(at, tracked);
        self.idle_count += 1;
    }

    /// Most recently used idle session for `key`.
    fn pop_idle(&mut self, key: &ReuseKey) -> Option<Tracked<S>> {
        let queue = self.idle.get_mut(key)?;
        let tracked = queue.pop_back();
        if queue.is_empty() {
            self.idle.remove(key);
        }
        if tracked.is_some() {
            self.idle_count -= 1;
        }
        tracked
    }

    /// Least recently used idle session of any identity.
    fn pop_lru(&mut self) -> Option<Tracked<S>> {
        let key = self
            .idle
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|t| (key, t.last_used)))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(key, _)| key.clone())?;
        let queue = self.idle.get_mut(&key)?;
        let tracked = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(&key);
        }
        if tracked.is_some() {
            self.idle_count -= 1;
        }
        tracked
    }

    fn take_all_idle(&mut self) -> Vec<Tracked<S>> {
        let all: Vec<_> = self.idle.drain().flat_map(|(_, queue)| queue).collect();
        self.idle_count = 0;
        all
    }

    /// Remove idle sessions unused for `idle_timeout` or longer.
    fn take_expired(&mut self, idle_timeout: Duration, now: Instant) -> Vec<Tracked<S>> {
        if idle_timeout.is_zero() || self.idle_count == 0 {
            return Vec::new();
        }
        let mut expired = Vec::new();
        self.idle.retain(|_, queue| {
            while queue
                .front()
                .is_some_and(|t| now.saturating_duration_since(t.last_used) >= idle_timeout)
            {
                expired.extend(queue.pop_front());
            }
            !queue.is_empty()
        });
        self.idle_count -= expired.len();
        self.retire(expired.len());
        expired
    }

    /// Close idle sessions, oldest first, until at most `limit` remain.
    fn shrink_idle(&mut self, limit: usize) -> Vec<Tracked<S>> {
        let mut excess = Vec::new();
        while self.idle_count > limit {
            match self.pop_lru() {
                Some(tracked) => excess.push(tracked),
                None => break,
            }
        }
        self.retire(excess.len());
        excess
    }

    /// Account for `n` sessions leaving the pool for good.
    fn retire(&mut self, n: usize) {
        self.open -= n;
        self.closed_total += n as u64;
    }

    fn claim(&mut self, key: &ReuseKey) -> Claim<S> {
        if let Some(tracked) = self.pop_idle(key) {
            self.in_use += 1;
            return Claim::Reuse(tracked);
        }
        if self.has_capacity() {
            self.open += 1;
            return Claim::Open { evicted: None };
        }
        // The caller's own queue is empty here, so any idle session is foreign.
        // Its slot passes straight to the new session; `open` is unchanged.
        if let Some(victim) = self.pop_lru() {
            self.evicted_total += 1;
            self.closed_total += 1;
            return Claim::Open {
                evicted: Some(victim),
            };
        }
        Claim::Wait
    }

    /// Take back an in-use session. Returns it if it must be closed instead.
    fn check_in(&mut self, tracked: Tracked<S>, healthy: bool) -> Option<Tracked<S>> {
        self.in_use -= 1;
        if healthy && !self.closed && self.idle_count < self.max_idle {
            self.push_idle(tracked);
            None
        } else {
            self.retire(1);
            Some(tracked)
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.open,
            idle: self.idle_count,
            in_use: self.in_use,
            opened_total: self.opened_total,
            closed_total: self.closed_total,
            evicted_total: self.evicted_total,
            wait_count: self.wait_count,
            identities: self.idle.len(),
        }
    }
}

struct Shared<F: SessionFactory> {
    descriptor: ConnectionDescriptor,
    factory: F,
    state: Mutex<PoolState<F::Session>>,
    /// Woken on every release, discard and close.
    released: Notify,
    next_id: AtomicU64,
}

impl<F: SessionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return an in-use session. Hands back the session if it has to be closed.
    fn check_in(
        &self,
        mut tracked: Tracked<F::Session>,
        healthy: bool,
        stamp: bool,
    ) -> Option<Tracked<F::Session>> {
        if stamp {
            tracked.last_used = Instant::now();
        }
        let (id, key) = (tracked.id, tracked.key.clone());
        let (disposed, open, idle) = {
            let mut state = self.lock();
            let disposed = state.check_in(tracked, healthy);
            (disposed, state.open, state.idle_count)
        };
        self.released.notify_waiters();

        match &disposed {
            None => tracing::debug!(session = id, user = %key, open, idle, "returned session to pool"),
            Some(_) if !healthy => {
                let reason = PoolError::SessionUnhealthy {
                    identity: key.to_string(),
                };
                tracing::debug!(session = id, user = %key, open, idle, error = %reason, "discarding session");
            }
            Some(_) => tracing::debug!(session = id, user = %key, open, idle, "idle set full or pool closed; closing session"),
        }
        disposed
    }
}

/// Frees a slot reserved for an open that did not complete.
struct Reservation<'a, F: SessionFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<F: SessionFactory> Reservation<'_, F> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: SessionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().open -= 1;
            self.shared.released.notify_waiters();
        }
    }
}

async fn close_sessions<S: RawSession>(sessions: Vec<Tracked<S>>) {
    for mut tracked in sessions {
        match tracked.session.close().await {
            Ok(()) => tracing::debug!(session = tracked.id, user = %tracked.key, "closed session"),
            Err(e) => tracing::warn!(
                session = tracked.id,
                user = %tracked.key,
                error = %e,
                "error closing session"
            ),
        }
    }
}

/// Close sessions from a synchronous context.
fn close_detached<S: RawSession>(sessions: Vec<Tracked<S>>) {
    if sessions.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(close_sessions(sessions));
        }
        Err(_) => tracing::debug!(
            count = sessions.len(),
            "no tokio runtime; dropping sessions without closing them"
        ),
    }
}

/// A pool of sessions that may authenticate as different identities.
///
/// Cloning is cheap and yields another handle to the same pool. With
/// `heterogeneous` off in the descriptor every session uses the descriptor's
/// identity and credentials on the call context are ignored.
///
/// Waiters for capacity are not served in FIFO order: every release wakes
/// all of them and they contend again.
pub struct HeterogeneousPool<F: SessionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: SessionFactory> Clone for HeterogeneousPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SessionFactory> HeterogeneousPool<F> {
    pub fn new(descriptor: ConnectionDescriptor, factory: F) -> PoolResult<Self> {
        descriptor.validate()?;
        let state = PoolState::new(descriptor.pool.max_idle, descriptor.pool.max_open);
        tracing::info!(
            descriptor = %descriptor,
            heterogeneous = descriptor.heterogeneous,
            "connection pool created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                descriptor,
                factory,
                state: Mutex::new(state),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Parse `text` as a descriptor and build a pool from it.
    pub fn open(text: &str, factory: F) -> PoolResult<Self> {
        Self::new(ConnectionDescriptor::parse(text)?, factory)
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.shared.descriptor
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn is_heterogeneous(&self) -> bool {
        self.shared.descriptor.heterogeneous
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Obtain a session authenticated as the identity `ctx` asks for.
    ///
    /// Fails immediately if `ctx` has already ended. Open failures are
    /// returned as is; the pool never retries with another identity.
    pub async fn acquire(&self, ctx: &CallContext) -> PoolResult<PooledSession<F>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        let identity = auth::resolve_identity(&self.shared.descriptor, ctx)?;
        let key = identity.reuse_key();
        let params = &self.shared.descriptor.pool;
        let started = Instant::now();
        let wait_deadline = started + params.wait_timeout;
        let mut waited = false;

        loop {
            // Registered before the scan so a release between the scan and
            // the wait still wakes us.
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (claim, expired) = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }
                let expired = state.take_expired(params.idle_timeout, Instant::now());
                let claim = state.claim(&key);
                if matches!(claim, Claim::Wait) && !waited {
                    state.wait_count += 1;
                }
                (claim, expired)
            };
            if !expired.is_empty() {
                tracing::debug!(expired = expired.len(), "closing expired idle sessions");
                self.shared.released.notify_waiters();
                close_detached(expired);
            }

            match claim {
                Claim::Reuse(tracked) => {
                    let stale = params
                        .ping_interval
                        .is_some_and(|every| tracked.last_used.elapsed() >= every);
                    let mut session = PooledSession::new(tracked, Arc::clone(&self.shared));
                    if stale {
                        let pinged = match ctx.run(session.raw_mut().ping()).await {
                            Ok(pinged) => pinged,
                            Err(err) => {
                                // The ping was abandoned mid-flight.
                                session.discard().await;
                                return Err(err);
                            }
                        };
                        match pinged {
                            Ok(()) => {}
                            Err(e) => {
                                tracing::debug!(
                                    session = session.id(),
                                    user = %key,
                                    error = %e,
                                    "idle session failed ping; discarding"
                                );
                                session.discard().await;
                                continue;
                            }
                        }
                    }
                    tracing::debug!(session = session.id(), user = %key, "reused idle session");
                    return Ok(session);
                }
                Claim::Open { evicted } => {
                    if let Some(victim) = evicted {
                        tracing::debug!(
                            session = victim.id,
                            evicted = %victim.key,
                            user = %key,
                            "evicting idle session of another identity"
                        );
                        close_detached(vec![victim]);
                    }
                    return self.open_session(ctx, &identity).await;
                }
                Claim::Wait => {
                    waited = true;
                    tracing::debug!(user = %key, "pool at capacity; waiting for a release");
                    tokio::select! {
                        biased;
                        err = ctx.done() => return Err(err),
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wait_deadline) => {
                            let max_open = self.shared.lock().max_open;
                            return Err(PoolError::PoolAtCapacity {
                                max_open,
                                waited: started.elapsed(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Open a session in a slot `claim` already reserved.
    async fn open_session(
        &self,
        ctx: &CallContext,
        identity: &ConnectionIdentity,
    ) -> PoolResult<PooledSession<F>> {
        let shared = &*self.shared;
        let reservation = Reservation {
            shared,
            armed: true,
        };

        let opened = ctx
            .run(shared.factory.open(&shared.descriptor.connect_string, identity))
            .await?;
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                let err = auth::classify_open_error(identity, e);
                tracing::debug!(user = %identity.redacted(), error = %err, "failed to open session");
                return Err(err);
            }
        };

        let now = Instant::now();
        let tracked = Tracked {
            id: shared.next_id.fetch_add(1, Ordering::Relaxed),
            session,
            identity: identity.clone(),
            key: identity.reuse_key(),
            created_at: now,
            last_used: now,
        };

        let (admitted, open) = {
            let mut state = shared.lock();
            state.opened_total += 1;
            if state.closed {
                state.retire(1);
                (false, state.open)
            } else {
                state.in_use += 1;
                (true, state.open)
            }
        };
        reservation.commit();

        if !admitted {
            shared.released.notify_waiters();
            close_sessions(vec![tracked]).await;
            return Err(PoolError::PoolClosed);
        }

        tracing::debug!(
            session = tracked.id,
            user = %tracked.key,
            effective_user = tracked.session.effective_user(),
            open,
            "opened new session"
        );
        Ok(PooledSession::new(tracked, Arc::clone(&self.shared)))
    }

    /// Return `session` to the pool, or close it when `healthy` is false.
    pub async fn release(&self, session: PooledSession<F>, healthy: bool) {
        if healthy {
            session.release().await;
        } else {
            session.discard().await;
        }
    }

    /// Close idle sessions unused for longer than the idle timeout.
    ///
    /// Returns the number closed.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.shared.descriptor.pool.idle_timeout;
        let (expired, remaining_idle) = {
            let mut state = self.shared.lock();
            let expired = state.take_expired(idle_timeout, Instant::now());
            (expired, state.idle_count)
        };
        let reaped = expired.len();
        if reaped > 0 {
            self.shared.released.notify_waiters();
            tracing::info!(reaped, remaining_idle, "reaped idle sessions");
            close_sessions(expired).await;
        }
        reaped
    }

    /// Ping every idle session and close those that fail.
    ///
    /// Returns the number removed.
    pub async fn health_check_idle(&self) -> usize {
        let candidates = {
            let mut state = self.shared.lock();
            let all = state.take_all_idle();
            state.in_use += all.len();
            all
        };

        let mut removed = 0;
        for tracked in candidates {
            let mut session = PooledSession::new(tracked, Arc::clone(&self.shared));
            match session.raw_mut().ping().await {
                Ok(()) => session.put_back(),
                Err(e) => {
                    removed += 1;
                    tracing::info!(
                        session = session.id(),
                        user = %session.reuse_key(),
                        error = %e,
                        "removed unhealthy idle session"
                    );
                    session.discard().await;
                }
            }
        }
        removed
    }

    /// Change the idle limit. Excess idle sessions are closed, oldest first.
    pub async fn set_max_idle(&self, max_idle: usize) {
        let excess = {
            let mut state = self.shared.lock();
            state.max_idle = max_idle;
            state.shrink_idle(max_idle)
        };
        tracing::debug!(max_idle, closed = excess.len(), "max_idle changed");
        close_sessions(excess).await;
    }

    /// Change the open limit. Zero means unlimited. Idle sessions above the
    /// new limit are closed; in-use ones are closed as they are released.
    pub async fn set_max_open(&self, max_open: usize) {
        let excess = {
            let mut state = self.shared.lock();
            state.max_open = max_open;
            let mut excess = Vec::new();
            while max_open > 0 && state.open > max_open {
                match state.pop_lru() {
                    Some(tracked) => {
                        state.retire(1);
                        excess.push(tracked);
                    }
                    None => break,
                }
            }
            excess
        };
        self.shared.released.notify_waiters();
        tracing::debug!(max_open, closed = excess.len(), "max_open changed");
        close_sessions(excess).await;
    }

    /// Stop handing out sessions and close every idle one.
    ///
    /// Sessions in use stay valid and are closed when released. Calling
    /// `close` again is a no-op.
    pub async fn close(&self) {
        let (idle, in_use) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = state.take_all_idle();
            state.retire(idle.len());
            (idle, state.in_use)
        };
        self.shared.released.notify_waiters();
        tracing::info!(closed_idle = idle.len(), in_use, "connection pool closed");
        close_sessions(idle).await;
    }

    /// Close the pool and wait up to `timeout` for in-use sessions to come back.
    ///
    /// Returns the number of sessions still outstanding when the wait ended.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.close().await;
        tracing::info!(drain_timeout = ?timeout, "connection pool draining started");

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.shared.lock().open;
            if outstanding == 0 {
                tracing::info!("all in-use sessions returned");
                return 0;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(outstanding, "drain timeout expired with sessions still in use");
                    return outstanding;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    /// Idle sessions currently filed under `key`.
    pub fn idle_count_for(&self, key: &ReuseKey) -> usize {
        self.shared.lock().idle.get(key).map_or(0, VecDeque::len)
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let state = self.shared.lock();
        for (key, queue) in &state.idle {
            tracing::info!(user = %key, idle = queue.len(), "idle sessions");
        }
        let stats = state.stats();
        tracing::info!(
            open = stats.open,
            idle = stats.idle,
            in_use = stats.in_use,
            opened_total = stats.opened_total,
            closed_total = stats.closed_total,
            evicted_total = stats.evicted_total,
            wait_count = stats.wait_count,
            "pool statistics"
        );
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` on a background task.
    ///
    /// Intervals below [`MIN_SWEEP_INTERVAL`](crate::sweeper::MIN_SWEEP_INTERVAL) are raised to it.
    pub fn spawn_sweeper(&self, interval: Duration) -> IdleSweeper {
        IdleSweeper::spawn(self.clone(), interval)
    }
}

impl<F: SessionFactory> fmt::Debug for HeterogeneousPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeterogeneousPool")
            .field("descriptor", &self.shared.descriptor.to_string_redacted())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A session checked out of a [`HeterogeneousPool`].
///
/// Dereferences read-only to the driver session. Statements go through
/// [`execute`](Self::execute) and [`ping`](Self::ping) so the pool sees every
/// failure. Dropping it returns the session to the pool, unless it saw a
/// broken-connection error or an operation interrupted by its context, in
/// which case it is closed.
///
/// The driver session cannot be closed behind the pool's back:
///
/// ```compile_fail
/// use credpool::{PooledSession, RawSession, SessionFactory};
///
/// async fn close_raw<F: SessionFactory>(mut session: PooledSession<F>) {
///     let _ = RawSession::close(&mut *session).await;
/// }
/// ```
pub struct PooledSession<F: SessionFactory> {
    /// `None` only after the session went back to the pool.
    tracked: Option<Tracked<F::Session>>,
    shared: Arc<Shared<F>>,
    broken: bool,
}

impl<F: SessionFactory> PooledSession<F> {
    fn new(tracked: Tracked<F::Session>, shared: Arc<Shared<F>>) -> Self {
        Self {
            tracked: Some(tracked),
            shared,
            broken: false,
        }
    }

    fn tracked(&self) -> &Tracked<F::Session> {
        self.tracked
            .as_ref()
            .expect("pooled session accessed after it was returned")
    }

    fn raw_mut(&mut self) -> &mut F::Session {
        &mut self
            .tracked
            .as_mut()
            .expect("pooled session accessed after it was returned")
            .session
    }

    /// Pool-unique session id.
    pub fn id(&self) -> u64 {
        self.tracked().id
    }

    /// The identity this session authenticated as.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.tracked().identity
    }

    pub fn reuse_key(&self) -> &ReuseKey {
        &self.tracked().key
    }

    pub fn created_at(&self) -> Instant {
        self.tracked().created_at
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Close this session instead of pooling it when it is returned.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Run `statement` unless `ctx` ends first.
    pub async fn execute(
        &mut self,
        ctx: &CallContext,
        statement: &str,
    ) -> PoolResult<<F::Session as RawSession>::Output> {
        let result = ctx.run(self.raw_mut().execute(statement)).await;
        self.settle(result)
    }

    /// Ping the server unless `ctx` ends first.
    pub async fn ping(&mut self, ctx: &CallContext) -> PoolResult<()> {
        let result = ctx.run(self.raw_mut().ping()).await;
        self.settle(result)
    }

    /// An operation cut short by its context leaves the session in an
    /// unknown protocol state; such sessions are never pooled again.
    fn settle<T>(&mut self, result: PoolResult<Result<T, SessionError>>) -> PoolResult<T> {
        match result {
            Ok(inner) => inner.map_err(|e| self.observe(e)),
            Err(err) => {
                tracing::debug!(session = self.id(), user = %self.reuse_key(), error = %err, "operation interrupted; session marked broken");
                self.broken = true;
                Err(err)
            }
        }
    }

    fn observe(&mut self, err: SessionError) -> PoolError {
        if err.is_broken() {
            tracing::debug!(session = self.id(), user = %self.reuse_key(), error = %err, "session marked broken");
            self.broken = true;
        }
        auth::session_error(self.identity(), &err)
    }

    /// Return the session to the pool.
    pub async fn release(mut self) {
        self.finish(true).await;
    }

    /// Close the session instead of returning it.
    pub async fn discard(mut self) {
        self.finish(false).await;
    }

    async fn finish(&mut self, healthy: bool) {
        let Some(tracked) = self.tracked.take() else {
            return;
        };
        let healthy = healthy && !self.broken;
        if let Some(disposed) = self.shared.check_in(tracked, healthy, true) {
            close_sessions(vec![disposed]).await;
        }
    }

    /// Return the session without refreshing its last-used time.
    fn put_back(mut self) {
        if let Some(tracked) = self.tracked.take() {
            if let Some(disposed) = self.shared.check_in(tracked, true, false) {
                close_detached(vec![disposed]);
            }
        }
    }
}

impl<F: SessionFactory> Deref for PooledSession<F> {
    type Target = F::Session;

    fn deref(&self) -> &F::Session {
        &self.tracked().session
    }
}

impl<F: SessionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            let healthy = !self.broken;
            if let Some(disposed) = self.shared.check_in(tracked, healthy, true) {
                close_detached(vec![disposed]);
            }
        }
    }
}

impl<F: SessionFactory> fmt::Debug for PooledSession<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tracked {
            Some(tracked) => f
                .debug_struct("PooledSession")
                .field("id", &tracked.id)
                .field("identity", &tracked.key.to_string())
                .field("broken", &self.broken)
                .finish(),
            None => f.write_str("PooledSession(returned)"),
        }
    }
}
