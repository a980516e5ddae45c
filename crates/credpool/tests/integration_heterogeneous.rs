//! Heterogeneous pool tests against an in-memory mock database.
//!
//! `MockDatabase` models just enough of a server for identity switching:
//! users with passwords, account locks, and CONNECT THROUGH grants that
//! allow one user to open sessions running as another. Sessions answer
//! `SELECT user FROM dual` with the user they execute as, and accept the
//! handful of DDL statements the tests use to provision a proxy user.
//!
//! The test stack: `HeterogeneousPool` → `MockDatabase` (as `SessionFactory`)
//! → `MockSession`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use credpool::{
    CallContext, ConnectionDescriptor, ConnectionIdentity, HeterogeneousPool, PoolError,
    PoolParams, RawSession, SerializeMode, SessionError, SessionFactory,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Initialize tracing subscriber for debug output.
/// Controlled by `RUST_LOG` env var (e.g. `RUST_LOG=credpool=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── MockDatabase ────────────────────────────────────────────────────

const ADMIN_USER: &str = "app_admin";
const ADMIN_PASSWORD: &str = "admin-pw-123";
const CONNECT_STRING: &str = "mockdb:1521/freepdb1";

#[derive(Debug, Default)]
struct DbState {
    /// Upper-cased user name → password.
    users: HashMap<String, String>,
    locked: HashSet<String>,
    /// (target, through) pairs: `through` may connect as `target`.
    grants: HashSet<(String, String)>,
}

/// In-memory server with users, passwords and proxy grants.
#[derive(Debug)]
struct MockDatabase {
    state: Mutex<DbState>,
    logins: AtomicU64,
    closes: AtomicU64,
}

impl MockDatabase {
    /// A database holding only the administrative user.
    fn start() -> Arc<Self> {
        let mut state = DbState::default();
        state
            .users
            .insert(ADMIN_USER.to_uppercase(), ADMIN_PASSWORD.to_string());
        Arc::new(Self {
            state: Mutex::new(state),
            logins: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        })
    }

    fn logins(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    fn user_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().users.contains_key(&name.to_uppercase())
    }

    fn lock_account(&self, name: &str) {
        self.state.lock().unwrap().locked.insert(name.to_uppercase());
    }

    /// Authenticate and, for proxy logins, check the grant.
    fn login(&self, identity: &ConnectionIdentity) -> Result<String, SessionError> {
        let state = self.state.lock().unwrap();
        let user = identity.username().to_uppercase();
        match state.users.get(&user) {
            Some(password) if password == identity.password() => {}
            _ => {
                return Err(SessionError::from_server_code(
                    1017,
                    "invalid username/password; logon denied",
                ));
            }
        }
        if state.locked.contains(&user) {
            return Err(SessionError::from_server_code(28000, "the account is locked"));
        }
        let Some(target) = identity.proxy_target() else {
            return Ok(user);
        };
        let target = target.to_uppercase();
        if !state.users.contains_key(&target) {
            return Err(SessionError::from_server_code(
                1918,
                format!("user '{target}' does not exist"),
            ));
        }
        if !state.grants.contains(&(target.clone(), user)) {
            return Err(SessionError::from_server_code(
                28150,
                "proxy not authorized to connect as client",
            ));
        }
        Ok(target)
    }

    /// Execute `statement` as `session_user`.
    fn run_sql(&self, session_user: &str, statement: &str) -> Result<String, SessionError> {
        let words: Vec<&str> = statement.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        if upper.as_slice() == ["SELECT", "USER", "FROM", "DUAL"] {
            return Ok(session_user.to_uppercase());
        }
        if upper.first() == Some(&"SELECT") {
            return Ok(String::new());
        }
        if !session_user.eq_ignore_ascii_case(ADMIN_USER) {
            return Err(SessionError::from_server_code(1031, "insufficient privileges"));
        }

        let mut state = self.state.lock().unwrap();
        match upper.as_slice() {
            ["CREATE", "USER", name, "IDENTIFIED", "BY", _] => {
                if state.users.contains_key(*name) {
                    return Err(SessionError::from_server_code(
                        1920,
                        format!("user name '{name}' conflicts with another user or role name"),
                    ));
                }
                state.users.insert(name.to_string(), words[5].to_string());
                Ok(String::new())
            }
            ["GRANT", "CREATE", "SESSION", "TO", _] => Ok(String::new()),
            ["ALTER", "USER", target, "GRANT", "CONNECT", "THROUGH", through] => {
                state.grants.insert((target.to_string(), through.to_string()));
                Ok(String::new())
            }
            ["ALTER", "USER", target, "REVOKE", "CONNECT", "THROUGH", through] => {
                state.grants.remove(&(target.to_string(), through.to_string()));
                Ok(String::new())
            }
            ["DROP", "USER", name] => {
                if state.users.remove(*name).is_none() {
                    return Err(SessionError::from_server_code(
                        1918,
                        format!("user '{name}' does not exist"),
                    ));
                }
                state.grants.retain(|(target, through)| target != *name && through != *name);
                Ok(String::new())
            }
            _ => Err(SessionError::from_server_code(900, "invalid SQL statement")),
        }
    }
}

#[derive(Debug)]
struct MockSession {
    db: Arc<MockDatabase>,
    user: String,
}

impl RawSession for MockSession {
    type Output = String;

    async fn execute(&mut self, statement: &str) -> Result<String, SessionError> {
        tokio::task::yield_now().await;
        self.db.run_sql(&self.user, statement)
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.db.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn effective_user(&self) -> &str {
        &self.user
    }
}

/// Opens sessions against a shared [`MockDatabase`].
#[derive(Debug, Clone)]
struct MockDriver(Arc<MockDatabase>);

impl SessionFactory for MockDriver {
    type Session = MockSession;

    async fn open(
        &self,
        connect_string: &str,
        identity: &ConnectionIdentity,
    ) -> Result<MockSession, SessionError> {
        tokio::task::yield_now().await;
        if connect_string != CONNECT_STRING {
            return Err(SessionError::Transport(format!(
                "could not resolve {connect_string}"
            )));
        }
        let user = self.0.login(identity)?;
        self.0.logins.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            db: Arc::clone(&self.0),
            user,
        })
    }
}

// ── Fixtures ─────────────────────────────────────────────────────

/// The descriptor text a deployment would be configured with.
fn admin_descriptor_text() -> String {
    format!(r#"user="{ADMIN_USER}" password="{ADMIN_PASSWORD}" connectString="{CONNECT_STRING}""#)
}

/// Parse the admin descriptor, switch it to heterogeneous, and build a pool
/// from its full text form.
fn heterogeneous_pool(
    db: &Arc<MockDatabase>,
    params: PoolParams,
) -> HeterogeneousPool<MockDriver> {
    init_tracing();
    let mut descriptor = ConnectionDescriptor::parse(&admin_descriptor_text()).unwrap();
    descriptor.heterogeneous = true;
    descriptor.pool = params;
    let text = descriptor.serialize(SerializeMode::WithPassword);
    HeterogeneousPool::open(&text, MockDriver(Arc::clone(db))).unwrap()
}

fn no_idle_params() -> PoolParams {
    PoolParams {
        max_idle: 0,
        ..PoolParams::default()
    }
}

/// A provisioned user that can be reached through the admin via CONNECT
/// THROUGH. Dropped from the database when the fixture goes out of scope,
/// on every exit path.
struct ProxyUserFixture {
    db: Arc<MockDatabase>,
    name: String,
    password: String,
}

impl ProxyUserFixture {
    async fn create(
        pool: &HeterogeneousPool<MockDriver>,
        name: &str,
        password: &str,
        grant_through: bool,
    ) -> Self {
        let ctx = CallContext::background().with_timeout(Duration::from_secs(30));
        let mut admin = pool.acquire(&ctx).await.unwrap();
        let _ = admin.execute(&ctx, &format!("DROP USER {name}")).await;

        let mut statements = vec![
            format!("CREATE USER {name} IDENTIFIED BY {password}"),
            format!("GRANT CREATE SESSION TO {name}"),
        ];
        if grant_through {
            statements.push(format!("ALTER USER {name} GRANT CONNECT THROUGH {ADMIN_USER}"));
        }
        for statement in &statements {
            admin.execute(&ctx, statement).await.unwrap();
        }
        admin.release().await;

        Self {
            db: Arc::clone(&pool.factory().0),
            name: name.to_string(),
            password: password.to_string(),
        }
    }
}

impl Drop for ProxyUserFixture {
    fn drop(&mut self) {
        let _ = self.db.run_sql(ADMIN_USER, &format!("DROP USER {}", self.name));
    }
}

async fn current_user(pool: &HeterogeneousPool<MockDriver>, ctx: &CallContext) -> String {
    let mut session = pool.acquire(ctx).await.unwrap();
    session.execute(ctx, "SELECT user FROM dual").await.unwrap()
}

// ── Default identity and context credentials ────────────────────────

#[tokio::test]
async fn no_context_uses_default_user() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, no_idle_params());
    let ctx = CallContext::background().with_timeout(Duration::from_secs(30));

    let user = current_user(&pool, &ctx).await;
    assert!(user.eq_ignore_ascii_case(ADMIN_USER));
}

#[tokio::test]
async fn context_credentials_switch_user() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, no_idle_params());
    let proxy = ProxyUserFixture::create(&pool, "test_proxyUser", "myPassword666myPassword", true).await;

    let base = CallContext::background().with_timeout(Duration::from_secs(30));
    for (case, ctx, want) in [
        ("noContext", base.clone(), ADMIN_USER),
        (
            "proxyUser",
            base.with_credentials(&proxy.name, &proxy.password, ""),
            proxy.name.as_str(),
        ),
    ] {
        let got = current_user(&pool, &ctx).await;
        assert!(got.eq_ignore_ascii_case(want), "{case}: got {got}, wanted {want}");
    }
}

#[tokio::test]
async fn pool_without_default_user_takes_credentials_from_context() {
    let db = MockDatabase::start();
    let mut descriptor = ConnectionDescriptor::parse(&admin_descriptor_text()).unwrap();
    descriptor.heterogeneous = true;
    descriptor.identity = ConnectionIdentity::default();
    let text = descriptor.to_string_with_password();
    assert!(!text.contains(ADMIN_PASSWORD));

    let pool = HeterogeneousPool::open(&text, MockDriver(Arc::clone(&db))).unwrap();

    let ctx = CallContext::background()
        .with_timeout(Duration::from_secs(30))
        .with_credentials(ADMIN_USER, ADMIN_PASSWORD, "");
    let mut session = pool.acquire(&ctx).await.unwrap();
    session.ping(&ctx).await.unwrap();
    drop(session);

    let err = pool.acquire(&CallContext::background()).await.unwrap_err();
    assert_eq!(err, PoolError::MissingCredentials);
}

// ── Proxy authentication ────────────────────────────────────────────

#[tokio::test]
async fn proxy_login_runs_as_target() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, no_idle_params());
    let proxy = ProxyUserFixture::create(&pool, "hr_proxy", "hr-pw-1", true).await;

    // Empty password for the pool's own user inherits the pool password.
    let ctx = CallContext::background().with_credentials(ADMIN_USER, "", &proxy.name);
    let mut session = pool.acquire(&ctx).await.unwrap();
    assert_eq!(session.identity().effective_user(), proxy.name);
    let user = session.execute(&ctx, "SELECT user FROM dual").await.unwrap();
    assert!(user.eq_ignore_ascii_case(&proxy.name));
}

#[tokio::test]
async fn proxy_to_nonexistent_user_fails() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());

    let ctx = CallContext::background().with_credentials(ADMIN_USER, ADMIN_PASSWORD, "nonexistent_user");
    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(
        matches!(
            err,
            PoolError::ProxyTargetNotFound { .. } | PoolError::ProxyGrantDenied { .. }
        ),
        "unexpected error: {err}"
    );
    assert!(err.is_auth_failure());
    assert!(!err.is_retriable());
    assert!(!err.to_string().contains(ADMIN_PASSWORD));
    assert_eq!(pool.stats().open, 0);
}

#[tokio::test]
async fn proxy_without_grant_is_denied() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());
    let target = ProxyUserFixture::create(&pool, "no_grant_user", "pw-no-grant", false).await;

    let ctx = CallContext::background().with_credentials(ADMIN_USER, ADMIN_PASSWORD, &target.name);
    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(
        matches!(&err, PoolError::ProxyGrantDenied { username, proxy_target, .. }
            if username == ADMIN_USER && proxy_target == &target.name),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn revoked_grant_fails_on_next_open() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, no_idle_params());
    let proxy = ProxyUserFixture::create(&pool, "revoked_user", "pw-revoked", true).await;
    let ctx = CallContext::background().with_credentials(ADMIN_USER, "", &proxy.name);
    assert!(pool.acquire(&ctx).await.is_ok());

    db.run_sql(
        ADMIN_USER,
        &format!("ALTER USER {} REVOKE CONNECT THROUGH {ADMIN_USER}", proxy.name),
    )
    .unwrap();

    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(matches!(err, PoolError::ProxyGrantDenied { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn wrong_password_is_authentication_failure() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());

    let ctx = CallContext::background().with_credentials(ADMIN_USER, "definitely-wrong", "");
    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(matches!(&err, PoolError::AuthenticationFailed { identity, .. } if identity == ADMIN_USER));
    assert!(!err.to_string().contains("definitely-wrong"));
}

#[tokio::test]
async fn locked_account_is_authentication_failure() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());
    let user = ProxyUserFixture::create(&pool, "locked_user", "pw-locked", false).await;
    db.lock_account(&user.name);

    let ctx = CallContext::background().with_credentials(&user.name, &user.password, "");
    let err = pool.acquire(&ctx).await.unwrap_err();
    assert!(matches!(err, PoolError::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn fixture_drops_user_on_scope_exit() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());
    {
        let fixture = ProxyUserFixture::create(&pool, "scoped_user", "pw-scoped", true).await;
        assert!(db.user_exists(&fixture.name));
    }
    assert!(!db.user_exists("scoped_user"));
}

// ── Reuse and isolation ─────────────────────────────────────────────

#[tokio::test]
async fn idle_sessions_are_isolated_by_identity() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());
    let proxy = ProxyUserFixture::create(&pool, "iso_user", "pw-iso", true).await;

    let admin_ctx = CallContext::background();
    let proxy_ctx = admin_ctx.with_credentials(ADMIN_USER, "", &proxy.name);

    for _ in 0..3 {
        let got = current_user(&pool, &admin_ctx).await;
        assert!(got.eq_ignore_ascii_case(ADMIN_USER));
        let got = current_user(&pool, &proxy_ctx).await;
        assert!(got.eq_ignore_ascii_case(&proxy.name));
    }

    // The fixture's admin session plus one proxied session, both reused.
    assert_eq!(pool.stats().opened_total, 2);
    assert_eq!(pool.stats().identities, 2);
}

#[tokio::test]
async fn max_idle_zero_opens_fresh_session_each_time() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, no_idle_params());

    let mut last_opened = pool.stats().opened_total;
    for _ in 0..4 {
        current_user(&pool, &CallContext::background()).await;
        let opened = pool.stats().opened_total;
        assert_eq!(opened, last_opened + 1);
        last_opened = opened;
    }
    assert_eq!(db.logins(), 4);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn homogeneous_pool_ignores_context_credentials() {
    init_tracing();
    let db = MockDatabase::start();
    let pool = HeterogeneousPool::open(&admin_descriptor_text(), MockDriver(Arc::clone(&db))).unwrap();
    assert!(!pool.is_heterogeneous());

    let ctx = CallContext::background().with_credentials("someone_else", "pw", "other");
    let mut session = pool.acquire(&ctx).await.unwrap();
    assert_eq!(session.identity().username(), ADMIN_USER);
    let user = session.execute(&ctx, "SELECT user FROM dual").await.unwrap();
    assert!(user.eq_ignore_ascii_case(ADMIN_USER));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_always_get_their_identity() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(
        &db,
        PoolParams {
            max_open: 3,
            max_idle: 2,
            wait_timeout: Duration::from_secs(10),
            ..PoolParams::default()
        },
    );
    let alpha = ProxyUserFixture::create(&pool, "alpha_user", "pw-alpha", true).await;
    let beta = ProxyUserFixture::create(&pool, "beta_user", "pw-beta", true).await;

    let mut tasks = Vec::new();
    for i in 0..24 {
        let pool = pool.clone();
        let target = match i % 3 {
            0 => String::new(),
            1 => alpha.name.clone(),
            _ => beta.name.clone(),
        };
        tasks.push(tokio::spawn(async move {
            let ctx = CallContext::background()
                .with_timeout(Duration::from_secs(30))
                .with_credentials(ADMIN_USER, "", target.clone());
            let want = if target.is_empty() { ADMIN_USER.to_string() } else { target };
            let got = current_user(&pool, &ctx).await;
            assert!(got.eq_ignore_ascii_case(&want), "got {got}, wanted {want}");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert!(stats.open <= 3);
    assert_eq!(stats.in_use, 0);
}

// ── Deadlines and shutdown ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn expired_deadline_on_full_pool_returns_promptly() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(
        &db,
        PoolParams {
            max_open: 1,
            max_idle: 1,
            ..PoolParams::default()
        },
    );
    let _held = pool.acquire(&CallContext::background()).await.unwrap();
    let open_before = pool.stats().open;

    let ctx = CallContext::background().with_timeout(Duration::from_millis(1));
    tokio::time::advance(Duration::from_millis(5)).await;
    let err = pool.acquire(&ctx).await.unwrap_err();

    assert_eq!(err, PoolError::DeadlineExceeded);
    assert_eq!(pool.stats().open, open_before);
}

#[tokio::test]
async fn drain_closes_every_session() {
    let db = MockDatabase::start();
    let pool = heterogeneous_pool(&db, PoolParams::default());
    let held = pool.acquire(&CallContext::background()).await.unwrap();
    current_user(&pool, &CallContext::background()).await;
    assert_eq!(pool.stats().idle, 1);

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await;
    });
    assert_eq!(pool.drain(Duration::from_secs(5)).await, 0);
    releaser.await.unwrap();

    assert_eq!(db.closes.load(Ordering::SeqCst), db.logins());
    assert_eq!(
        pool.acquire(&CallContext::background()).await.unwrap_err(),
        PoolError::PoolClosed
    );
}
