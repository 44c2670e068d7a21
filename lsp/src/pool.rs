//! Session pool: one supervised server per session key, leased exclusively.
//!
//! A [`SessionPool`] is an explicit registry object. Each session bundles a
//! [`Supervisor`], its [`ToolingGuard`] and [`LifecycleHealth`]. Callers get a
//! [`Lease`]; leases on one session are granted strictly in arrival order.
//!
//! Sessions leave the registry when they are poisoned, outlive
//! `max_lifetime` (once no lease is active), or sit idle past
//! `idle_timeout`. Disposal tries `shutdown`/`exit` before force-killing, and
//! a replacement for the same key is not spawned until disposal finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LspError;
use crate::guard::ToolingGuard;
use crate::lifecycle::LifecycleHealth;
use crate::protocol::CapabilityMask;
use crate::supervisor::{Launcher, ProcessLauncher, Supervisor};
use crate::types::SessionOptions;

/// How often idle sessions are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    New,
    Initializing,
    Ready,
    Poisoned,
    Retired,
}

/// Stable hash of everything that makes two sessions interchangeable.
#[must_use]
pub fn session_key(options: &SessionOptions) -> String {
    let material = serde_json::json!({
        "repoRoot": options.repo_root,
        "providerId": options.provider_id,
        "workspaceKey": options.workspace_key,
        "command": options.command,
        "initializationOptions": options.initialization_options,
        "timeouts": [
            options.supervisor.request_timeout.as_millis() as u64,
            options.supervisor.initialize_timeout.as_millis() as u64,
            options.supervisor.shutdown_timeout.as_millis() as u64,
            options.supervisor.kill_grace.as_millis() as u64,
        ],
        "guard": options.guard,
        "lifecycle": options.lifecycle,
        "idleTimeoutMs": options.idle_timeout.as_millis() as u64,
        "maxLifetimeMs": options.max_lifetime.as_millis() as u64,
    });
    let mut hasher = Sha256::new();
    hasher.update(material.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug)]
struct SessionMeta {
    state: SessionState,
    last_used_at: Instant,
    active_count: usize,
    reuse_count: u64,
    capabilities: Option<CapabilityMask>,
    poison_reason: Option<String>,
}

struct Session {
    key: String,
    pooled: bool,
    supervisor: Supervisor,
    guard: Arc<ToolingGuard>,
    health: Arc<LifecycleHealth>,
    /// FIFO: tokio's mutex grants waiters in arrival order.
    exclusive: Arc<tokio::sync::Mutex<()>>,
    created_at: Instant,
    idle_timeout: Duration,
    max_lifetime: Duration,
    recycle_count: u64,
    meta: Mutex<SessionMeta>,
    disposed: AtomicBool,
}

impl Session {
    fn meta(&self) -> MutexGuard<'_, SessionMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifetime_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.max_lifetime
    }

    fn idle_expired(meta: &SessionMeta, idle_timeout: Duration, now: Instant) -> bool {
        meta.active_count == 0 && now.duration_since(meta.last_used_at) >= idle_timeout
    }

    fn is_retiring(meta: &SessionMeta) -> bool {
        matches!(meta.state, SessionState::Poisoned | SessionState::Retired)
    }

    /// Usable once the exclusive lock is held.
    fn usable(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let mut meta = self.meta();
        if Self::is_retiring(&meta) {
            return false;
        }
        if meta.state == SessionState::Ready && !self.supervisor.is_running() {
            meta.state = SessionState::Poisoned;
            meta.poison_reason = Some("language server exited between leases".to_string());
            return false;
        }
        true
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Recycle count carried to a key's next session.
    recycle_counts: HashMap<String, u64>,
}

enum Checkout {
    Reuse(Arc<Session>),
    /// Removed from the registry; dispose, then look again.
    Stale(Arc<Session>),
    Vacant,
}

struct PoolInner {
    launcher: Arc<dyn Launcher>,
    registry: Mutex<Registry>,
    disposing: Mutex<HashMap<String, (u64, watch::Receiver<bool>)>>,
    next_disposal: AtomicU64,
    sweeper_started: AtomicBool,
    sweep_interval: Duration,
}

impl PoolInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_session(&self, options: &SessionOptions, key: String, recycle_count: u64) -> Session {
        let name = options.provider_id.clone();
        let health = Arc::new(LifecycleHealth::new(name.clone(), options.lifecycle));
        let guard = Arc::new(ToolingGuard::new(name.clone(), options.guard).with_health(Arc::clone(&health)));
        let supervisor = Supervisor::builder(name, options.command.clone(), Arc::clone(&self.launcher))
            .options(options.supervisor)
            .observer(Arc::clone(&health) as Arc<dyn crate::supervisor::LifecycleObserver>)
            .build();
        let now = Instant::now();
        Session {
            key,
            pooled: options.pooling,
            supervisor,
            guard,
            health,
            exclusive: Arc::new(tokio::sync::Mutex::new(())),
            created_at: now,
            idle_timeout: options.idle_timeout,
            max_lifetime: options.max_lifetime,
            recycle_count,
            meta: Mutex::new(SessionMeta {
                state: SessionState::New,
                last_used_at: now,
                active_count: 0,
                reuse_count: 0,
                capabilities: None,
                poison_reason: None,
            }),
            disposed: AtomicBool::new(false),
        }
    }

    fn checkout(&self, key: &str) -> Checkout {
        let now = Instant::now();
        let mut registry = self.registry();
        let Some(session) = registry.sessions.get(key).cloned() else {
            return Checkout::Vacant;
        };
        let mut meta = session.meta();
        let lifetime = session.lifetime_expired(now);
        let reusable = !session.disposed.load(Ordering::Acquire)
            && !Session::is_retiring(&meta)
            && !lifetime
            && !Session::idle_expired(&meta, session.idle_timeout, now);
        if reusable {
            meta.active_count += 1;
            drop(meta);
            return Checkout::Reuse(session);
        }

        registry.sessions.remove(key);
        if lifetime || meta.state == SessionState::Poisoned {
            registry
                .recycle_counts
                .insert(key.to_string(), session.recycle_count + 1);
        }
        if meta.active_count > 0 {
            // The last active lease disposes it on release.
            meta.state = if meta.state == SessionState::Poisoned {
                SessionState::Poisoned
            } else {
                SessionState::Retired
            };
            return Checkout::Vacant;
        }
        drop(meta);
        Checkout::Stale(session)
    }

    /// Insert a fresh session for `key`, unless one appeared meanwhile.
    fn register(&self, options: &SessionOptions, key: &str) -> (Arc<Session>, bool) {
        let mut registry = self.registry();
        if let Some(existing) = registry.sessions.get(key) {
            let mut meta = existing.meta();
            if !Session::is_retiring(&meta) && !existing.disposed.load(Ordering::Acquire) {
                meta.active_count += 1;
                drop(meta);
                return (Arc::clone(existing), true);
            }
        }
        let recycle_count = registry.recycle_counts.get(key).copied().unwrap_or(0);
        let session = Arc::new(self.create_session(options, key.to_string(), recycle_count));
        session.meta().active_count = 1;
        registry
            .sessions
            .insert(key.to_string(), Arc::clone(&session));
        (session, false)
    }

    /// Remove `session` from the registry if it is still the live one.
    fn detach(&self, session: &Arc<Session>, bump_recycle: bool) {
        if !session.pooled {
            return;
        }
        let mut registry = self.registry();
        let registered = registry
            .sessions
            .get(&session.key)
            .is_some_and(|live| Arc::ptr_eq(live, session));
        if registered {
            registry.sessions.remove(&session.key);
            if bump_recycle {
                registry
                    .recycle_counts
                    .insert(session.key.clone(), session.recycle_count + 1);
            }
        }
    }

    /// Drop one active use. Returns the session when it must be disposed now.
    fn end_use(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let now = Instant::now();
        let lifetime = session.lifetime_expired(now);
        let (active, retire, bump) = {
            let mut meta = session.meta();
            meta.active_count = meta.active_count.saturating_sub(1);
            meta.last_used_at = now;
            let poisoned = meta.state == SessionState::Poisoned;
            let retire = !session.pooled || poisoned || meta.state == SessionState::Retired || lifetime;
            if retire && !poisoned {
                meta.state = SessionState::Retired;
            }
            (meta.active_count, retire, poisoned || lifetime)
        };
        if retire {
            self.detach(session, bump);
        }
        (retire && active == 0).then(|| Arc::clone(session))
    }

    async fn wait_for_disposal(&self, key: &str, cancel: &CancellationToken) -> Result<(), LspError> {
        let barrier = self
            .disposing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|(_, rx)| rx.clone());
        let Some(mut barrier) = barrier else {
            return Ok(());
        };
        let done = async move {
            let _ = barrier.wait_for(|disposed| *disposed).await;
        };
        tokio::select! {
            () = done => Ok(()),
            () = cancel.cancelled() => Err(LspError::cancelled()),
        }
    }

    async fn dispose(&self, session: Arc<Session>) {
        if session.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let barrier = session.pooled.then(|| {
            let id = self.next_disposal.fetch_add(1, Ordering::AcqRel);
            let (tx, rx) = watch::channel(false);
            self.disposing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session.key.clone(), (id, rx));
            (id, tx)
        });

        tracing::debug!(
            session = %&session.key[..12.min(session.key.len())],
            recycle_count = session.recycle_count,
            "disposing language server session"
        );
        session.supervisor.set_notification_sink(None);
        session.supervisor.shutdown_and_exit().await;
        session.supervisor.kill();

        if let Some((id, tx)) = barrier {
            let mut disposing = self.disposing.lock().unwrap_or_else(PoisonError::into_inner);
            if disposing.get(&session.key).is_some_and(|(owner, _)| *owner == id) {
                disposing.remove(&session.key);
            }
            drop(disposing);
            let _ = tx.send(true);
        }
    }

    fn dispose_detached(self: &Arc<Self>, session: Arc<Session>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.dispose(session).await });
            }
            Err(_) => {
                session.disposed.store(true, Ordering::Release);
                session.supervisor.kill();
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut registry = self.registry();
            let keys: Vec<String> = registry
                .sessions
                .iter()
                .filter(|(_, session)| {
                    let meta = session.meta();
                    meta.active_count == 0
                        && (Session::idle_expired(&meta, session.idle_timeout, now)
                            || session.lifetime_expired(now))
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| {
                    let session = registry.sessions.remove(key)?;
                    if session.lifetime_expired(now) {
                        registry
                            .recycle_counts
                            .insert(key.clone(), session.recycle_count + 1);
                    }
                    session.meta().state = SessionState::Retired;
                    Some(session)
                })
                .collect()
        };
        for session in expired {
            self.dispose(session).await;
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.sweeper_started.store(false, Ordering::Release);
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                pool.sweep().await;
            }
        });
    }
}

/// Keyed registry of supervised language server sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new(Arc::new(ProcessLauncher))
    }
}

impl SessionPool {
    #[must_use]
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self::with_sweep_interval(launcher, SWEEP_INTERVAL)
    }

    #[must_use]
    pub fn with_sweep_interval(launcher: Arc<dyn Launcher>, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                registry: Mutex::new(Registry::default()),
                disposing: Mutex::new(HashMap::new()),
                next_disposal: AtomicU64::new(0),
                sweeper_started: AtomicBool::new(false),
                sweep_interval,
            }),
        }
    }

    /// Live registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.registry().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lease a session for `options`, waiting for earlier holders.
    pub async fn acquire(
        &self,
        options: &SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<Lease, LspError> {
        let options = options.clone().normalized();
        let key = session_key(&options);

        if !options.pooling {
            let session = Arc::new(self.inner.create_session(&options, key, 0));
            session.meta().active_count = 1;
            let exclusive = Arc::clone(&session.exclusive).lock_owned().await;
            return Ok(Lease {
                pool: Arc::clone(&self.inner),
                session,
                reused: false,
                exclusive: Some(exclusive),
                released: false,
            });
        }

        self.inner.ensure_sweeper();
        loop {
            if cancel.is_cancelled() {
                return Err(LspError::cancelled());
            }
            let (session, reused) = match self.inner.checkout(&key) {
                Checkout::Reuse(session) => (session, true),
                Checkout::Stale(session) => {
                    self.inner.dispose(session).await;
                    continue;
                }
                Checkout::Vacant => {
                    self.inner.wait_for_disposal(&key, cancel).await?;
                    self.inner.register(&options, &key)
                }
            };

            let exclusive = tokio::select! {
                guard = Arc::clone(&session.exclusive).lock_owned() => guard,
                () = cancel.cancelled() => {
                    if let Some(stale) = self.inner.end_use(&session) {
                        self.inner.dispose(stale).await;
                    }
                    return Err(LspError::cancelled());
                }
            };

            if !session.usable() {
                drop(exclusive);
                if let Some(stale) = self.inner.end_use(&session) {
                    self.inner.dispose(stale).await;
                }
                continue;
            }
            if reused {
                session.meta().reuse_count += 1;
            }
            return Ok(Lease {
                pool: Arc::clone(&self.inner),
                session,
                reused,
                exclusive: Some(exclusive),
                released: false,
            });
        }
    }

    /// Run `f` with a leased session, releasing it afterwards.
    pub async fn with_session<T, F>(
        &self,
        options: &SessionOptions,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, LspError>
    where
        F: AsyncFnOnce(&Lease) -> T,
    {
        let lease = self.acquire(options, cancel).await?;
        let out = f(&lease).await;
        lease.release().await;
        Ok(out)
    }

    /// Dispose every registered session.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.inner.registry();
            registry.recycle_counts.clear();
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.meta().state = SessionState::Retired;
            self.inner.dispose(session).await;
        }
    }
}

/// Pooling metadata for the runtime summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolingSnapshot {
    pub enabled: bool,
    pub reused: bool,
    pub session_key: String,
    pub recycle_count: u64,
    pub age_ms: u64,
}

/// Exclusive use of one session until released or dropped.
pub struct Lease {
    pool: Arc<PoolInner>,
    session: Arc<Session>,
    reused: bool,
    exclusive: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl Lease {
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.session.supervisor
    }

    #[must_use]
    pub fn guard(&self) -> &ToolingGuard {
        &self.session.guard
    }

    #[must_use]
    pub fn health(&self) -> &LifecycleHealth {
        &self.session.health
    }

    #[must_use]
    pub fn pooled(&self) -> bool {
        self.session.pooled
    }

    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session.key
    }

    #[must_use]
    pub fn reused(&self) -> bool {
        self.reused
    }

    #[must_use]
    pub fn recycle_count(&self) -> u64 {
        self.session.recycle_count
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.session.created_at.elapsed()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.meta().state
    }

    #[must_use]
    pub fn should_initialize(&self) -> bool {
        matches!(self.state(), SessionState::New | SessionState::Initializing)
    }

    pub fn mark_initializing(&self) {
        let mut meta = self.session.meta();
        if meta.state == SessionState::New {
            meta.state = SessionState::Initializing;
        }
    }

    pub fn mark_initialized(&self, capabilities: CapabilityMask) {
        let mut meta = self.session.meta();
        if !Session::is_retiring(&meta) {
            meta.state = SessionState::Ready;
        }
        meta.capabilities = Some(capabilities);
    }

    #[must_use]
    pub fn capabilities(&self) -> Option<CapabilityMask> {
        self.session.meta().capabilities
    }

    /// Never hand this session out again.
    pub fn mark_poisoned(&self, reason: &str) {
        {
            let mut meta = self.session.meta();
            if meta.state == SessionState::Poisoned {
                return;
            }
            meta.state = SessionState::Poisoned;
            meta.poison_reason = Some(reason.to_string());
        }
        tracing::warn!(cmd = %self.session.supervisor.name(), %reason, "session poisoned");
        self.pool.detach(&self.session, true);
    }

    #[must_use]
    pub fn poison_reason(&self) -> Option<String> {
        self.session.meta().poison_reason.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolingSnapshot {
        PoolingSnapshot {
            enabled: self.pooled(),
            reused: self.reused,
            session_key: self.session.key.clone(),
            recycle_count: self.session.recycle_count,
            age_ms: u64::try_from(self.age().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Release and wait for any disposal this triggers.
    pub async fn release(mut self) {
        self.released = true;
        let stale = self.pool.end_use(&self.session);
        self.exclusive.take();
        if let Some(stale) = stale {
            self.pool.dispose(stale).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(stale) = self.pool.end_use(&self.session) {
            self.pool.dispose_detached(stale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubLauncher, StubScript};
    use crate::types::CommandSpec;

    fn options() -> SessionOptions {
        SessionOptions::new("/repo", CommandSpec::new("stub-ls"))
    }

    fn pool(launcher: &Arc<StubLauncher>) -> SessionPool {
        SessionPool::new(launcher.clone())
    }

    async fn lease_and_init(pool: &SessionPool, options: &SessionOptions) -> Lease {
        let lease = pool.acquire(options, &CancellationToken::new()).await.unwrap();
        if lease.should_initialize() {
            lease.mark_initializing();
            let caps = lease
                .supervisor()
                .initialize("file:///repo", None, None)
                .await
                .unwrap();
            lease.mark_initialized(caps);
        }
        lease
    }

    #[test]
    fn key_is_stable_and_sensitive_to_command() {
        let a = session_key(&options());
        assert_eq!(a, session_key(&options()));
        assert_eq!(a.len(), 64);
        let other = SessionOptions::new("/repo", CommandSpec::new("stub-ls").with_args(["--stdio"]));
        assert_ne!(a, session_key(&other));
    }

    #[tokio::test]
    async fn sequential_leases_share_one_process() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        let first = lease_and_init(&pool, &options()).await;
        assert!(!first.reused());
        first.release().await;

        let second = lease_and_init(&pool, &options()).await;
        assert!(second.reused());
        assert!(!second.should_initialize());
        second.release().await;

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.request_count("initialize"), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn poisoned_session_is_never_reused() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        let first = lease_and_init(&pool, &options()).await;
        first.mark_poisoned("closed pipe");
        first.release().await;
        assert!(pool.is_empty());

        let second = lease_and_init(&pool, &options()).await;
        assert!(!second.reused());
        assert_eq!(second.recycle_count(), 1);
        second.release().await;
        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(launcher.request_count("shutdown"), 1);
    }

    #[tokio::test]
    async fn leases_are_exclusive_and_fifo() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = pool.acquire(&options(), &CancellationToken::new()).await.unwrap();

        let mut waiters = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let lease = pool.acquire(&options(), &CancellationToken::new()).await.unwrap();
                order.lock().unwrap().push(i);
                lease.release().await;
            }));
            // Make arrival order deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(order.lock().unwrap().is_empty());
        first.release().await;
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancelled_waiter_gives_up() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        let held = pool.acquire(&options(), &CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool.acquire(&options(), &cancel).await.err().unwrap();
        assert!(err.is(crate::error::LspErrorKind::Cancelled));
        held.release().await;
    }

    #[tokio::test]
    async fn non_pooled_sessions_are_disposed_after_use() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        let mut options = options();
        options.pooling = false;
        for _ in 0..2 {
            let spawned = pool
                .with_session(&options, &CancellationToken::new(), async |lease: &Lease| {
                    lease.supervisor().initialize("file:///repo", None, None).await.is_ok()
                })
                .await
                .unwrap();
            assert!(spawned);
        }
        assert!(pool.is_empty());
        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(launcher.notification_count("exit"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        lease_and_init(&pool, &options()).await.release().await;
        assert_eq!(pool.len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(pool.is_empty());
        assert_eq!(launcher.notification_count("exit"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_expiry_recycles_after_release() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = SessionPool::with_sweep_interval(launcher.clone(), Duration::from_secs(3600));
        let mut options = options();
        options.max_lifetime = Duration::from_secs(2);
        options.idle_timeout = Duration::from_secs(60);

        let lease = lease_and_init(&pool, &options).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        // Still held: not recycled mid-use.
        assert_eq!(pool.len(), 1);
        lease.release().await;
        assert!(pool.is_empty());

        let next = lease_and_init(&pool, &options).await;
        assert_eq!(next.recycle_count(), 1);
        assert!(!next.reused());
        next.release().await;
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn crashed_server_between_leases_forces_fresh_session() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        let first = lease_and_init(&pool, &options()).await;
        first.supervisor().kill();
        first.release().await;

        let second = lease_and_init(&pool, &options()).await;
        assert!(!second.reused());
        second.release().await;
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_all_drains_registry() {
        let launcher = StubLauncher::new(StubScript::default());
        let pool = pool(&launcher);
        lease_and_init(&pool, &options()).await.release().await;
        let mut other = options();
        other.workspace_key = Some("ws2".into());
        lease_and_init(&pool, &other).await.release().await;
        assert_eq!(pool.len(), 2);

        pool.shutdown_all().await;
        assert!(pool.is_empty());
        assert_eq!(launcher.request_count("shutdown"), 2);
    }
}
