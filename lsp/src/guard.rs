//! Request circuit breaker.
//!
//! Every tooling call goes through [`ToolingGuard::run`]. Consecutive failures
//! reaching the threshold open the circuit for a cool-down; while open, calls
//! are rejected without touching the server. The first call after the
//! cool-down runs half-open: success closes the circuit, failure re-opens it.
//!
//! The guard also consults [`LifecycleHealth`] before each attempt, so a
//! crash-loop quarantine rejects the call and fd pressure delays it.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LspError, LspErrorKind};
use crate::lifecycle::LifecycleHealth;
use crate::types::GuardOptions;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    trip_count: u64,
    open_until: Option<Instant>,
    half_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardSnapshot {
    pub breaker_threshold: u32,
    pub consecutive_failures: u32,
    pub trip_count: u64,
    pub open: bool,
}

/// Per-call overrides for [`ToolingGuard::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions<'a> {
    /// Used in logs.
    pub label: &'a str,
    pub timeout: Option<Duration>,
    /// Skip retries regardless of policy.
    pub no_retry: bool,
}

impl<'a> RunOptions<'a> {
    #[must_use]
    pub fn new(label: &'a str) -> Self {
        Self {
            label,
            timeout: None,
            no_retry: false,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct ToolingGuard {
    name: String,
    options: GuardOptions,
    health: Option<Arc<LifecycleHealth>>,
    state: Mutex<BreakerState>,
}

impl ToolingGuard {
    pub fn new(name: impl Into<String>, options: GuardOptions) -> Self {
        Self {
            name: name.into(),
            options,
            health: None,
            state: Mutex::new(BreakerState::default()),
        }
    }

    #[must_use]
    pub fn with_health(mut self, health: Arc<LifecycleHealth>) -> Self {
        self.health = Some(health);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the circuit rejects calls.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock()
            .open_until
            .is_some_and(|until| Instant::now() < until)
    }

    #[must_use]
    pub fn snapshot(&self) -> GuardSnapshot {
        let open = self.is_open();
        let state = self.lock();
        GuardSnapshot {
            breaker_threshold: self.options.breaker_threshold,
            consecutive_failures: state.consecutive_failures,
            trip_count: state.trip_count,
            open,
        }
    }

    fn admit(&self) -> Result<(), LspError> {
        let mut state = self.lock();
        let Some(until) = state.open_until else {
            return Ok(());
        };
        let now = Instant::now();
        if now < until {
            return Err(LspError::new(
                LspErrorKind::CircuitOpen,
                format!(
                    "{} circuit breaker open after {} failures",
                    self.name, state.consecutive_failures
                ),
            )
            .with_retry_after(until - now));
        }
        state.open_until = None;
        state.half_open = true;
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.half_open = false;
        state.open_until = None;
    }

    /// Returns true when this failure opened the circuit.
    fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let trip =
            state.half_open || state.consecutive_failures >= self.options.breaker_threshold;
        state.half_open = false;
        if trip {
            state.open_until = Some(Instant::now() + self.options.cooldown);
            state.trip_count += 1;
        }
        trip
    }

    /// Run `call` under the breaker, retrying non-timeout failures.
    ///
    /// `call` receives the effective timeout for its attempt.
    pub async fn run<T, F, Fut>(
        &self,
        options: RunOptions<'_>,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, LspError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, LspError>>,
    {
        let timeout = options.timeout.unwrap_or(self.options.timeout);
        let retries = if options.no_retry { 0 } else { self.options.retries };
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LspError::cancelled());
            }
            if let Some(health) = &self.health {
                health.check()?;
                if let Some(delay) = health.fd_pressure_delay() {
                    tracing::debug!(
                        provider = %self.name,
                        label = options.label,
                        delay_ms = delay.as_millis() as u64,
                        "waiting out fd pressure backoff"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(LspError::cancelled()),
                    }
                }
            }
            self.admit()?;

            match call(timeout).await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) if err.is(LspErrorKind::Cancelled) => return Err(err),
                Err(err) => {
                    let tripped = self.record_failure();
                    if tripped {
                        tracing::warn!(
                            provider = %self.name,
                            label = options.label,
                            "circuit breaker opened: {err}"
                        );
                    }
                    let retryable = !tripped
                        && attempt < retries
                        && !matches!(
                            err.kind(),
                            LspErrorKind::Timeout | LspErrorKind::CapabilityMissing
                        )
                        && !err.kind().is_policy();
                    if !retryable {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::debug!(
                        provider = %self.name,
                        label = options.label,
                        attempt,
                        "retrying after failure: {err}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::types::LifecycleOptions;

    fn guard(threshold: u32, retries: u32) -> ToolingGuard {
        ToolingGuard::new(
            "stub",
            GuardOptions {
                timeout: Duration::from_millis(100),
                retries,
                breaker_threshold: threshold,
                cooldown: Duration::from_secs(5),
            },
        )
    }

    fn failing(kind: LspErrorKind) -> Result<(), LspError> {
        Err(LspError::new(kind, "boom"))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_half_opens_after_cooldown() {
        let guard = guard(2, 0);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let run = || {
            guard.run(RunOptions::new("hover"), &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { failing(LspErrorKind::Protocol) }
            })
        };

        assert!(run().await.unwrap_err().is(LspErrorKind::Protocol));
        assert!(run().await.unwrap_err().is(LspErrorKind::Protocol));
        assert!(guard.is_open());

        // Rejected without calling through.
        assert!(run().await.unwrap_err().is(LspErrorKind::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        let ok = guard
            .run(RunOptions::new("hover"), &cancel, |_| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        let snapshot = guard.snapshot();
        assert!(!snapshot.open);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.trip_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_immediately() {
        let guard = guard(2, 0);
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let _ = guard
                .run(RunOptions::new("x"), &cancel, |_| async {
                    failing(LspErrorKind::Protocol)
                })
                .await;
        }
        tokio::time::advance(Duration::from_secs(6)).await;
        let _ = guard
            .run(RunOptions::new("x"), &cancel, |_| async {
                failing(LspErrorKind::Protocol)
            })
            .await;
        assert!(guard.is_open());
        assert_eq!(guard.snapshot().trip_count, 2);
    }

    #[tokio::test]
    async fn retries_transport_failures_but_not_timeouts() {
        let guard = guard(10, 2);
        let cancel = CancellationToken::new();

        let calls = AtomicU32::new(0);
        let _ = guard
            .run(RunOptions::new("x"), &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { failing(LspErrorKind::Transport) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let _ = guard
            .run(RunOptions::new("x"), &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { failing(LspErrorKind::Timeout) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn passes_timeout_override_to_call() {
        let guard = guard(3, 0);
        let cancel = CancellationToken::new();
        let seen = guard
            .run(
                RunOptions::new("hover").with_timeout(Some(Duration::from_millis(42))),
                &cancel,
                |timeout| async move { Ok(timeout) },
            )
            .await
            .unwrap();
        assert_eq!(seen, Duration::from_millis(42));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let guard = guard(3, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = guard
            .run(RunOptions::new("x"), &cancel, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is(LspErrorKind::Cancelled));
        assert_eq!(guard.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_rejects_before_calling() {
        let health = Arc::new(LifecycleHealth::new(
            "stub",
            LifecycleOptions {
                max_restarts_per_window: 2,
                ..LifecycleOptions::default()
            },
        ));
        for _ in 0..3 {
            health.record_start();
        }
        let guard = guard(3, 0).with_health(health);
        let cancel = CancellationToken::new();
        let err = guard
            .run(RunOptions::new("x"), &cancel, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is(LspErrorKind::CrashLoopQuarantined));
    }

    #[tokio::test(start_paused = true)]
    async fn fd_pressure_delays_instead_of_failing() {
        let health = Arc::new(LifecycleHealth::new("stub", LifecycleOptions::default()));
        health.observe_stderr("EMFILE: too many open files");
        let guard = guard(3, 0).with_health(health);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        guard
            .run(RunOptions::new("x"), &cancel, |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1400));
    }
}
