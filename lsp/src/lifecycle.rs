//! Lifecycle health: crash-loop quarantine and fd-pressure backoff.
//!
//! [`LifecycleHealth`] observes one supervisor's lifecycle events and stderr.
//! Restarts are counted in a rolling window; too many trips a quarantine that
//! fails every tooling call until the window rolls over. Resource exhaustion
//! text on stderr opens a short backoff during which callers sleep instead of
//! failing.

use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{LspError, LspErrorKind};
use crate::supervisor::LifecycleObserver;
use crate::types::{LifecycleEvent, LifecycleOptions};

static FD_PRESSURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(EMFILE|ENFILE|too many open files|file descriptor limit|out of file descriptors|resource temporarily unavailable)\b",
    )
    .expect("valid fd pressure regex")
});

/// Whether a stderr line signals resource exhaustion.
#[must_use]
pub fn is_fd_pressure(line: &str) -> bool {
    FD_PRESSURE.is_match(line)
}

#[derive(Debug, Default)]
struct HealthState {
    starts: VecDeque<Instant>,
    crashes: VecDeque<Instant>,
    crash_loop_trips: u64,
    quarantined_until: Option<Instant>,
    fd_pressure_events: u64,
    fd_backoff_until: Option<Instant>,
}

impl HealthState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .starts
            .front()
            .is_some_and(|at| now.duration_since(*at) >= window)
        {
            self.starts.pop_front();
        }
        while self
            .crashes
            .front()
            .is_some_and(|at| now.duration_since(*at) >= window)
        {
            self.crashes.pop_front();
        }
        if self.quarantined_until.is_some_and(|until| now >= until) {
            self.quarantined_until = None;
        }
        if self.fd_backoff_until.is_some_and(|until| now >= until) {
            self.fd_backoff_until = None;
        }
    }
}

/// Point-in-time view for the runtime summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSnapshot {
    pub starts_in_window: usize,
    pub crashes_in_window: usize,
    pub crash_loop_trips: u64,
    pub crash_loop_quarantined: bool,
    pub crash_loop_remaining_ms: Option<u64>,
    pub fd_pressure_events: u64,
    pub fd_pressure_backoff_active: bool,
    pub fd_pressure_backoff_remaining_ms: Option<u64>,
}

pub struct LifecycleHealth {
    name: String,
    options: LifecycleOptions,
    state: Mutex<HealthState>,
}

impl LifecycleHealth {
    pub fn new(name: impl Into<String>, options: LifecycleOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(HealthState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HealthState, Instant) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        state.prune(now, self.options.restart_window);
        f(&mut state, now)
    }

    pub fn record_start(&self) {
        let window = self.options.restart_window;
        let max = self.options.max_restarts_per_window as usize;
        let tripped = self.with_state(|state, now| {
            state.starts.push_back(now);
            if state.starts.len() <= max || state.quarantined_until.is_some() {
                return false;
            }
            let oldest = state.starts.front().copied().unwrap_or(now);
            state.quarantined_until = Some(oldest + window);
            state.crash_loop_trips += 1;
            true
        });
        if tripped {
            tracing::warn!(
                provider = %self.name,
                max_restarts = max,
                window_ms = window.as_millis() as u64,
                "crash-loop quarantine engaged"
            );
        }
    }

    pub fn record_crash(&self) {
        self.with_state(|state, now| state.crashes.push_back(now));
    }

    /// Inspect one stderr line; returns true when it opened a backoff window.
    pub fn observe_stderr(&self, line: &str) -> bool {
        if !is_fd_pressure(line) {
            return false;
        }
        let backoff = self.options.fd_pressure_backoff;
        self.with_state(|state, now| {
            state.fd_pressure_events += 1;
            state.fd_backoff_until = Some(now + backoff);
        });
        tracing::warn!(
            provider = %self.name,
            backoff_ms = backoff.as_millis() as u64,
            "fd pressure detected on stderr"
        );
        true
    }

    /// Fail fast while quarantined.
    pub fn check(&self) -> Result<(), LspError> {
        self.with_state(|state, now| match state.quarantined_until {
            Some(until) => Err(LspError::new(
                LspErrorKind::CrashLoopQuarantined,
                format!("{} crash-loop quarantine active", self.name),
            )
            .with_retry_after(until.saturating_duration_since(now))),
            None => Ok(()),
        })
    }

    /// Remaining fd-pressure backoff, if any.
    #[must_use]
    pub fn fd_pressure_delay(&self) -> Option<Duration> {
        self.with_state(|state, now| {
            state
                .fd_backoff_until
                .map(|until| until.saturating_duration_since(now))
                .filter(|remaining| !remaining.is_zero())
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.with_state(|state, now| {
            let remaining_ms =
                |until: Option<Instant>| until.map(|u| u.saturating_duration_since(now).as_millis() as u64);
            LifecycleSnapshot {
                starts_in_window: state.starts.len(),
                crashes_in_window: state.crashes.len(),
                crash_loop_trips: state.crash_loop_trips,
                crash_loop_quarantined: state.quarantined_until.is_some(),
                crash_loop_remaining_ms: remaining_ms(state.quarantined_until),
                fd_pressure_events: state.fd_pressure_events,
                fd_pressure_backoff_active: state.fd_backoff_until.is_some(),
                fd_pressure_backoff_remaining_ms: remaining_ms(state.fd_backoff_until),
            }
        })
    }
}

impl LifecycleObserver for LifecycleHealth {
    fn on_lifecycle(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Start { .. } => self.record_start(),
            LifecycleEvent::Exit {
                expected: false, ..
            } => self.record_crash(),
            _ => {}
        }
    }

    fn on_stderr(&self, line: &str) {
        self.observe_stderr(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(max_restarts: u32) -> LifecycleHealth {
        LifecycleHealth::new(
            "clangd",
            LifecycleOptions {
                restart_window: Duration::from_secs(10),
                max_restarts_per_window: max_restarts,
                fd_pressure_backoff: Duration::from_millis(200),
            },
        )
    }

    #[test]
    fn detects_fd_pressure_signatures() {
        assert!(is_fd_pressure("Error: EMFILE: too many open files, watch"));
        assert!(is_fd_pressure("accept failed: Too many open files"));
        assert!(!is_fd_pressure("indexing 42 files"));
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_trips_after_too_many_starts_and_rolls_over() {
        let health = health(2);
        health.record_start();
        health.record_start();
        assert!(health.check().is_ok());

        health.record_start();
        let err = health.check().unwrap_err();
        assert!(err.is(LspErrorKind::CrashLoopQuarantined));
        assert_eq!(health.snapshot().crash_loop_trips, 1);

        // Further starts inside the same quarantine do not count as new trips.
        health.record_start();
        assert_eq!(health.snapshot().crash_loop_trips, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(health.check().is_ok());
        let snapshot = health.snapshot();
        assert!(!snapshot.crash_loop_quarantined);
        assert_eq!(snapshot.starts_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fd_pressure_opens_a_fixed_backoff() {
        let health = health(6);
        assert!(health.fd_pressure_delay().is_none());
        assert!(health.observe_stderr("EMFILE: too many open files"));
        let delay = health.fd_pressure_delay().unwrap();
        assert!(delay <= Duration::from_millis(200));
        assert!(health.snapshot().fd_pressure_backoff_active);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(health.fd_pressure_delay().is_none());
        assert_eq!(health.snapshot().fd_pressure_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_unexpected_exits_count_as_crashes() {
        let health = health(6);
        health.on_lifecycle(&LifecycleEvent::Exit {
            generation: 1,
            code: Some(0),
            expected: true,
        });
        health.on_lifecycle(&LifecycleEvent::Exit {
            generation: 2,
            code: None,
            expected: false,
        });
        assert_eq!(health.snapshot().crashes_in_window, 1);
    }
}
