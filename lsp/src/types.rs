//! Public option and event types.
//!
//! Callers build a [`SessionOptions`] (usually from the config crate) and
//! hand it to the [`crate::SessionPool`]. Every knob has a documented default
//! and a floor; [`SessionOptions::normalized`] applies them.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::codec::FrameLimits;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(2500);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(250);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);
pub const MIN_RESTART_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RESTARTS_PER_WINDOW: u32 = 6;
pub const MIN_MAX_RESTARTS_PER_WINDOW: u32 = 2;
pub const DEFAULT_FD_PRESSURE_BACKOFF: Duration = Duration::from_millis(1500);
pub const MIN_FD_PRESSURE_BACKOFF: Duration = Duration::from_millis(50);

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(10 * 60);
pub const MIN_SESSION_TIMER: Duration = Duration::from_secs(1);

/// How to launch one language server process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Run through the platform shell instead of resolving `cmd` on PATH.
    pub shell: bool,
}

impl CommandSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Timing knobs for one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub request_timeout: Duration,
    pub initialize_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Wait after `exit` before force-killing.
    pub kill_grace: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub frame_limits: FrameLimits,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initialize_timeout: DEFAULT_INITIALIZE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            frame_limits: FrameLimits::default(),
        }
    }
}

/// Circuit breaker and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuardOptions {
    /// Default per-call timeout handed to the guarded closure.
    pub timeout: Duration,
    /// Extra attempts after a non-timeout failure.
    pub retries: u32,
    pub breaker_threshold: u32,
    /// How long the circuit stays open once tripped.
    pub cooldown: Duration,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            cooldown: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Crash-loop and fd-pressure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleOptions {
    pub restart_window: Duration,
    pub max_restarts_per_window: u32,
    pub fd_pressure_backoff: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            restart_window: DEFAULT_RESTART_WINDOW,
            max_restarts_per_window: DEFAULT_MAX_RESTARTS_PER_WINDOW,
            fd_pressure_backoff: DEFAULT_FD_PRESSURE_BACKOFF,
        }
    }
}

/// Everything that identifies and configures one pooled session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub repo_root: PathBuf,
    pub provider_id: String,
    pub workspace_key: Option<String>,
    pub command: CommandSpec,
    pub initialization_options: Option<serde_json::Value>,
    pub supervisor: SupervisorOptions,
    pub guard: GuardOptions,
    pub lifecycle: LifecycleOptions,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// When false every lease gets a single-use session.
    pub pooling: bool,
}

impl SessionOptions {
    pub fn new(repo_root: impl Into<PathBuf>, command: CommandSpec) -> Self {
        let provider_id = command.cmd.clone();
        Self {
            repo_root: repo_root.into(),
            provider_id,
            workspace_key: None,
            command,
            initialization_options: None,
            supervisor: SupervisorOptions::default(),
            guard: GuardOptions::default(),
            lifecycle: LifecycleOptions::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            pooling: true,
        }
    }

    /// Apply floors so a misconfigured knob cannot spin or starve.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let floor = |value: Duration, min: Duration| value.max(min);
        self.guard.timeout = floor(self.guard.timeout, Duration::from_millis(1));
        self.guard.breaker_threshold = self.guard.breaker_threshold.max(1);
        self.lifecycle.restart_window = floor(self.lifecycle.restart_window, MIN_RESTART_WINDOW);
        self.lifecycle.max_restarts_per_window = self
            .lifecycle
            .max_restarts_per_window
            .max(MIN_MAX_RESTARTS_PER_WINDOW);
        self.lifecycle.fd_pressure_backoff =
            floor(self.lifecycle.fd_pressure_backoff, MIN_FD_PRESSURE_BACKOFF);
        self.idle_timeout = floor(self.idle_timeout, MIN_SESSION_TIMER);
        self.max_lifetime = floor(self.max_lifetime, MIN_SESSION_TIMER);
        self
    }
}

/// Process lifecycle notifications emitted by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start { generation: u64, pid: Option<u32> },
    /// `expected` is false when nobody asked the process to stop.
    Exit {
        generation: u64,
        code: Option<i32>,
        expected: bool,
    },
    Error { generation: u64, message: String },
    Kill { generation: u64 },
    /// The writer closed under in-flight requests; they were rejected.
    Reap { generation: u64, pending: usize },
}

impl LifecycleEvent {
    #[must_use]
    pub fn generation(&self) -> u64 {
        match self {
            Self::Start { generation, .. }
            | Self::Exit { generation, .. }
            | Self::Error { generation, .. }
            | Self::Kill { generation }
            | Self::Reap { generation, .. } => *generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_applies_floors() {
        let mut options = SessionOptions::new("/repo", CommandSpec::new("clangd"));
        options.lifecycle.max_restarts_per_window = 0;
        options.lifecycle.fd_pressure_backoff = Duration::from_millis(1);
        options.idle_timeout = Duration::from_millis(10);
        options.guard.breaker_threshold = 0;
        let options = options.normalized();
        assert_eq!(options.lifecycle.max_restarts_per_window, 2);
        assert_eq!(options.lifecycle.fd_pressure_backoff, MIN_FD_PRESSURE_BACKOFF);
        assert_eq!(options.idle_timeout, MIN_SESSION_TIMER);
        assert_eq!(options.guard.breaker_threshold, 1);
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = SessionOptions::new("/repo", CommandSpec::new("pyright-langserver"));
        assert_eq!(options.provider_id, "pyright-langserver");
        assert_eq!(options.guard.retries, 2);
        assert_eq!(options.guard.breaker_threshold, 3);
        assert_eq!(options.lifecycle.restart_window, Duration::from_secs(60));
        assert_eq!(options.idle_timeout, Duration::from_millis(1500));
        assert_eq!(options.max_lifetime, Duration::from_secs(600));
        assert!(options.pooling);
    }
}
