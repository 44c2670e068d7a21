//! Error taxonomy for LSP tooling calls.
//!
//! Every failure carries a stable [`LspErrorKind`]; callers branch on the
//! kind, never on message text.

use std::time::Duration;

use thiserror::Error;

/// Stable, machine-readable failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LspErrorKind {
    /// The child process could not be spawned.
    Spawn,
    /// Framing or IO failure on the transport. Fails closed.
    Transport,
    /// The child's input stream closed or the process exited.
    TransportClosed,
    /// Per-request deadline elapsed; `$/cancelRequest` was sent.
    Timeout,
    /// The caller's cancellation signal fired.
    Cancelled,
    /// The request circuit breaker is open.
    CircuitOpen,
    /// Too many restarts inside the rolling window.
    CrashLoopQuarantined,
    /// A restart was attempted before the backoff window elapsed.
    BackoffActive,
    /// The server answered with a JSON-RPC error object.
    Protocol,
    /// The server does not advertise the requested feature.
    CapabilityMissing,
    /// The server answered with an unexpected shape.
    MalformedResponse,
}

impl LspErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "ERR_LSP_SPAWN",
            Self::Transport => "ERR_LSP_TRANSPORT",
            Self::TransportClosed => "ERR_LSP_TRANSPORT_CLOSED",
            Self::Timeout => "ERR_LSP_REQUEST_TIMEOUT",
            Self::Cancelled => "ABORT_ERR",
            Self::CircuitOpen => "TOOLING_CIRCUIT_OPEN",
            Self::CrashLoopQuarantined => "TOOLING_CRASH_LOOP",
            Self::BackoffActive => "ERR_LSP_BACKOFF",
            Self::Protocol => "ERR_LSP_PROTOCOL",
            Self::CapabilityMissing => "ERR_LSP_CAPABILITY_MISSING",
            Self::MalformedResponse => "ERR_LSP_MALFORMED_RESPONSE",
        }
    }

    /// Failures that indicate the session itself is no longer trustworthy.
    #[must_use]
    pub const fn poisons_session(self) -> bool {
        matches!(self, Self::Transport | Self::TransportClosed)
    }

    /// Policy rejections that never reached the server.
    #[must_use]
    pub const fn is_policy(self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::CrashLoopQuarantined | Self::BackoffActive
        )
    }
}

impl std::fmt::Display for LspErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LspError {
    kind: LspErrorKind,
    message: String,
    /// JSON-RPC error code for [`LspErrorKind::Protocol`].
    code: Option<i64>,
    /// Remaining wait for policy rejections that expire.
    retry_after: Option<Duration>,
}

impl LspError {
    pub fn new(kind: LspErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            retry_after: None,
        }
    }

    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(LspErrorKind::Protocol, message)
        }
    }

    pub fn timeout(method: &str, after: Duration) -> Self {
        Self::new(
            LspErrorKind::Timeout,
            format!("{method} timed out after {}ms", after.as_millis()),
        )
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(LspErrorKind::TransportClosed, message)
    }

    pub fn cancelled() -> Self {
        Self::new(LspErrorKind::Cancelled, "operation cancelled")
    }

    #[must_use]
    pub fn with_retry_after(mut self, remaining: Duration) -> Self {
        self.retry_after = Some(remaining);
        self
    }

    #[must_use]
    pub fn kind(&self) -> LspErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn code(&self) -> Option<i64> {
        self.code
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    #[must_use]
    pub fn is(&self, kind: LspErrorKind) -> bool {
        self.kind == kind
    }
}
