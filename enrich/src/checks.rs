//! Operator-facing degradation checks, each emitted at most once per run.

use std::collections::HashSet;

use typelift_lsp::{LspError, LspErrorKind};
use typelift_types::Check;

pub const INITIALIZE_FAILED: &str = "tooling_initialize_failed";
pub const CIRCUIT_OPEN: &str = "tooling_circuit_open";
pub const CRASH_LOOP_QUARANTINED: &str = "tooling_crash_loop_quarantined";
pub const FD_PRESSURE_BACKOFF: &str = "tooling_fd_pressure_backoff";
pub const DOCUMENT_SYMBOL_FAILED: &str = "tooling_document_symbol_failed";
pub const HOVER_TIMEOUT: &str = "tooling_hover_timeout";
pub const STAGE_TIMEOUT: &str = "tooling_stage_timeout";
pub const CAPABILITY_MISSING: &str = "tooling_capability_missing";
pub const DIAGNOSTICS_PER_URI_CAPPED: &str = "tooling_diagnostics_per_uri_capped";
pub const DIAGNOSTICS_URI_BUFFER_CAPPED: &str = "tooling_diagnostics_uri_buffer_capped";
pub const DIAGNOSTICS_PER_CHUNK_CAPPED: &str = "tooling_diagnostics_per_chunk_capped";
pub const SESSION_POISONED: &str = "tooling_session_poisoned";

#[derive(Debug, Default)]
pub struct CheckLog {
    seen: HashSet<String>,
    checks: Vec<Check>,
}

impl CheckLog {
    /// Record `check` unless one with the same name already exists.
    pub fn push_once(&mut self, check: Check) -> bool {
        if !self.seen.insert(check.name.clone()) {
            return false;
        }
        self.checks.push(check);
        true
    }

    /// Policy rejections map to their own check; anything else is not a
    /// policy failure and records nothing.
    pub fn push_policy(&mut self, provider: &str, err: &LspError) -> bool {
        let name = match err.kind() {
            LspErrorKind::CircuitOpen => CIRCUIT_OPEN,
            LspErrorKind::CrashLoopQuarantined => CRASH_LOOP_QUARANTINED,
            LspErrorKind::BackoffActive => FD_PRESSURE_BACKOFF,
            _ => return false,
        };
        self.push_once(Check::warn(name, format!("{provider}: {}", err.message())))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    #[must_use]
    pub fn into_checks(self) -> Vec<Check> {
        self.checks
    }
}
