use serde::{Deserialize, Serialize};

use crate::position::Range;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A `publishDiagnostics` entry, kept close to its wire shape so it can be
/// handed back to callers unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LspDiagnostic {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    /// Resolved severity; unknown or absent values read as warnings.
    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Warning)
    }

    /// Identity used to drop repeated diagnostics:
    /// `code|severity|source|message|start|end`.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        let code = match &self.code {
            Some(serde_json::Value::String(code)) => code.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        format!(
            "{code}|{}|{}|{}|{}:{}|{}:{}",
            self.severity.map(|s| s.to_string()).unwrap_or_default(),
            self.source.as_deref().unwrap_or_default(),
            self.message,
            self.range.start.line,
            self.range.start.character,
            self.range.end.line,
            self.range.end.character,
        )
    }
}
