//! Pipeline knobs. Every field degrades to a documented default.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use typelift_lsp::CapabilityMask;
use typelift_types::SymbolKind;

pub const DEFAULT_DOCUMENT_SYMBOL_CONCURRENCY: usize = 4;
pub const DEFAULT_STAGE_CONCURRENCY: usize = 8;
pub const MAX_CONCURRENCY: usize = 64;

pub const DEFAULT_HOVER_CACHE_MAX_ENTRIES: usize = 50_000;
pub const MIN_HOVER_CACHE_MAX_ENTRIES: usize = 1_000;
pub const MAX_HOVER_CACHE_MAX_ENTRIES: usize = 200_000;

pub const DEFAULT_MAX_DIAGNOSTICS_PER_CHUNK: usize = 100;
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Floor for caller-supplied stage timeouts.
pub const MIN_STAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// One fallback stage, in cost order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Hover,
    SignatureHelp,
    Definition,
    TypeDefinition,
    References,
}

impl Stage {
    pub const ALL: [Self; 5] = [
        Self::Hover,
        Self::SignatureHelp,
        Self::Definition,
        Self::TypeDefinition,
        Self::References,
    ];

    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Hover => "textDocument/hover",
            Self::SignatureHelp => "textDocument/signatureHelp",
            Self::Definition => "textDocument/definition",
            Self::TypeDefinition => "textDocument/typeDefinition",
            Self::References => "textDocument/references",
        }
    }

    /// Snake-case name used in fallback reasons and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Hover => "hover",
            Self::SignatureHelp => "signature_help",
            Self::Definition => "definition",
            Self::TypeDefinition => "type_definition",
            Self::References => "references",
        }
    }

    /// Cross-reference queries, skipped when a local source candidate exists.
    #[must_use]
    pub const fn is_expensive(self) -> bool {
        matches!(self, Self::Definition | Self::TypeDefinition | Self::References)
    }

    #[must_use]
    pub fn supported_by(self, capabilities: &CapabilityMask) -> bool {
        match self {
            Self::Hover => capabilities.hover,
            Self::SignatureHelp => capabilities.signature_help,
            Self::Definition => capabilities.definition,
            Self::TypeDefinition => capabilities.type_definition,
            Self::References => capabilities.references,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOptions {
    pub enabled: bool,
    /// Falls back to the session's request timeout.
    pub timeout: Option<Duration>,
    pub concurrency: usize,
    /// Requests per document; `None` is unlimited.
    pub max_per_file: Option<usize>,
    /// Timeouts before the stage is suppressed; `None` never suppresses.
    pub disable_after_timeouts: Option<u32>,
    /// Allowed `SymbolKind` codes; `None` allows all.
    pub symbol_kinds: Option<BTreeSet<u32>>,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: None,
            concurrency: DEFAULT_STAGE_CONCURRENCY,
            max_per_file: None,
            disable_after_timeouts: None,
            symbol_kinds: None,
        }
    }
}

impl StageOptions {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn allows_kind(&self, kind: SymbolKind) -> bool {
        self.symbol_kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&kind.0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSet {
    pub hover: StageOptions,
    pub signature_help: StageOptions,
    pub definition: StageOptions,
    pub type_definition: StageOptions,
    pub references: StageOptions,
}

impl StageSet {
    #[must_use]
    pub fn get(&self, stage: Stage) -> &StageOptions {
        match stage {
            Stage::Hover => &self.hover,
            Stage::SignatureHelp => &self.signature_help,
            Stage::Definition => &self.definition,
            Stage::TypeDefinition => &self.type_definition,
            Stage::References => &self.references,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageOptions {
        match stage {
            Stage::Hover => &mut self.hover,
            Stage::SignatureHelp => &mut self.signature_help,
            Stage::Definition => &mut self.definition,
            Stage::TypeDefinition => &mut self.type_definition,
            Stage::References => &mut self.references,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Escalate a symbol mapped to a chunk without `chunkUid`.
    pub strict: bool,
    pub capture_diagnostics: bool,
    pub document_symbol_concurrency: usize,
    pub document_symbol_timeout: Option<Duration>,
    pub stages: StageSet,
    /// Cross-stage timeout count that suppresses every stage. Defaults to
    /// each stage's own `disable_after_timeouts`.
    pub global_disable_after_timeouts: Option<u32>,
    /// Hover cache lives under `<cache_root>/lsp/`; disabled when absent.
    pub cache_root: Option<PathBuf>,
    pub hover_cache_max_entries: usize,
    /// Return cache write failures instead of logging them.
    pub surface_cache_errors: bool,
    pub max_diagnostic_uris: usize,
    pub max_diagnostics_per_uri: usize,
    pub max_diagnostics_per_chunk: usize,
    pub diagnostics_drain_window: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            strict: true,
            capture_diagnostics: false,
            document_symbol_concurrency: DEFAULT_DOCUMENT_SYMBOL_CONCURRENCY,
            document_symbol_timeout: None,
            stages: StageSet::default(),
            global_disable_after_timeouts: None,
            cache_root: None,
            hover_cache_max_entries: DEFAULT_HOVER_CACHE_MAX_ENTRIES,
            surface_cache_errors: false,
            max_diagnostic_uris: typelift_lsp::diagnostics::DEFAULT_MAX_URIS,
            max_diagnostics_per_uri: typelift_lsp::diagnostics::DEFAULT_MAX_PER_URI,
            max_diagnostics_per_chunk: DEFAULT_MAX_DIAGNOSTICS_PER_CHUNK,
            diagnostics_drain_window: DEFAULT_DRAIN_WINDOW,
        }
    }
}

impl PipelineOptions {
    /// Clamp every knob into its supported range.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let clamp = |value: usize| value.clamp(1, MAX_CONCURRENCY);
        self.document_symbol_concurrency = clamp(self.document_symbol_concurrency);
        self.document_symbol_timeout = self.document_symbol_timeout.map(|t| t.max(MIN_STAGE_TIMEOUT));
        for stage in Stage::ALL {
            let options = self.stages.get_mut(stage);
            options.concurrency = clamp(options.concurrency);
            options.timeout = options.timeout.map(|t| t.max(MIN_STAGE_TIMEOUT));
            options.disable_after_timeouts = options.disable_after_timeouts.map(|n| n.max(1));
            if options.symbol_kinds.as_ref().is_some_and(BTreeSet::is_empty) {
                options.symbol_kinds = None;
            }
        }
        self.global_disable_after_timeouts = self.global_disable_after_timeouts.map(|n| n.max(1));
        self.hover_cache_max_entries = self
            .hover_cache_max_entries
            .clamp(MIN_HOVER_CACHE_MAX_ENTRIES, MAX_HOVER_CACHE_MAX_ENTRIES);
        self.max_diagnostic_uris = self.max_diagnostic_uris.max(1);
        self.max_diagnostics_per_uri = self.max_diagnostics_per_uri.max(1);
        self.max_diagnostics_per_chunk = self.max_diagnostics_per_chunk.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_ranges() {
        let mut options = PipelineOptions {
            document_symbol_concurrency: 0,
            hover_cache_max_entries: 5,
            ..PipelineOptions::default()
        };
        options.stages.hover.concurrency = 500;
        options.stages.hover.timeout = Some(Duration::from_millis(10));
        options.stages.hover.disable_after_timeouts = Some(0);
        options.stages.hover.symbol_kinds = Some(BTreeSet::new());

        let options = options.normalized();
        assert_eq!(options.document_symbol_concurrency, 1);
        assert_eq!(options.hover_cache_max_entries, MIN_HOVER_CACHE_MAX_ENTRIES);
        assert_eq!(options.stages.hover.concurrency, MAX_CONCURRENCY);
        assert_eq!(options.stages.hover.timeout, Some(MIN_STAGE_TIMEOUT));
        assert_eq!(options.stages.hover.disable_after_timeouts, Some(1));
        assert!(options.stages.hover.symbol_kinds.is_none());
    }

    #[test]
    fn stages_are_cost_ordered() {
        let expensive: Vec<_> = Stage::ALL.iter().filter(|s| s.is_expensive()).collect();
        assert_eq!(expensive.len(), 3);
        assert!(Stage::Hover < Stage::SignatureHelp);
        assert!(Stage::SignatureHelp < Stage::Definition);
    }

    #[test]
    fn kind_filter() {
        let mut stage = StageOptions::default();
        assert!(stage.allows_kind(SymbolKind::CLASS));
        stage.symbol_kinds = Some([12].into_iter().collect());
        assert!(stage.allows_kind(SymbolKind::FUNCTION));
        assert!(!stage.allows_kind(SymbolKind::CLASS));
    }
}
