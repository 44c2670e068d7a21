//! Per-document enrichment: open, collect symbols, run the fallback chain,
//! offer the best signature per chunk, close.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use typelift_lsp::protocol::{did_close_params, did_open_params, text_document_params};
use typelift_lsp::{CapabilityMask, Lease, LspError, LspErrorKind};
use typelift_types::{Check, ChunkRef, Document, SignatureInfo, Symbol, Target};

use crate::checks::{self, CheckLog};
use crate::error::EnrichError;
use crate::hover_cache::{HoverCache, hover_cache_key};
use crate::line_index::LineIndex;
use crate::materialize::{DocumentMaterializer, language_id_for_path};
use crate::merge::{merge_opt, outranks, selection_score};
use crate::metrics::{HoverMetrics, RequestOutcome, SkipReason};
use crate::options::{PipelineOptions, Stage};
use crate::parser::ParseCache;
use crate::signature::Completeness;
use crate::stages::{StageLimiters, Suppression, SymbolContext, guarded_request, interpret, request_stage};
use crate::symbols::flatten_symbols;
use crate::target::{find_target, source_signature_candidate};

const DOCUMENT_VERSION: i32 = 1;

/// Best candidate seen so far for one chunk.
#[derive(Debug, Clone)]
pub struct Selection {
    pub chunk: ChunkRef,
    pub score: f64,
    pub info: SignatureInfo,
}

/// A document that reached `didOpen`.
#[derive(Debug, Clone)]
pub struct OpenedDocument {
    pub uri: String,
    pub virtual_path: String,
}

/// Mutable run state shared by concurrently processed documents.
#[derive(Debug, Default)]
pub struct RunState {
    pub hover_cache: HoverCache,
    pub metrics: HoverMetrics,
    pub checks: CheckLog,
    pub suppression: Suppression,
    pub selections: HashMap<String, Selection>,
    pub opened: Vec<OpenedDocument>,
    /// Set when the transport failed underneath a request.
    pub poison_reason: Option<String>,
}

impl RunState {
    fn offer(&mut self, uid: &str, chunk: &ChunkRef, score: f64, info: SignatureInfo) {
        if let Some(current) = self.selections.get(uid)
            && !outranks(score, &info, current.score, &current.info)
        {
            return;
        }
        self.selections.insert(
            uid.to_string(),
            Selection {
                chunk: chunk.clone(),
                score,
                info,
            },
        );
    }

    /// Policy rejections become checks; transport failures poison the
    /// session at the end of the run.
    fn record_failure(&mut self, provider: &str, err: &LspError) {
        self.checks.push_policy(provider, err);
        if err.kind().poisons_session() && self.poison_reason.is_none() {
            self.poison_reason = Some(err.to_string());
        }
    }
}

enum StageResult {
    NotRequested,
    Failed,
    Answered(Option<SignatureInfo>),
}

/// Per-document bookkeeping that never leaves the document's task.
#[derive(Default)]
struct DocumentScope {
    /// Raw responses by `(stage, position)`; `None` records a failure.
    memo: HashMap<(Stage, String), Option<Value>>,
    requests: HashMap<Stage, usize>,
}

/// One document's view of the symbol being enriched.
struct SymbolJob<'a> {
    document: &'a Document,
    uri: &'a str,
    language_id: &'a str,
    symbol: &'a Symbol,
    index: &'a LineIndex<'a>,
}

pub struct DocumentRunner<'a> {
    pub lease: &'a Lease,
    pub options: &'a PipelineOptions,
    pub capabilities: CapabilityMask,
    /// Server command, used for cache keys and provenance.
    pub provider: &'a str,
    pub root_dir: &'a Path,
    pub materializer: &'a dyn DocumentMaterializer,
    pub parser: ParseCache<'a>,
    pub limiters: StageLimiters,
    pub cancel: CancellationToken,
    pub state: Mutex<RunState>,
}

impl DocumentRunner<'_> {
    pub fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_cancel(&self) -> Result<(), EnrichError> {
        if self.cancel.is_cancelled() {
            return Err(EnrichError::Cancelled);
        }
        Ok(())
    }

    /// Enrich one document. Soft failures become checks; only cancellation
    /// and a strict-mode missing `chunkUid` are errors.
    pub async fn process(&self, document: &Document, targets: &[Target]) -> Result<(), EnrichError> {
        self.check_cancel()?;
        let language_id = document
            .language_id
            .as_deref()
            .unwrap_or_else(|| language_id_for_path(&document.virtual_path));
        let uri = match self.materializer.materialize(self.root_dir, document) {
            Ok(uri) => uri,
            Err(err) => {
                tracing::warn!(path = %document.virtual_path, "failed to materialize document: {err}");
                return Ok(());
            }
        };

        let open = did_open_params(&uri, language_id, DOCUMENT_VERSION, &document.text);
        if let Err(err) = self
            .lease
            .supervisor()
            .notify("textDocument/didOpen", Some(open))
            .await
        {
            tracing::warn!(uri = %uri, "didOpen failed: {err}");
            self.state().record_failure(self.provider, &err);
            return Ok(());
        }
        self.state().opened.push(OpenedDocument {
            uri: uri.clone(),
            virtual_path: document.virtual_path.clone(),
        });

        let outcome = self.enrich_open_document(document, &uri, language_id, targets).await;

        if let Err(err) = self
            .lease
            .supervisor()
            .notify("textDocument/didClose", Some(did_close_params(&uri)))
            .await
        {
            tracing::debug!(uri = %uri, "didClose failed: {err}");
        }
        outcome
    }

    async fn document_symbols(&self, uri: &str) -> Result<Option<Vec<Symbol>>, EnrichError> {
        if !self.capabilities.document_symbol {
            self.state().checks.push_once(Check::info(
                checks::CAPABILITY_MISSING,
                format!("{} does not advertise textDocument/documentSymbol", self.provider),
            ));
            return Ok(None);
        }
        let response = guarded_request(
            self.lease,
            "textDocument/documentSymbol",
            text_document_params(uri),
            self.options.document_symbol_timeout,
            &self.cancel,
        )
        .await;
        match response {
            Ok(value) => Ok(Some(flatten_symbols(&value))),
            Err(err) if err.is(LspErrorKind::Cancelled) => Err(EnrichError::Cancelled),
            Err(err) => {
                tracing::warn!(uri = %uri, kind = err.kind().as_str(), "documentSymbol failed: {err}");
                let mut state = self.state();
                if !err.kind().is_policy() {
                    state.checks.push_once(Check::warn(
                        checks::DOCUMENT_SYMBOL_FAILED,
                        format!("{}: documentSymbol failed: {}", self.provider, err.message()),
                    ));
                }
                state.record_failure(self.provider, &err);
                Ok(None)
            }
        }
    }

    async fn enrich_open_document(
        &self,
        document: &Document,
        uri: &str,
        language_id: &str,
        targets: &[Target],
    ) -> Result<(), EnrichError> {
        let Some(symbols) = self.document_symbols(uri).await? else {
            return Ok(());
        };
        tracing::debug!(uri = %uri, symbols = symbols.len(), "collected document symbols");
        let index = LineIndex::new(&document.text);
        let mut scope = DocumentScope::default();

        for symbol in &symbols {
            self.check_cancel()?;
            let offsets = index.range_to_offsets(symbol.anchor_range());
            let Some(target) = find_target(targets, offsets, Some(&symbol.name)) else {
                continue;
            };
            let Some(uid) = target.chunk_uid() else {
                if self.options.strict {
                    return Err(EnrichError::MissingChunkUid {
                        virtual_path: document.virtual_path.clone(),
                        symbol: symbol.name.clone(),
                    });
                }
                tracing::debug!(path = %document.virtual_path, symbol = %symbol.name, "target has no chunkUid, skipping");
                continue;
            };
            let job = SymbolJob {
                document,
                uri,
                language_id,
                symbol,
                index: &index,
            };
            let Some(info) = self.enrich_symbol(&job, target, &mut scope).await? else {
                continue;
            };
            let detail = symbol.detail_or_name();
            let score = selection_score(&info, symbol, target, Some(detail));
            self.state().offer(uid, &target.chunk_ref, score, info);
        }
        Ok(())
    }

    async fn enrich_symbol(
        &self,
        job: &SymbolJob<'_>,
        target: &Target,
        scope: &mut DocumentScope,
    ) -> Result<Option<SignatureInfo>, EnrichError> {
        let detail = job.symbol.detail_or_name();
        let mut info = self.parser.parse(detail, job.language_id, &job.symbol.name);
        let is_complete =
            |info: Option<&SignatureInfo>| Completeness::of(info, Some(detail)).is_complete();

        if is_complete(info.as_ref()) {
            self.state()
                .metrics
                .record_skip(&job.document.virtual_path, Stage::Hover, SkipReason::ReturnSufficient);
            return Ok(info);
        }
        self.state().metrics.record_incomplete();

        let candidate = source_signature_candidate(&job.document.text, target.virtual_range);
        let mut reasons = Vec::new();
        for stage in Stage::ALL {
            if is_complete(info.as_ref()) {
                break;
            }
            if stage.is_expensive() && candidate.is_some() {
                reasons.push(format!("{}_not_requested", stage.label()));
                continue;
            }
            match self.run_stage(stage, job, scope).await? {
                StageResult::NotRequested => reasons.push(format!("{}_not_requested", stage.label())),
                StageResult::Failed | StageResult::Answered(None) => {
                    reasons.push(format!("{}_failed", stage.label()));
                }
                StageResult::Answered(Some(next)) => {
                    info = merge_opt(info, Some(next));
                    if !is_complete(info.as_ref()) {
                        reasons.push(format!("{}_incomplete", stage.label()));
                    }
                }
            }
        }

        if !is_complete(info.as_ref())
            && let Some(candidate) = candidate
            && let Some(parsed) = self.parser.parse(&candidate, job.language_id, &job.symbol.name)
        {
            info = merge_opt(info, Some(parsed));
            self.state().metrics.record_fallback(reasons);
        }
        Ok(info.filter(|info| !info.is_empty()))
    }

    /// First applicable reason to skip `stage`, in precedence order.
    fn skip_reason(&self, stage: Stage, job: &SymbolJob<'_>, scope: &DocumentScope) -> Option<SkipReason> {
        let options = self.options.stages.get(stage);
        if !options.allows_kind(job.symbol.kind) {
            return Some(SkipReason::Kind);
        }
        let used = scope.requests.get(&stage).copied().unwrap_or(0);
        if options.max_per_file.is_some_and(|budget| used >= budget) {
            return Some(SkipReason::Budget);
        }
        let state = self.state();
        if state.suppression.is_globally_disabled() {
            return Some(SkipReason::GlobalDisable);
        }
        if state
            .suppression
            .is_file_disabled(&job.document.virtual_path, stage)
        {
            return Some(SkipReason::AdaptiveDisable);
        }
        None
    }

    async fn run_stage(
        &self,
        stage: Stage,
        job: &SymbolJob<'_>,
        scope: &mut DocumentScope,
    ) -> Result<StageResult, EnrichError> {
        let options = self.options.stages.get(stage);
        if !options.enabled {
            return Ok(StageResult::NotRequested);
        }
        if !stage.supported_by(&self.capabilities) {
            self.state().checks.push_once(Check::info(
                checks::CAPABILITY_MISSING,
                format!("{} does not advertise {}", self.provider, stage.method()),
            ));
            return Ok(StageResult::NotRequested);
        }
        let position = job.symbol.anchor_position();
        let cx = SymbolContext {
            uri: job.uri,
            index: job.index,
            language_id: job.language_id,
            symbol_name: &job.symbol.name,
            parser: &self.parser,
        };

        // Memo hits send nothing; budgets and suppression gate requests only.
        let memo_key = (stage, position.key());
        if let Some(memoized) = scope.memo.get(&memo_key) {
            if stage == Stage::Hover {
                self.state().metrics.record_hover_triggered();
            }
            return Ok(match memoized {
                Some(response) => StageResult::Answered(interpret(stage, response, &cx)),
                None => StageResult::Failed,
            });
        }

        let path = job.document.virtual_path.as_str();
        if let Some(reason) = self.skip_reason(stage, job, scope) {
            self.state().metrics.record_skip(path, stage, reason);
            return Ok(StageResult::NotRequested);
        }
        if stage == Stage::Hover {
            self.state().metrics.record_hover_triggered();
        }

        let cache_key = (stage == Stage::Hover)
            .then(|| {
                hover_cache_key(
                    self.provider,
                    job.language_id,
                    job.document.doc_hash.as_deref(),
                    &job.symbol.name,
                    position,
                )
            })
            .flatten();
        if let Some(key) = &cache_key
            && let Some(hit) = self.state().hover_cache.get(key)
        {
            return Ok(StageResult::Answered(Some(hit)));
        }

        let permit = self
            .limiters
            .acquire(stage, &self.cancel)
            .await
            .map_err(|_| EnrichError::Cancelled)?;
        *scope.requests.entry(stage).or_default() += 1;
        let started = Instant::now();
        let response = request_stage(self.lease, stage, job.uri, position, options.timeout, &self.cancel).await;
        let elapsed = started.elapsed();
        drop(permit);

        match response {
            Ok(response) => {
                let info = interpret(stage, &response, &cx);
                let outcome = if info.is_some() {
                    RequestOutcome::Succeeded
                } else {
                    RequestOutcome::Empty
                };
                let mut state = self.state();
                state.metrics.record_request(path, stage, elapsed, outcome);
                if let (Some(key), Some(info)) = (cache_key, &info) {
                    state.hover_cache.insert(key, info.clone());
                }
                drop(state);
                scope.memo.insert(memo_key, Some(response));
                Ok(StageResult::Answered(info))
            }
            Err(err) if err.is(LspErrorKind::Cancelled) => Err(EnrichError::Cancelled),
            Err(err) if err.is(LspErrorKind::Timeout) => {
                self.record_timeout(stage, path, elapsed, &err);
                scope.memo.insert(memo_key, None);
                Ok(StageResult::Failed)
            }
            Err(err) => {
                tracing::debug!(uri = %job.uri, method = stage.method(), kind = err.kind().as_str(), "stage request failed: {err}");
                let mut state = self.state();
                state
                    .metrics
                    .record_request(path, stage, elapsed, RequestOutcome::Failed);
                state.record_failure(self.provider, &err);
                drop(state);
                scope.memo.insert(memo_key, None);
                Ok(StageResult::Failed)
            }
        }
    }

    fn record_timeout(&self, stage: Stage, path: &str, elapsed: std::time::Duration, err: &LspError) {
        let options = self.options.stages.get(stage);
        let mut state = self.state();
        state
            .metrics
            .record_request(path, stage, elapsed, RequestOutcome::TimedOut);
        let effect = state.suppression.record_timeout(
            path,
            stage,
            options.disable_after_timeouts,
            self.options.global_disable_after_timeouts,
        );
        if effect.file_disabled {
            state.metrics.mark_disabled(path, stage);
            tracing::warn!(path, stage = stage.label(), "stage disabled for file after repeated timeouts");
        }
        if effect.global_disabled {
            tracing::warn!(stage = stage.label(), "all stages disabled for the rest of the run after repeated timeouts");
        }
        let name = if stage == Stage::Hover {
            checks::HOVER_TIMEOUT
        } else {
            checks::STAGE_TIMEOUT
        };
        state.checks.push_once(Check::warn(
            name,
            format!("{}: {}", self.provider, err.message()),
        ));
    }
}
