//! The enrichment run: lease a session, initialize it once, fan documents
//! out, shape diagnostics, persist the cache and report.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use typelift_lsp::protocol::path_to_file_uri;
use typelift_lsp::{
    CapabilityMask, DiagnosticsBuffer, Lease, LspError, LspErrorKind, NotificationSink, RunOptions,
    SessionOptions, SessionPool,
};
use typelift_types::{Check, Document, Target};

use crate::checks::{self, CheckLog};
use crate::diagnostics::{buffer_checks, shape_diagnostics};
use crate::document::{DocumentRunner, RunState};
use crate::error::EnrichError;
use crate::hover_cache::HoverCache;
use crate::materialize::{DocumentMaterializer, PathMaterializer};
use crate::options::PipelineOptions;
use crate::output::{ChunkEnrichment, EnrichmentResult, Provenance, RuntimeSummary, TypePayload};
use crate::parser::{ParseCache, SignatureParser};
use crate::stages::StageLimiters;
use crate::target::TargetsByPath;

/// One enrichment run. Documents are materialized under
/// `session.repo_root`, which is also the workspace root sent in
/// `initialize`.
pub struct PipelineInput<'a> {
    pub session: SessionOptions,
    pub documents: Vec<Document>,
    pub targets: Vec<Target>,
    pub parser: &'a dyn SignatureParser,
    pub materializer: &'a dyn DocumentMaterializer,
    pub options: PipelineOptions,
    pub cancel: CancellationToken,
}

impl<'a> PipelineInput<'a> {
    pub fn new(session: SessionOptions, parser: &'a dyn SignatureParser) -> Self {
        Self {
            session,
            documents: Vec::new(),
            targets: Vec::new(),
            parser,
            materializer: &PathMaterializer,
            options: PipelineOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_documents(mut self, documents: Vec<Document>, targets: Vec<Target>) -> Self {
        self.documents = documents;
        self.targets = targets;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_materializer(mut self, materializer: &'a dyn DocumentMaterializer) -> Self {
        self.materializer = materializer;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs enrichment against sessions from one pool.
#[derive(Clone, Default)]
pub struct Enricher {
    pool: SessionPool,
}

fn runtime_summary(lease: &Lease, capabilities: Option<CapabilityMask>) -> RuntimeSummary {
    RuntimeSummary {
        capabilities,
        lifecycle: lease.health().snapshot(),
        guard: lease.guard().snapshot(),
        pooling: lease.snapshot(),
        requests: lease.supervisor().metrics().snapshot(),
    }
}

impl Enricher {
    #[must_use]
    pub fn new(pool: SessionPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn run(&self, input: PipelineInput<'_>) -> Result<EnrichmentResult, EnrichError> {
        let options = input.options.clone().normalized();
        let targets = TargetsByPath::new(&input.targets);
        let work: Vec<(&Document, &[Target])> = input
            .documents
            .iter()
            .filter_map(|document| {
                let targets = targets.get(&document.virtual_path);
                (!targets.is_empty()).then_some((document, targets))
            })
            .collect();
        if work.is_empty() {
            return Ok(EnrichmentResult::default());
        }
        if input.cancel.is_cancelled() {
            return Err(EnrichError::Cancelled);
        }

        let provider = input.session.command.cmd.clone();
        let mut checks = CheckLog::default();
        let lease = match self.pool.acquire(&input.session, &input.cancel).await {
            Ok(lease) => lease,
            Err(err) if err.is(LspErrorKind::Cancelled) => return Err(EnrichError::Cancelled),
            Err(err) => {
                tracing::warn!(cmd = %provider, "failed to lease a session: {err}");
                if !checks.push_policy(&provider, &err) {
                    checks.push_once(Check::warn(
                        checks::INITIALIZE_FAILED,
                        format!("{provider}: {}", err.message()),
                    ));
                }
                return Ok(EnrichmentResult {
                    checks: checks.into_checks(),
                    ..EnrichmentResult::default()
                });
            }
        };

        let capabilities = match initialize(&lease, &input.session, &input.cancel).await {
            Ok(capabilities) => capabilities,
            Err(err) if err.is(LspErrorKind::Cancelled) => {
                lease.mark_poisoned("initialize cancelled");
                lease.release().await;
                return Err(EnrichError::Cancelled);
            }
            Err(err) => {
                tracing::warn!(cmd = %provider, kind = err.kind().as_str(), "initialize failed: {err}");
                if !checks.push_policy(&provider, &err) {
                    checks.push_once(Check::warn(
                        checks::INITIALIZE_FAILED,
                        format!("{provider}: initialize failed: {}", err.message()),
                    ));
                }
                if !err.kind().is_policy() {
                    lease.mark_poisoned(&format!("initialize failed: {err}"));
                }
                let runtime = runtime_summary(&lease, None);
                lease.release().await;
                return Ok(EnrichmentResult {
                    checks: checks.into_checks(),
                    runtime: Some(runtime),
                    ..EnrichmentResult::default()
                });
            }
        };

        let buffer = options.capture_diagnostics.then(|| {
            Arc::new(DiagnosticsBuffer::new(
                options.max_diagnostic_uris,
                options.max_diagnostics_per_uri,
            ))
        });
        if let Some(buffer) = &buffer {
            let sink: Arc<dyn NotificationSink> = buffer.clone();
            lease.supervisor().set_notification_sink(Some(sink));
        }

        let hover_cache = HoverCache::load(options.cache_root.as_deref(), options.hover_cache_max_entries).await;
        let run_cancel = input.cancel.child_token();
        let runner = DocumentRunner {
            lease: &lease,
            options: &options,
            capabilities,
            provider: &provider,
            root_dir: &input.session.repo_root,
            materializer: input.materializer,
            parser: ParseCache::new(input.parser),
            limiters: StageLimiters::new(&options.stages),
            cancel: run_cancel.clone(),
            state: Mutex::new(RunState {
                hover_cache,
                checks,
                ..RunState::default()
            }),
        };

        let mut failure = None;
        {
            let mut outcomes = futures_util::stream::iter(work.iter().copied())
                .map(|(document, targets)| runner.process(document, targets))
                .buffer_unordered(options.document_symbol_concurrency);
            while let Some(outcome) = outcomes.next().await {
                if let Err(err) = outcome
                    && failure.is_none()
                {
                    run_cancel.cancel();
                    failure = Some(err);
                }
            }
        }
        let DocumentRunner { state, .. } = runner;
        let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);

        let mut diagnostics = BTreeMap::new();
        let mut diagnostics_count = 0;
        if let Some(buffer) = &buffer {
            if failure.is_none() {
                tokio::select! {
                    () = tokio::time::sleep(options.diagnostics_drain_window) => {}
                    () = input.cancel.cancelled() => failure = Some(EnrichError::Cancelled),
                }
            }
            lease.supervisor().set_notification_sink(None);
            buffer_checks(
                buffer.flags(),
                options.max_diagnostic_uris,
                options.max_diagnostics_per_uri,
                &mut state.checks,
            );
            let by_path: HashMap<&str, &Document> = input
                .documents
                .iter()
                .map(|document| (document.virtual_path.as_str(), document))
                .collect();
            let by_uri: HashMap<&str, &Document> = state
                .opened
                .iter()
                .filter_map(|opened| {
                    let document = by_path.get(opened.virtual_path.as_str())?;
                    Some((opened.uri.as_str(), *document))
                })
                .collect();
            let shaped = shape_diagnostics(
                buffer.take(),
                &by_uri,
                &targets,
                options.max_diagnostics_per_chunk,
                &mut state.checks,
            );
            diagnostics = shaped.by_chunk_uid;
            diagnostics_count = shaped.count;
        }

        if let Err(err) = state.hover_cache.persist().await {
            tracing::warn!(cmd = %provider, "failed to persist hover cache: {err}");
            if options.surface_cache_errors && failure.is_none() {
                failure = Some(EnrichError::Io(err));
            }
        }

        if let Some(reason) = &state.poison_reason {
            lease.mark_poisoned(reason);
            state.checks.push_once(Check::warn(
                checks::SESSION_POISONED,
                format!("{provider}: session poisoned: {reason}"),
            ));
        }

        let runtime = runtime_summary(&lease, Some(capabilities));
        lease.release().await;
        if let Some(err) = failure {
            return Err(err);
        }

        let by_chunk_uid: BTreeMap<String, ChunkEnrichment> = state
            .selections
            .into_iter()
            .map(|(uid, selection)| {
                let enrichment = ChunkEnrichment {
                    chunk: selection.chunk,
                    payload: TypePayload::from_info(&selection.info),
                    provenance: Provenance::now(&provider),
                };
                (uid, enrichment)
            })
            .collect();
        tracing::info!(
            cmd = %provider,
            documents = work.len(),
            enriched = by_chunk_uid.len(),
            diagnostics = diagnostics_count,
            "enrichment run complete"
        );
        Ok(EnrichmentResult {
            enriched: by_chunk_uid.len(),
            by_chunk_uid,
            diagnostics_by_chunk_uid: diagnostics,
            diagnostics_count,
            checks: state.checks.into_checks(),
            hover_metrics: state.metrics.summary(),
            runtime: Some(runtime),
        })
    }
}

/// Run the handshake on a fresh session, or reuse the negotiated mask.
async fn initialize(
    lease: &Lease,
    session: &SessionOptions,
    cancel: &CancellationToken,
) -> Result<CapabilityMask, LspError> {
    if !lease.should_initialize() {
        return Ok(lease.capabilities().unwrap_or_default());
    }
    lease.mark_initializing();
    let root_uri = path_to_file_uri(&session.repo_root)
        .map_err(|err| LspError::new(LspErrorKind::Spawn, err.to_string()))?
        .to_string();
    let options = RunOptions {
        no_retry: true,
        ..RunOptions::new("initialize")
    };
    let capabilities = lease
        .guard()
        .run(options, cancel, |_timeout| {
            lease
                .supervisor()
                .initialize(&root_uri, session.initialization_options.as_ref(), Some(cancel))
        })
        .await?;
    lease.mark_initialized(capabilities);
    Ok(capabilities)
}
