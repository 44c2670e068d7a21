//! Fallback stage plumbing: request limiters, adaptive suppression, request
//! dispatch through the guard and response interpretation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use typelift_lsp::protocol::{file_uri_to_path, reference_params, text_document_position_params};
use typelift_lsp::{Lease, LspError, RequestOptions, RunOptions};
use typelift_types::{Position, Range, SignatureInfo};

use crate::line_index::LineIndex;
use crate::options::{Stage, StageSet};
use crate::parser::ParseCache;
use crate::signature::{hover_text, normalize_type_text, unwrap_fences};

/// Independent fan-out limits per stage, shared by every document in a run.
pub struct StageLimiters {
    permits: BTreeMap<Stage, Semaphore>,
}

impl StageLimiters {
    #[must_use]
    pub fn new(stages: &StageSet) -> Self {
        let permits = Stage::ALL
            .into_iter()
            .map(|stage| (stage, Semaphore::new(stages.get(stage).concurrency.max(1))))
            .collect();
        Self { permits }
    }

    pub async fn acquire(
        &self,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<Option<SemaphorePermit<'_>>, LspError> {
        let Some(semaphore) = self.permits.get(&stage) else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LspError::cancelled()),
            permit = semaphore.acquire() => Ok(permit.ok()),
        }
    }

    #[must_use]
    pub fn available(&self, stage: Stage) -> usize {
        self.permits.get(&stage).map_or(0, Semaphore::available_permits)
    }
}

/// What a recorded timeout switched off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutEffect {
    pub file_disabled: bool,
    pub global_disabled: bool,
}

/// Timeout-driven stage suppression, per file and per run.
#[derive(Debug, Default)]
pub struct Suppression {
    file_timeouts: HashMap<(String, Stage), u32>,
    file_disabled: HashSet<(String, Stage)>,
    global_timeouts: u32,
    global_disabled: bool,
}

impl Suppression {
    #[must_use]
    pub fn is_globally_disabled(&self) -> bool {
        self.global_disabled
    }

    #[must_use]
    pub fn is_file_disabled(&self, path: &str, stage: Stage) -> bool {
        self.file_disabled.contains(&(path.to_string(), stage))
    }

    /// Count one timeout. `stage_threshold` disables `stage` for `path`;
    /// the global count is compared against `global_threshold`, or the
    /// stage's own threshold when no global one is configured.
    pub fn record_timeout(
        &mut self,
        path: &str,
        stage: Stage,
        stage_threshold: Option<u32>,
        global_threshold: Option<u32>,
    ) -> TimeoutEffect {
        let key = (path.to_string(), stage);
        let count = self.file_timeouts.entry(key.clone()).or_default();
        *count += 1;
        let mut effect = TimeoutEffect::default();
        if stage_threshold.is_some_and(|limit| *count >= limit) && self.file_disabled.insert(key) {
            effect.file_disabled = true;
        }
        self.global_timeouts += 1;
        let global_limit = global_threshold.or(stage_threshold);
        if !self.global_disabled && global_limit.is_some_and(|limit| self.global_timeouts >= limit) {
            self.global_disabled = true;
            effect.global_disabled = true;
        }
        effect
    }
}

/// Send `method` through the session's guard with per-attempt timeouts.
pub async fn guarded_request(
    lease: &Lease,
    method: &str,
    params: Value,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Value, LspError> {
    let supervisor = lease.supervisor();
    let options = RunOptions::new(method).with_timeout(timeout);
    lease
        .guard()
        .run(options, cancel, |timeout| {
            let params = params.clone();
            let request = RequestOptions::with_timeout(timeout).cancel(cancel);
            async move { supervisor.request(method, Some(params), request).await }
        })
        .await
}

/// Send one stage request for `position`.
pub async fn request_stage(
    lease: &Lease,
    stage: Stage,
    uri: &str,
    position: Position,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Value, LspError> {
    let params = match stage {
        Stage::References => reference_params(uri, position),
        _ => text_document_position_params(uri, position),
    };
    guarded_request(lease, stage.method(), params, timeout, cancel).await
}

/// Everything needed to turn a response into a signature for one symbol.
pub struct SymbolContext<'a> {
    pub uri: &'a str,
    pub index: &'a LineIndex<'a>,
    pub language_id: &'a str,
    pub symbol_name: &'a str,
    pub parser: &'a ParseCache<'a>,
}

impl SymbolContext<'_> {
    fn parse(&self, text: &str) -> Option<SignatureInfo> {
        self.parser.parse(text, self.language_id, self.symbol_name)
    }

    fn same_document(&self, uri: &str) -> bool {
        if uri == self.uri {
            return true;
        }
        match (file_uri_to_path(uri), file_uri_to_path(self.uri)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Declaration text at `range`: whole lines, cut at the body.
    fn located_text(&self, range: Range) -> Option<String> {
        let start = self.index.line_start(range.start.line);
        let end = self
            .index
            .line_end(range.end.line.max(range.start.line))
            .max(start);
        let text = self.index.slice(start, end);
        let text = text.find(['{', ';']).map_or(text, |cut| &text[..cut]);
        normalize_type_text(text)
    }
}

fn locations(response: &Value) -> Vec<(&str, Range)> {
    let items: Vec<&Value> = match response {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![response],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            let uri = item.get("uri").or_else(|| item.get("targetUri"))?.as_str()?;
            let range = item.get("range").or_else(|| item.get("targetRange"))?;
            let range = Range::deserialize(range).ok()?;
            Some((uri, range))
        })
        .collect()
}

/// Interpret a stage response. `None` when it carries nothing parseable.
#[must_use]
pub fn interpret(stage: Stage, response: &Value, cx: &SymbolContext<'_>) -> Option<SignatureInfo> {
    match stage {
        Stage::Hover => {
            let text = unwrap_fences(&hover_text(response.get("contents")?));
            cx.parse(&text)
        }
        Stage::SignatureHelp => {
            let signatures = response.get("signatures")?.as_array()?;
            let active = response
                .get("activeSignature")
                .and_then(Value::as_u64)
                .and_then(|i| usize::try_from(i).ok())
                .filter(|&i| i < signatures.len())
                .unwrap_or(0);
            let label = signatures.get(active)?.get("label")?.as_str()?;
            cx.parse(label)
        }
        Stage::Definition | Stage::TypeDefinition | Stage::References => locations(response)
            .into_iter()
            .filter(|(uri, _)| cx.same_document(uri))
            .find_map(|(_, range)| cx.parse(&cx.located_text(range)?)),
    }
}
