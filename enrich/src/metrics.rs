//! Run-scoped counters for the fallback stages.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use typelift_lsp::metrics::{MAX_LATENCY_SAMPLES, percentile};

use crate::options::Stage;

/// Why a stage was not requested for a symbol. Only the first applicable
/// reason is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Kind,
    Budget,
    GlobalDisable,
    AdaptiveDisable,
    /// The symbol was already complete.
    ReturnSufficient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Succeeded,
    /// Answered, but nothing usable.
    Empty,
    Failed,
    TimedOut,
}

#[derive(Debug, Default)]
struct Samples(VecDeque<u64>);

impl Samples {
    fn push(&mut self, elapsed: Duration) {
        if self.0.len() == MAX_LATENCY_SAMPLES {
            self.0.pop_front();
        }
        self.0
            .push_back(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    }

    fn p50_p95(&self) -> (Option<u64>, Option<u64>) {
        let mut sorted: Vec<u64> = self.0.iter().copied().collect();
        sorted.sort_unstable();
        (percentile(&sorted, 50), percentile(&sorted, 95))
    }
}

#[derive(Debug, Default)]
struct Counters {
    requested: u64,
    succeeded: u64,
    timed_out: u64,
    skipped: u64,
    latencies: Samples,
}

impl Counters {
    fn record(&mut self, elapsed: Duration, outcome: RequestOutcome) {
        self.requested += 1;
        match outcome {
            RequestOutcome::Succeeded => self.succeeded += 1,
            RequestOutcome::TimedOut => self.timed_out += 1,
            RequestOutcome::Empty | RequestOutcome::Failed => {}
        }
        self.latencies.push(elapsed);
    }
}

#[derive(Debug, Default)]
struct FileStats {
    counters: Counters,
    disabled_stages: Vec<Stage>,
}

#[derive(Debug, Default)]
struct HoverSkips {
    budget: u64,
    kind: u64,
    return_sufficient: u64,
    adaptive_disable: u64,
    global_disable: u64,
}

#[derive(Debug, Default)]
pub struct HoverMetrics {
    hover: Counters,
    hover_skips: HoverSkips,
    stages: BTreeMap<Stage, Counters>,
    incomplete_symbols: u64,
    hover_triggered_by_incomplete: u64,
    fallback_used: u64,
    fallback_reason_counts: BTreeMap<String, u64>,
    files: HashMap<String, FileStats>,
}

impl HoverMetrics {
    pub fn record_request(&mut self, path: &str, stage: Stage, elapsed: Duration, outcome: RequestOutcome) {
        if stage == Stage::Hover {
            self.hover.record(elapsed, outcome);
        }
        self.stages.entry(stage).or_default().record(elapsed, outcome);
        self.files
            .entry(path.to_string())
            .or_default()
            .counters
            .record(elapsed, outcome);
    }

    pub fn record_skip(&mut self, path: &str, stage: Stage, reason: SkipReason) {
        self.stages.entry(stage).or_default().skipped += 1;
        self.files.entry(path.to_string()).or_default().counters.skipped += 1;
        if stage != Stage::Hover {
            return;
        }
        let skips = &mut self.hover_skips;
        match reason {
            SkipReason::Kind => skips.kind += 1,
            SkipReason::Budget => skips.budget += 1,
            SkipReason::GlobalDisable => skips.global_disable += 1,
            SkipReason::AdaptiveDisable => skips.adaptive_disable += 1,
            SkipReason::ReturnSufficient => skips.return_sufficient += 1,
        }
    }

    pub fn mark_disabled(&mut self, path: &str, stage: Stage) {
        let file = self.files.entry(path.to_string()).or_default();
        if !file.disabled_stages.contains(&stage) {
            file.disabled_stages.push(stage);
        }
    }

    pub fn record_incomplete(&mut self) {
        self.incomplete_symbols += 1;
    }

    /// Hover was requested, or served from cache, for an incomplete symbol.
    pub fn record_hover_triggered(&mut self) {
        self.hover_triggered_by_incomplete += 1;
    }

    pub fn record_fallback<I, S>(&mut self, reasons: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_used += 1;
        for reason in reasons {
            *self.fallback_reason_counts.entry(reason.into()).or_default() += 1;
        }
    }

    #[must_use]
    pub fn summary(&self) -> HoverMetricsSummary {
        let (p50_ms, p95_ms) = self.hover.latencies.p50_p95();
        let stages = self
            .stages
            .iter()
            .map(|(stage, counters)| {
                let (p50_ms, p95_ms) = counters.latencies.p50_p95();
                let summary = StageSummary {
                    requested: counters.requested,
                    succeeded: counters.succeeded,
                    timed_out: counters.timed_out,
                    skipped: counters.skipped,
                    p50_ms,
                    p95_ms,
                };
                (*stage, summary)
            })
            .collect();
        let mut files: Vec<FileSummary> = self
            .files
            .iter()
            .map(|(path, stats)| {
                let (p50_ms, p95_ms) = stats.counters.latencies.p50_p95();
                let mut disabled_stages = stats.disabled_stages.clone();
                disabled_stages.sort();
                FileSummary {
                    virtual_path: path.clone(),
                    requested: stats.counters.requested,
                    succeeded: stats.counters.succeeded,
                    timed_out: stats.counters.timed_out,
                    skipped: stats.counters.skipped,
                    p50_ms,
                    p95_ms,
                    disabled_stages,
                }
            })
            .collect();
        files.sort_by(|a, b| {
            b.timed_out
                .cmp(&a.timed_out)
                .then_with(|| b.p95_ms.cmp(&a.p95_ms))
                .then_with(|| a.virtual_path.cmp(&b.virtual_path))
        });

        HoverMetricsSummary {
            requested: self.hover.requested,
            succeeded: self.hover.succeeded,
            timed_out: self.hover.timed_out,
            skipped_by_budget: self.hover_skips.budget,
            skipped_by_kind: self.hover_skips.kind,
            skipped_by_return_sufficient: self.hover_skips.return_sufficient,
            skipped_by_adaptive_disable: self.hover_skips.adaptive_disable,
            skipped_by_global_disable: self.hover_skips.global_disable,
            p50_ms,
            p95_ms,
            incomplete_symbols: self.incomplete_symbols,
            hover_triggered_by_incomplete: self.hover_triggered_by_incomplete,
            fallback_used: self.fallback_used,
            fallback_reason_counts: self.fallback_reason_counts.clone(),
            stages,
            files,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub requested: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub virtual_path: String,
    pub requested: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    /// Stages adaptively suppressed for this file.
    pub disabled_stages: Vec<Stage>,
}

/// Hover counters are global; `stages` and `files` break every stage down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverMetricsSummary {
    pub requested: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub skipped_by_budget: u64,
    pub skipped_by_kind: u64,
    pub skipped_by_return_sufficient: u64,
    pub skipped_by_adaptive_disable: u64,
    pub skipped_by_global_disable: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub incomplete_symbols: u64,
    pub hover_triggered_by_incomplete: u64,
    pub fallback_used: u64,
    pub fallback_reason_counts: BTreeMap<String, u64>,
    pub stages: BTreeMap<Stage, StageSummary>,
    pub files: Vec<FileSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn hover_counters_and_skips() {
        let mut metrics = HoverMetrics::default();
        metrics.record_request("a.c", Stage::Hover, ms(10), RequestOutcome::Succeeded);
        metrics.record_request("a.c", Stage::Hover, ms(30), RequestOutcome::TimedOut);
        metrics.record_request("a.c", Stage::SignatureHelp, ms(5), RequestOutcome::Empty);
        metrics.record_skip("a.c", Stage::Hover, SkipReason::AdaptiveDisable);
        metrics.record_skip("a.c", Stage::Definition, SkipReason::GlobalDisable);

        let summary = metrics.summary();
        assert_eq!(summary.requested, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.skipped_by_adaptive_disable, 1);
        assert_eq!(summary.skipped_by_global_disable, 0);
        assert_eq!(summary.p95_ms, Some(30));
        assert_eq!(summary.stages[&Stage::SignatureHelp].requested, 1);
        assert_eq!(summary.stages[&Stage::Definition].skipped, 1);
        assert_eq!(summary.files[0].requested, 3);
    }

    #[test]
    fn file_rows_sort_by_timeouts_then_latency_then_path() {
        let mut metrics = HoverMetrics::default();
        metrics.record_request("b.c", Stage::Hover, ms(1), RequestOutcome::Succeeded);
        metrics.record_request("a.c", Stage::Hover, ms(1), RequestOutcome::Succeeded);
        metrics.record_request("slow.c", Stage::Hover, ms(90), RequestOutcome::Succeeded);
        metrics.record_request("stuck.c", Stage::Hover, ms(5), RequestOutcome::TimedOut);

        let order: Vec<_> = metrics
            .summary()
            .files
            .into_iter()
            .map(|f| f.virtual_path)
            .collect();
        assert_eq!(order, vec!["stuck.c", "slow.c", "a.c", "b.c"]);
    }

    #[test]
    fn fallback_histogram_serializes_camel_case() {
        let mut metrics = HoverMetrics::default();
        metrics.record_incomplete();
        metrics.record_hover_triggered();
        metrics.record_fallback(["hover_failed", "definition_not_requested"]);
        metrics.record_fallback(["hover_failed"]);
        metrics.mark_disabled("a.c", Stage::Hover);

        let json = serde_json::to_value(metrics.summary()).unwrap();
        assert_eq!(json["fallbackUsed"], 2);
        assert_eq!(json["fallbackReasonCounts"]["hover_failed"], 2);
        assert_eq!(json["hoverTriggeredByIncomplete"], 1);
        assert_eq!(json["files"][0]["disabledStages"][0], "hover");
    }
}
