//! Per-method request counters and latency percentiles.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::error::{LspError, LspErrorKind};

/// Latency samples kept per method.
pub const MAX_LATENCY_SAMPLES: usize = 4096;

#[derive(Debug, Default)]
struct MethodStats {
    requests: u64,
    succeeded: u64,
    failed: u64,
    timed_out: u64,
    latencies_ms: VecDeque<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSnapshot {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub latency_p50_ms: Option<u64>,
    pub latency_p95_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct RequestMetrics {
    by_method: Mutex<HashMap<String, MethodStats>>,
}

impl RequestMetrics {
    pub fn record(&self, method: &str, elapsed: Duration, outcome: Result<(), &LspError>) {
        let mut by_method = self.by_method.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = by_method.entry(method.to_string()).or_default();
        stats.requests += 1;
        match outcome {
            Ok(()) => stats.succeeded += 1,
            Err(err) if err.is(LspErrorKind::Timeout) => stats.timed_out += 1,
            Err(_) => stats.failed += 1,
        }
        if stats.latencies_ms.len() == MAX_LATENCY_SAMPLES {
            stats.latencies_ms.pop_front();
        }
        stats
            .latencies_ms
            .push_back(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, MethodSnapshot> {
        let by_method = self.by_method.lock().unwrap_or_else(PoisonError::into_inner);
        by_method
            .iter()
            .map(|(method, stats)| {
                let mut sorted: Vec<u64> = stats.latencies_ms.iter().copied().collect();
                sorted.sort_unstable();
                let snapshot = MethodSnapshot {
                    requests: stats.requests,
                    succeeded: stats.succeeded,
                    failed: stats.failed,
                    timed_out: stats.timed_out,
                    latency_p50_ms: percentile(&sorted, 50),
                    latency_p95_ms: percentile(&sorted, 95),
                };
                (method.clone(), snapshot)
            })
            .collect()
    }
}

/// Nearest-rank percentile over sorted samples.
#[must_use]
pub fn percentile(sorted: &[u64], pct: usize) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let samples: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&samples, 50), Some(50));
        assert_eq!(percentile(&samples, 95), Some(95));
        assert_eq!(percentile(&[7], 95), Some(7));
        assert_eq!(percentile(&[], 50), None);
    }

    #[test]
    fn outcomes_are_classified() {
        let metrics = RequestMetrics::default();
        let timeout = LspError::timeout("textDocument/hover", Duration::from_millis(5));
        let protocol = LspError::protocol(-32603, "internal");
        metrics.record("textDocument/hover", Duration::from_millis(3), Ok(()));
        metrics.record("textDocument/hover", Duration::from_millis(5), Err(&timeout));
        metrics.record("textDocument/hover", Duration::from_millis(9), Err(&protocol));

        let snapshot = metrics.snapshot();
        let hover = &snapshot["textDocument/hover"];
        assert_eq!(hover.requests, 3);
        assert_eq!(hover.succeeded, 1);
        assert_eq!(hover.timed_out, 1);
        assert_eq!(hover.failed, 1);
        assert_eq!(hover.latency_p50_ms, Some(5));
        assert_eq!(hover.latency_p95_ms, Some(9));
    }

    #[test]
    fn samples_are_bounded() {
        let metrics = RequestMetrics::default();
        for i in 0..(MAX_LATENCY_SAMPLES as u64 + 10) {
            metrics.record("x", Duration::from_millis(i), Ok(()));
        }
        let by_method = metrics.by_method.lock().unwrap();
        assert_eq!(by_method["x"].latencies_ms.len(), MAX_LATENCY_SAMPLES);
        assert_eq!(by_method["x"].latencies_ms.front(), Some(&10));
    }
}
