//! Diagnostics buffer: accumulates `publishDiagnostics` per URI.
//!
//! Each publish replaces the URI's previous set. Entries are deduplicated and
//! capped per URI; the number of URIs is capped too, evicting the URI that
//! was published least recently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::Value;
use typelift_types::LspDiagnostic;

use crate::protocol::PublishDiagnosticsParams;
use crate::supervisor::NotificationSink;

pub const DEFAULT_MAX_URIS: usize = 1000;
pub const DEFAULT_MAX_PER_URI: usize = 200;

const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

/// Overflow counters since the buffer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Publishes that were truncated to the per-URI cap.
    pub per_uri_capped: u64,
    pub uris_evicted: u64,
}

#[derive(Debug, Default)]
struct BufferState {
    by_uri: HashMap<String, Vec<LspDiagnostic>>,
    /// Oldest publish first.
    order: VecDeque<String>,
    flags: BufferFlags,
}

#[derive(Debug)]
pub struct DiagnosticsBuffer {
    max_uris: usize,
    max_per_uri: usize,
    state: Mutex<BufferState>,
}

impl Default for DiagnosticsBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_URIS, DEFAULT_MAX_PER_URI)
    }
}

impl DiagnosticsBuffer {
    #[must_use]
    pub fn new(max_uris: usize, max_per_uri: usize) -> Self {
        Self {
            max_uris: max_uris.max(1),
            max_per_uri: max_per_uri.max(1),
            state: Mutex::new(BufferState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, uri: String, items: Vec<LspDiagnostic>) {
        let mut seen = HashSet::new();
        let mut deduped: Vec<LspDiagnostic> = items
            .into_iter()
            .filter(|d| seen.insert(d.dedup_key()))
            .collect();

        let mut state = self.lock();
        if deduped.len() > self.max_per_uri {
            deduped.truncate(self.max_per_uri);
            state.flags.per_uri_capped += 1;
            if state.flags.per_uri_capped == 1 {
                tracing::warn!(%uri, cap = self.max_per_uri, "diagnostics per URI capped");
            } else {
                tracing::debug!(%uri, cap = self.max_per_uri, times = state.flags.per_uri_capped, "diagnostics per URI capped");
            }
        }

        state.order.retain(|u| u != &uri);
        if deduped.is_empty() {
            state.by_uri.remove(&uri);
            return;
        }
        state.order.push_back(uri.clone());
        state.by_uri.insert(uri, deduped);

        while state.by_uri.len() > self.max_uris {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.by_uri.remove(&oldest);
            state.flags.uris_evicted += 1;
            if state.flags.uris_evicted == 1 {
                tracing::warn!(uri = %oldest, cap = self.max_uris, "diagnostics URI buffer full, evicting oldest");
            } else {
                tracing::debug!(uri = %oldest, cap = self.max_uris, evicted = state.flags.uris_evicted, "evicted diagnostics URI");
            }
        }
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Vec<LspDiagnostic> {
        self.lock().by_uri.get(uri).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_uri.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn flags(&self) -> BufferFlags {
        self.lock().flags
    }

    /// Drain everything buffered, oldest publish first.
    pub fn take(&self) -> Vec<(String, Vec<LspDiagnostic>)> {
        let mut state = self.lock();
        let order = std::mem::take(&mut state.order);
        let mut by_uri = std::mem::take(&mut state.by_uri);
        order
            .into_iter()
            .filter_map(|uri| by_uri.remove(&uri).map(|items| (uri, items)))
            .collect()
    }
}

impl NotificationSink for DiagnosticsBuffer {
    fn notify(&self, method: &str, params: Option<&Value>) {
        if method != PUBLISH_DIAGNOSTICS {
            tracing::trace!(%method, "ignoring notification");
            return;
        }
        let Some(params) = params else { return };
        match PublishDiagnosticsParams::deserialize(params) {
            Ok(params) => self.update(params.uri, params.diagnostics),
            Err(e) => tracing::debug!("failed to parse publishDiagnostics: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use typelift_types::{Position, Range};

    use super::*;

    fn diag(message: &str, line: u32) -> LspDiagnostic {
        LspDiagnostic {
            range: Range::new(Position::new(line, 0), Position::new(line, 4)),
            severity: Some(1),
            code: None,
            source: Some("clang".into()),
            message: message.into(),
        }
    }

    #[test]
    fn publish_replaces_previous_set() {
        let buffer = DiagnosticsBuffer::default();
        buffer.update("file:///a.c".into(), vec![diag("e1", 1), diag("e2", 2)]);
        buffer.update("file:///a.c".into(), vec![diag("e1", 1)]);
        assert_eq!(buffer.get("file:///a.c").len(), 1);

        buffer.update("file:///a.c".into(), vec![]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn per_uri_cap_keeps_exactly_cap_without_duplicates() {
        let buffer = DiagnosticsBuffer::new(10, 3);
        let mut items = vec![diag("dup", 0), diag("dup", 0)];
        items.extend((1..6).map(|i| diag("e", i)));
        buffer.update("file:///a.c".into(), items);

        let kept = buffer.get("file:///a.c");
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].message, "dup");
        assert_ne!(kept[0].dedup_key(), kept[1].dedup_key());
        assert_eq!(buffer.flags().per_uri_capped, 1);
    }

    #[test]
    fn oldest_uri_is_evicted() {
        let buffer = DiagnosticsBuffer::new(2, 10);
        buffer.update("file:///a.c".into(), vec![diag("a", 0)]);
        buffer.update("file:///b.c".into(), vec![diag("b", 0)]);
        // Re-publishing a refreshes its position.
        buffer.update("file:///a.c".into(), vec![diag("a", 1)]);
        buffer.update("file:///c.c".into(), vec![diag("c", 0)]);

        assert!(buffer.get("file:///b.c").is_empty());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.flags().uris_evicted, 1);
        let uris: Vec<_> = buffer.take().into_iter().map(|(uri, _)| uri).collect();
        assert_eq!(uris, vec!["file:///a.c", "file:///c.c"]);
        assert!(buffer.is_empty());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn every_eviction_and_cap_is_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let buffer = DiagnosticsBuffer::new(1, 1);
        tracing::subscriber::with_default(subscriber, || {
            for name in ["a", "b", "c"] {
                buffer.update(format!("file:///{name}.c"), vec![diag(name, 0), diag(name, 1)]);
            }
        });

        let flags = buffer.flags();
        assert_eq!(flags.uris_evicted, 2);
        assert_eq!(flags.per_uri_capped, 3);
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("WARN").count(), 2, "{logs}");
        assert_eq!(logs.matches("evicted diagnostics URI").count(), 1, "{logs}");
        assert!(
            logs.lines()
                .any(|line| line.contains("evicted diagnostics URI") && line.contains("file:///b.c")),
            "{logs}"
        );
        assert_eq!(logs.matches("diagnostics per URI capped").count(), 3, "{logs}");
    }

    #[test]
    fn sink_only_accepts_publish_diagnostics() {
        let buffer = DiagnosticsBuffer::default();
        let params = json!({
            "uri": "file:///x.py",
            "diagnostics": [{
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
                "message": "undefined name"
            }]
        });
        buffer.notify("window/logMessage", Some(&params));
        assert!(buffer.is_empty());
        buffer.notify(PUBLISH_DIAGNOSTICS, Some(&params));
        assert_eq!(buffer.get("file:///x.py").len(), 1);
    }
}
