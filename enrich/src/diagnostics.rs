//! Mapping buffered `publishDiagnostics` onto chunks.

use std::collections::{BTreeMap, HashMap, HashSet};

use typelift_lsp::BufferFlags;
use typelift_types::{Check, Document, LspDiagnostic};

use crate::checks::{self, CheckLog};
use crate::line_index::LineIndex;
use crate::target::{TargetsByPath, find_target};

#[derive(Debug, Default)]
pub struct ShapedDiagnostics {
    pub by_chunk_uid: BTreeMap<String, Vec<LspDiagnostic>>,
    pub count: usize,
}

/// Map each URI's diagnostics onto the chunk containing them.
///
/// `documents` is keyed by the URI the document was opened under. URIs the
/// run did not open, and diagnostics outside every chunk, are dropped.
pub fn shape_diagnostics(
    buffered: Vec<(String, Vec<LspDiagnostic>)>,
    documents: &HashMap<&str, &Document>,
    targets: &TargetsByPath,
    max_per_chunk: usize,
    checks: &mut CheckLog,
) -> ShapedDiagnostics {
    let mut shaped = ShapedDiagnostics::default();
    let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
    let mut dropped = 0u64;

    for (uri, items) in buffered {
        let Some(document) = documents.get(uri.as_str()) else {
            continue;
        };
        let candidates = targets.get(&document.virtual_path);
        if candidates.is_empty() {
            continue;
        }
        let index = LineIndex::new(&document.text);
        for diagnostic in items {
            let offsets = index.range_to_offsets(diagnostic.range);
            let Some(uid) = find_target(candidates, offsets, None).and_then(|t| t.chunk_uid()) else {
                continue;
            };
            if !seen
                .entry(uid.to_string())
                .or_default()
                .insert(diagnostic.dedup_key())
            {
                continue;
            }
            let bucket = shaped.by_chunk_uid.entry(uid.to_string()).or_default();
            if bucket.len() >= max_per_chunk {
                dropped += 1;
                continue;
            }
            bucket.push(diagnostic);
            shaped.count += 1;
        }
    }

    if dropped > 0 {
        tracing::warn!(cap = max_per_chunk, dropped, "diagnostics per chunk capped");
        checks.push_once(
            Check::warn(
                checks::DIAGNOSTICS_PER_CHUNK_CAPPED,
                format!("diagnostics capped at {max_per_chunk} per chunk"),
            )
            .with_count(dropped),
        );
    }
    shaped
}

/// Checks for overflow that happened while buffering.
pub fn buffer_checks(flags: BufferFlags, max_uris: usize, max_per_uri: usize, checks: &mut CheckLog) {
    if flags.per_uri_capped > 0 {
        checks.push_once(
            Check::warn(
                checks::DIAGNOSTICS_PER_URI_CAPPED,
                format!("diagnostics capped at {max_per_uri} per URI"),
            )
            .with_count(flags.per_uri_capped),
        );
    }
    if flags.uris_evicted > 0 {
        checks.push_once(
            Check::warn(
                checks::DIAGNOSTICS_URI_BUFFER_CAPPED,
                format!("diagnostics buffer holds at most {max_uris} URIs"),
            )
            .with_count(flags.uris_evicted),
        );
    }
}
