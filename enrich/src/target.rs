//! Mapping symbols and diagnostics onto chunk targets.

use std::collections::HashMap;

use typelift_types::{ByteRange, Target};

use crate::signature::normalize_type_text;

/// Targets grouped by `virtual_path`, in input order.
#[derive(Debug, Default)]
pub struct TargetsByPath {
    by_path: HashMap<String, Vec<Target>>,
}

impl TargetsByPath {
    #[must_use]
    pub fn new(targets: &[Target]) -> Self {
        let mut by_path: HashMap<String, Vec<Target>> = HashMap::new();
        for target in targets {
            if target.virtual_path.is_empty() {
                continue;
            }
            by_path
                .entry(target.virtual_path.clone())
                .or_default()
                .push(target.clone());
        }
        Self { by_path }
    }

    #[must_use]
    pub fn get(&self, virtual_path: &str) -> &[Target] {
        self.by_path.get(virtual_path).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// Best target for `offsets`.
///
/// Containing beats overlapping, a `symbolHint.name` equal to `name_hint`
/// adds weight, and the smaller span wins ties.
#[must_use]
pub fn find_target<'a>(
    targets: &'a [Target],
    offsets: ByteRange,
    name_hint: Option<&str>,
) -> Option<&'a Target> {
    let mut best: Option<(&Target, u8, usize)> = None;
    for target in targets {
        let range = target.virtual_range;
        if !offsets.overlaps(&range) {
            continue;
        }
        let contains = offsets.within(&range);
        let name_match = name_hint.is_some() && target.hint_name() == name_hint;
        let rank = if contains { 2 } else { 1 } + if name_match { 2 } else { 0 };
        let span = range.len();
        let better = match best {
            None => true,
            Some((_, best_rank, best_span)) => {
                rank > best_rank || (rank == best_rank && span < best_span)
            }
        };
        if better {
            best = Some((target, rank, span));
        }
    }
    best.map(|(target, _, _)| target)
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// A declaration-looking slice of the chunk's own text.
///
/// Takes the target range (end inclusive), cuts at the first `{` or `;`, and
/// keeps everything through the last `)`. `None` when there is no
/// parenthesised parameter list.
#[must_use]
pub fn source_signature_candidate(text: &str, range: ByteRange) -> Option<String> {
    let start = floor_boundary(text, range.start);
    let end = floor_boundary(text, range.end.saturating_add(1)).max(start);
    let mut candidate = &text[start..end];
    if !candidate.contains('(') || !candidate.contains(')') {
        return None;
    }
    if let Some(cut) = candidate.find(['{', ';']) {
        candidate = &candidate[..cut];
    }
    let last_paren = candidate.rfind(')')?;
    normalize_type_text(&candidate[..=last_paren])
}
