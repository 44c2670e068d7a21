//! Candidate scoring and merging.
//!
//! Every stage produces a [`SignatureInfo`]; [`merge`] folds it into the
//! running one. The stronger candidate is kept and its gaps are backfilled
//! from the weaker one, so `merge(a, a) == a`.

use typelift_types::{ParamType, SignatureInfo, Symbol, Target};

use crate::signature::{Completeness, is_ambiguous_return};

const EPSILON: f64 = 1e-9;

const HINT_MATCH_BONUS: f64 = 100.0;
const HINT_MISMATCH_PENALTY: f64 = -40.0;
const FUNCTION_LIKE_WEIGHT: f64 = 20.0;
const COMPLETE_BONUS: f64 = 30.0;

fn arrow(info: &SignatureInfo) -> bool {
    info.signature.as_deref().is_some_and(|s| s.contains("->"))
}

fn has_return(info: &SignatureInfo) -> bool {
    !is_ambiguous_return(info.return_type.as_deref(), arrow(info))
}

/// Evidence score: return type 4, parameter coverage 0..=4, signature text 1,
/// any typed parameter 1.
#[must_use]
pub fn score(info: &SignatureInfo) -> f64 {
    let mut score = info.param_coverage() * 4.0;
    if has_return(info) {
        score += 4.0;
    }
    if info.signature_len() > 0 {
        score += 1.0;
    }
    if info.has_typed_params() {
        score += 1.0;
    }
    score
}

/// Higher score wins; ties go to the longer signature, then to `a`.
fn prefers(a: &SignatureInfo, b: &SignatureInfo) -> bool {
    let (sa, sb) = (score(a), score(b));
    if (sa - sb).abs() > EPSILON {
        return sa > sb;
    }
    a.signature_len() >= b.signature_len()
}

#[must_use]
pub fn merge(a: &SignatureInfo, b: &SignatureInfo) -> SignatureInfo {
    let (preferred, other) = if prefers(a, b) { (a, b) } else { (b, a) };
    let mut merged = preferred.clone();

    if !has_return(&merged) && has_return(other) {
        merged.return_type.clone_from(&other.return_type);
    }
    if merged.signature_len() == 0 && other.signature_len() > 0 {
        merged.signature.clone_from(&other.signature);
    }
    for name in &other.param_names {
        if !merged.param_names.contains(name) {
            merged.param_names.push(name.clone());
        }
    }
    for (name, entries) in &other.param_types {
        if merged.typed_entry(name).is_some() {
            continue;
        }
        let other_typed = entries.iter().any(ParamType::is_typed);
        if other_typed || !merged.param_types.contains_key(name) {
            merged.param_types.insert(name.clone(), entries.clone());
        }
    }
    merged
}

/// [`merge`] over optional candidates.
#[must_use]
pub fn merge_opt(base: Option<SignatureInfo>, next: Option<SignatureInfo>) -> Option<SignatureInfo> {
    match (base, next) {
        (Some(base), Some(next)) => Some(merge(&base, &next)),
        (base, next) => base.or(next),
    }
}

/// Score for choosing between symbols that map to the same chunk.
#[must_use]
pub fn selection_score(info: &SignatureInfo, symbol: &Symbol, target: &Target, detail: Option<&str>) -> f64 {
    let mut total = score(info);
    if let Some(hint) = target.hint_name() {
        total += if hint == symbol.name {
            HINT_MATCH_BONUS
        } else {
            HINT_MISMATCH_PENALTY
        };
    }
    if let Some(function_like) = target.symbol_hint.as_ref().and_then(|h| h.is_function_like()) {
        total += if function_like == symbol.kind.is_function_like() {
            FUNCTION_LIKE_WEIGHT
        } else {
            -FUNCTION_LIKE_WEIGHT
        };
    }
    if Completeness::of(Some(info), detail).is_complete() {
        total += COMPLETE_BONUS;
    }
    total
}

/// True when `(score, signature)` should replace the incumbent.
#[must_use]
pub fn outranks(score: f64, info: &SignatureInfo, incumbent_score: f64, incumbent: &SignatureInfo) -> bool {
    if (score - incumbent_score).abs() > EPSILON {
        return score > incumbent_score;
    }
    info.signature_len() > incumbent.signature_len()
}
