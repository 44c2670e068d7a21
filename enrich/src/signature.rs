//! Signature text helpers: normalisation, hover content extraction and
//! completeness.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use typelift_types::{ParamType, SignatureInfo};

static AMBIGUOUS_RETURN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(unknown$|any\b)").expect("valid ambiguous return regex")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Collapse whitespace runs to one space and trim. `None` when blank.
#[must_use]
pub fn normalize_type_text(value: &str) -> Option<String> {
    let collapsed = WHITESPACE.replace_all(value, " ");
    let trimmed = collapsed.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Hover `contents` as plain text.
///
/// Accepts a string, `MarkupContent`, `MarkedString` or an array of those.
#[must_use]
pub fn hover_text(contents: &Value) -> String {
    match contents {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(hover_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => map
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Drop markdown fence lines, keeping the fenced code.
#[must_use]
pub fn unwrap_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn has_arrow(text: Option<&str>) -> bool {
    text.is_some_and(|t| t.contains("->"))
}

/// Missing, `unknown`, `any…`, or `Void` right after an arrow-style
/// signature.
#[must_use]
pub fn is_ambiguous_return(return_type: Option<&str>, arrow_signature: bool) -> bool {
    let Some(normalized) = return_type.and_then(normalize_type_text) else {
        return true;
    };
    AMBIGUOUS_RETURN.is_match(&normalized) || (normalized == "Void" && arrow_signature)
}

/// How much of a signature is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completeness {
    pub return_missing: bool,
    /// Fraction of declared parameters with a typed entry.
    pub coverage: f64,
}

impl Completeness {
    /// `detail` is the text the symbol was originally parsed from.
    #[must_use]
    pub fn of(info: Option<&SignatureInfo>, detail: Option<&str>) -> Self {
        let Some(info) = info else {
            return Self {
                return_missing: true,
                coverage: 0.0,
            };
        };
        let arrow = has_arrow(detail) || has_arrow(info.signature.as_deref());
        Self {
            return_missing: is_ambiguous_return(info.return_type.as_deref(), arrow),
            coverage: info.param_coverage(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.return_missing && self.coverage >= 1.0
    }
}

/// Return type as emitted: a `Void` read from an arrow signature is
/// re-derived from the text after the last `->`.
#[must_use]
pub fn emit_return_type(info: &SignatureInfo) -> Option<String> {
    let normalized = info.return_type.as_deref().and_then(normalize_type_text)?;
    if normalized != "Void" {
        return Some(normalized);
    }
    let Some(signature) = info.signature.as_deref().and_then(normalize_type_text) else {
        return Some(normalized);
    };
    match signature.rsplit_once("->").map(|(_, tail)| tail.trim()) {
        Some("()" | "") | None => Some(normalized),
        Some(tail) => Some(tail.to_string()),
    }
}

/// Parameter types as emitted: normalised text, blanks dropped.
#[must_use]
pub fn emit_param_types(info: &SignatureInfo) -> Option<BTreeMap<String, Vec<ParamType>>> {
    let out: BTreeMap<String, Vec<ParamType>> = info
        .param_types
        .iter()
        .filter(|(name, _)| !name.is_empty())
        .filter_map(|(name, entries)| {
            let entries: Vec<ParamType> = entries
                .iter()
                .filter_map(|entry| {
                    let type_name = normalize_type_text(&entry.type_name)?;
                    Some(ParamType {
                        type_name,
                        ..entry.clone()
                    })
                })
                .collect();
            (!entries.is_empty()).then(|| (name.clone(), entries))
        })
        .collect();
    (!out.is_empty()).then_some(out)
}
