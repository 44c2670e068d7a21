//! Flatten `documentSymbol` responses.
//!
//! Servers answer with either hierarchical `DocumentSymbol[]` or flat
//! `SymbolInformation[]`. Both become [`Symbol`]s in document order, parents
//! before their children. Malformed entries are skipped.

use serde::Deserialize;
use serde_json::Value;
use typelift_types::{Range, Symbol, SymbolKind};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbol {
    name: String,
    kind: u32,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    range: Option<Range>,
    #[serde(default)]
    selection_range: Option<Range>,
    #[serde(default)]
    location: Option<RawLocation>,
    #[serde(default)]
    children: Vec<Value>,
}

#[derive(Deserialize)]
struct RawLocation {
    range: Range,
}

#[must_use]
pub fn flatten_symbols(response: &Value) -> Vec<Symbol> {
    let mut out = Vec::new();
    if let Some(items) = response.as_array() {
        for item in items {
            push_symbol(item, &mut out);
        }
    }
    out
}

fn push_symbol(value: &Value, out: &mut Vec<Symbol>) {
    let Ok(raw) = RawSymbol::deserialize(value) else {
        tracing::trace!("skipping malformed document symbol");
        return;
    };
    let Some(range) = raw.range.or_else(|| raw.location.as_ref().map(|l| l.range)) else {
        return;
    };
    out.push(Symbol {
        name: raw.name,
        kind: SymbolKind(raw.kind),
        range,
        selection_range: raw.selection_range,
        detail: raw.detail.filter(|d| !d.trim().is_empty()),
    });
    for child in &raw.children {
        push_symbol(child, out);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use typelift_types::Position;

    use super::*;

    fn range(line: u32) -> Value {
        json!({ "start": { "line": line, "character": 0 }, "end": { "line": line, "character": 5 } })
    }

    #[test]
    fn flattens_tree_parent_first() {
        let response = json!([{
            "name": "Widget",
            "kind": 5,
            "range": range(0),
            "selectionRange": range(0),
            "children": [
                { "name": "draw", "kind": 6, "detail": "func draw() -> Void", "range": range(1), "selectionRange": range(1) },
                { "name": "size", "kind": 7, "range": range(2), "selectionRange": range(2) }
            ]
        }, {
            "name": "main", "kind": 12, "range": range(4), "selectionRange": range(4)
        }]);
        let names: Vec<_> = flatten_symbols(&response)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Widget", "draw", "size", "main"]);
    }

    #[test]
    fn accepts_symbol_information() {
        let response = json!([{
            "name": "add",
            "kind": 12,
            "location": { "uri": "file:///a.c", "range": range(3) }
        }]);
        let symbols = flatten_symbols(&response);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].anchor_position(), Position::new(3, 0));
        assert_eq!(symbols[0].kind, SymbolKind::FUNCTION);
    }

    #[test]
    fn skips_malformed_entries() {
        let response = json!([{ "kind": 12 }, { "name": "x", "kind": 13 }, 42]);
        assert!(flatten_symbols(&response).is_empty());
        assert!(flatten_symbols(&Value::Null).is_empty());
    }
}
