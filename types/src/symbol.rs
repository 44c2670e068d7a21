use serde::{Deserialize, Serialize};

use crate::position::{Position, Range};

/// LSP `SymbolKind` numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolKind(pub u32);

impl SymbolKind {
    pub const CLASS: Self = Self(5);
    pub const METHOD: Self = Self(6);
    pub const PROPERTY: Self = Self(7);
    pub const FIELD: Self = Self(8);
    pub const CONSTRUCTOR: Self = Self(9);
    pub const FUNCTION: Self = Self(12);
    pub const VARIABLE: Self = Self(13);

    #[must_use]
    pub fn is_function_like(self) -> bool {
        matches!(self, Self::METHOD | Self::CONSTRUCTOR | Self::FUNCTION)
    }
}

/// A flattened `documentSymbol` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    #[serde(default)]
    pub selection_range: Option<Range>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Symbol {
    /// The range that best identifies the symbol's name.
    #[must_use]
    pub fn anchor_range(&self) -> Range {
        self.selection_range.unwrap_or(self.range)
    }

    /// Position used for positional requests (hover, definition, ...).
    #[must_use]
    pub fn anchor_position(&self) -> Position {
        self.anchor_range().start
    }

    /// `detail` when it carries text, otherwise the bare name.
    #[must_use]
    pub fn detail_or_name(&self) -> &str {
        match self.detail.as_deref() {
            Some(detail) if !detail.trim().is_empty() => detail,
            _ => &self.name,
        }
    }
}
