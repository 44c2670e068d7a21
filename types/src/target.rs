use serde::{Deserialize, Serialize};

use crate::position::ByteRange;

/// Identity of an indexed chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ChunkRef {
    #[must_use]
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            chunk_uid: Some(uid.into()),
            ..Self::default()
        }
    }
}

/// What the chunker believed the chunk declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolHint {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

impl SymbolHint {
    /// `None` when the hint carries no kind.
    #[must_use]
    pub fn is_function_like(&self) -> Option<bool> {
        let kind = self.kind.as_deref()?.to_ascii_lowercase();
        Some(
            ["function", "method", "constructor", "init", "func", "fn"]
                .iter()
                .any(|marker| kind.contains(marker)),
        )
    }
}

/// A candidate chunk range inside one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub virtual_path: String,
    pub virtual_range: ByteRange,
    pub chunk_ref: ChunkRef,
    #[serde(default)]
    pub symbol_hint: Option<SymbolHint>,
}

impl Target {
    #[must_use]
    pub fn chunk_uid(&self) -> Option<&str> {
        self.chunk_ref.chunk_uid.as_deref()
    }

    #[must_use]
    pub fn hint_name(&self) -> Option<&str> {
        self.symbol_hint.as_ref().and_then(|hint| hint.name.as_deref())
    }
}

/// An input document. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub virtual_path: String,
    pub text: String,
    #[serde(default)]
    pub language_id: Option<String>,
    #[serde(default)]
    pub doc_hash: Option<String>,
}

impl Document {
    #[must_use]
    pub fn new(virtual_path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            text: text.into(),
            language_id: None,
            doc_hash: None,
        }
    }

    #[must_use]
    pub fn with_language(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = Some(language_id.into());
        self
    }

    #[must_use]
    pub fn with_hash(mut self, doc_hash: impl Into<String>) -> Self {
        self.doc_hash = Some(doc_hash.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_kind_classification() {
        let hint = |kind: Option<&str>| SymbolHint {
            name: None,
            kind: kind.map(str::to_string),
        };
        assert_eq!(hint(Some("FunctionDeclaration")).is_function_like(), Some(true));
        assert_eq!(hint(Some("method")).is_function_like(), Some(true));
        assert_eq!(hint(Some("struct")).is_function_like(), Some(false));
        assert_eq!(hint(None).is_function_like(), None);
    }

    #[test]
    fn target_deserializes_from_camel_case() {
        let target: Target = serde_json::from_value(serde_json::json!({
            "virtualPath": "src/a.c",
            "virtualRange": { "start": 0, "end": 20 },
            "chunkRef": { "chunkUid": "ck1" },
            "symbolHint": { "name": "add", "kind": "function" }
        }))
        .unwrap();
        assert_eq!(target.chunk_uid(), Some("ck1"));
        assert_eq!(target.hint_name(), Some("add"));
    }
}
