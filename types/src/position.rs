use serde::{Deserialize, Serialize};

/// Zero-based line/character position as used on the LSP wire.
///
/// `character` is measured in UTF-16 code units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }

    /// `line:character`, the key used for per-document request dedup.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.line, self.character)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// Byte offsets into a document's UTF-8 text.
///
/// Bounds are compared inclusively when testing overlap, matching how chunk
/// ranges are produced upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.end >= other.start && self.start <= other.end
    }

    /// True when `self` lies entirely within `outer`.
    #[must_use]
    pub fn within(&self, outer: &ByteRange) -> bool {
        self.start >= outer.start && self.end <= outer.end
    }
}
