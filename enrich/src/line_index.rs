//! Line/character <-> byte offset mapping.
//!
//! LSP positions count UTF-16 code units; targets use UTF-8 byte offsets.

use typelift_types::{ByteRange, Position, Range};

#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    /// Byte offset of the first byte of each line.
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    #[must_use]
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { text, line_starts }
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Text of `line` without its terminator. Empty past the end.
    #[must_use]
    pub fn line_text(&self, line: u32) -> &'a str {
        let Some(&start) = self.line_starts.get(line as usize) else {
            return "";
        };
        let end = self
            .line_starts
            .get(line as usize + 1)
            .map_or(self.text.len(), |next| next - 1);
        self.text[start..end].trim_end_matches('\r')
    }

    /// Byte offset of `position`, clamped to the line and the document.
    #[must_use]
    pub fn offset(&self, position: Position) -> usize {
        let Some(&start) = self.line_starts.get(position.line as usize) else {
            return self.text.len();
        };
        let line = self.line_text(position.line);
        let mut units = 0u32;
        for (byte, ch) in line.char_indices() {
            if units >= position.character {
                return start + byte;
            }
            units += ch.len_utf16() as u32;
        }
        start + line.len()
    }

    #[must_use]
    pub fn range_to_offsets(&self, range: Range) -> ByteRange {
        let start = self.offset(range.start);
        let end = self.offset(range.end).max(start);
        ByteRange::new(start, end)
    }

    /// Byte offset where `line` starts, clamped to the document.
    #[must_use]
    pub fn line_start(&self, line: u32) -> usize {
        self.line_starts
            .get(line as usize)
            .copied()
            .unwrap_or(self.text.len())
    }

    /// Byte offset just past the end of `line`'s text.
    #[must_use]
    pub fn line_end(&self, line: u32) -> usize {
        self.line_start(line) + self.line_text(line).len()
    }

    /// `text[start..end]`, clamped to the document and char boundaries.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        let clamp = |mut i: usize| {
            i = i.min(self.text.len());
            while !self.text.is_char_boundary(i) {
                i -= 1;
            }
            i
        };
        let (start, end) = (clamp(start), clamp(end));
        &self.text[start..end.max(start)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_ascii_positions() {
        let index = LineIndex::new("int a;\nint add(int x) {\n}\n");
        assert_eq!(index.offset(Position::new(1, 4)), 11);
        assert_eq!(index.line_text(1), "int add(int x) {");
        assert_eq!(index.line_count(), 4);
    }

    #[test]
    fn counts_utf16_units() {
        // 'é' is 2 bytes / 1 unit, '😀' is 4 bytes / 2 units.
        let index = LineIndex::new("é😀x");
        assert_eq!(index.offset(Position::new(0, 1)), 2);
        assert_eq!(index.offset(Position::new(0, 3)), 6);
    }

    #[test]
    fn clamps_out_of_range() {
        let index = LineIndex::new("ab\r\ncd");
        assert_eq!(index.line_text(0), "ab");
        assert_eq!(index.offset(Position::new(0, 99)), 2);
        assert_eq!(index.offset(Position::new(9, 0)), 6);
        let range = index.range_to_offsets(Range::new(Position::new(1, 1), Position::new(0, 0)));
        assert_eq!(range, ByteRange::new(5, 5));
    }
}
