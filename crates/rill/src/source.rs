//! Source text handling and positions for diagnostics.
//!
//! A [`Source`] owns the text of one compilation unit. Line endings are
//! normalised to `\n` and a shebang line is blanked out at construction so
//! the lexer never sees either. Tokens and nodes carry byte-offset [`Span`]s;
//! a span is resolved to a line/column [`Pos`] only when a diagnostic is
//! rendered.

use std::fmt;

/// Byte-offset range into a [`Source`], inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    #[must_use]
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// A span covering both `self` and `other`.
    #[must_use]
    pub fn to(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Human-facing position, 1-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// One compilation unit: a name (file path or synthetic label) plus its text.
#[derive(Debug, Clone)]
pub struct Source {
    name: String,
    text: String,
    /// Byte offset of the start of each line, always starting with 0.
    line_starts: Vec<u32>,
}

impl Source {
    /// Creates a source, normalising `\r\n` to `\n` and blanking a `#!` line.
    pub fn new(name: impl Into<String>, text: &str) -> Self {
        let mut text = text.replace("\r\n", "\n");
        if text.starts_with("#!") {
            // Keep the newline so line numbers stay stable.
            let line_end = text.find('\n').unwrap_or(text.len());
            text.replace_range(..line_end, &" ".repeat(line_end));
        }
        let mut line_starts = vec![0u32];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self {
            name: name.into(),
            text,
            line_starts,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Resolves a byte offset to a 1-based line/column position.
    ///
    /// Columns count characters, not bytes, so positions are stable for
    /// non-ASCII source text.
    #[must_use]
    pub fn pos_of(&self, offset: u32) -> Pos {
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx] as usize;
        let upto = &self.text[line_start..(offset as usize).min(self.text.len())];
        Pos {
            line: line_idx as u32 + 1,
            col: upto.chars().count() as u32 + 1,
        }
    }

    /// The full text of the line containing `offset`, without its newline.
    #[must_use]
    pub fn line_text(&self, offset: u32) -> &str {
        let pos = self.pos_of(offset);
        let start = self.line_starts[pos.line as usize - 1] as usize;
        let end = self
            .line_starts
            .get(pos.line as usize)
            .map_or(self.text.len(), |&s| s as usize - 1);
        &self.text[start..end.max(start)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let src = Source::new("t", "ab\ncd");
        assert_eq!(src.pos_of(0), Pos { line: 1, col: 1 });
        assert_eq!(src.pos_of(1), Pos { line: 1, col: 2 });
        assert_eq!(src.pos_of(3), Pos { line: 2, col: 1 });
    }

    #[test]
    fn crlf_is_normalised() {
        let src = Source::new("t", "a\r\nb");
        assert_eq!(src.text(), "a\nb");
        assert_eq!(src.pos_of(2), Pos { line: 2, col: 1 });
    }

    #[test]
    fn shebang_is_blanked() {
        let src = Source::new("t", "#!/usr/bin/env rill\nval x = 1\n");
        assert!(src.text().starts_with(' '));
        assert_eq!(src.pos_of(src.text().find('v').unwrap() as u32).line, 2);
    }

    #[test]
    fn line_text_strips_newline() {
        let src = Source::new("t", "first\nsecond\n");
        assert_eq!(src.line_text(7), "second");
    }
}
