//! source positions
//!
//! Everything that can end up in a diagnostic carries a [Location]: an optional file path plus a
//! start and (optional) end [Position]. Locations are pure metadata, they never take part in
//! equality of the values they describe.
//!
//! Template text is frequently a substring of a larger document (a scalar inside a vars file).
//! [offset_to_position] and [PositionIndex] therefore accept the line/column at which the text
//! starts inside its enclosing document.
use std::path::PathBuf;

/// A 1-based line/column pair
///
/// `column` is `None` when only the line is known, which happens for runtime failures that can
/// only be attributed to a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: usize,
    pub column: Option<usize>,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self {
            line,
            column: Some(column),
        }
    }

    /// A position of which only the line is known
    pub fn line(line: usize) -> Self {
        Self { line, column: None }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}", self.line, column),
            None => write!(f, "{}", self.line),
        }
    }
}

/// Where a value came from
#[derive(Debug, Clone, PartialEq, Eq, Default, derive_new::new)]
pub struct Location {
    pub file: Option<PathBuf>,
    pub start: Position,
    pub end: Option<Position>,
}

impl Location {
    /// Location of a whole file, starting at 1:1
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Some(path.into()), Position::default(), None)
    }
}

/// Locations of the nodes of a document, keyed by ref path (`a.b.2`)
pub type Locations = indexmap::IndexMap<String, Location>;

/// Line and column of the character at `offset` (a byte offset into `text`)
///
/// `initial_line` and `initial_col` are the position of the first character of `text` in its
/// enclosing document. The initial column only shifts the first line.
pub fn offset_to_position(
    text: &str,
    offset: usize,
    initial_line: usize,
    initial_col: usize,
) -> Position {
    let offset = clamp_to_char_boundary(text, offset);
    let before = &text[..offset];

    let line = before.matches('\n').count();
    let line_start = before.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    let mut column = before[line_start..].chars().count() + 1;

    if line == 0 {
        column += initial_col - 1;
    }

    Position::new(line + initial_line, column)
}

/// Memoized [offset_to_position] for a single text
///
/// Line starts are computed once, lookups are a binary search. One index is built per compile
/// unit.
#[derive(Debug, Clone)]
pub struct PositionIndex {
    text: String,
    line_starts: Vec<usize>,
    initial_line: usize,
    initial_col: usize,
}

impl PositionIndex {
    pub fn new(text: &str, initial_line: usize, initial_col: usize) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
            .collect();

        Self {
            text: text.to_owned(),
            line_starts,
            initial_line,
            initial_col,
        }
    }

    /// Index for `text` whose first character sits at `start` of its document
    pub fn starting_at(text: &str, start: Option<Position>) -> Self {
        let start = start.unwrap_or_default();
        Self::new(text, start.line, start.column.unwrap_or(1))
    }

    pub fn position(&self, offset: usize) -> Position {
        let offset = clamp_to_char_boundary(&self.text, offset);
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };

        let line_start = self.line_starts[line];
        let mut column = self.text[line_start..offset].chars().count() + 1;
        if line == 0 {
            column += self.initial_col - 1;
        }

        Position::new(line + self.initial_line, column)
    }
}

fn clamp_to_char_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}
