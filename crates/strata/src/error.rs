//! error taxonomy and diagnostic rendering
//!
//! Every error that can be blamed on user input carries one or more [ErrorDetail]s. A detail
//! renders as a boxed block:
//!
//! ```text
//! ╷
//! │ Error: VAR_5 is undefined
//! │
//! │   in vars/prod.yml on line 2 column 3
//! │   1:  line before
//! │   2:  ${VAR_5}
//! │         ^^^^^
//! │   3:  line after
//! ╵
//! ```
use crate::position::{Location, Position};
use owo_colors::OwoColorize;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lines of source shown before and after the offending lines
const CONTEXT_LINES: usize = 2;
const HINT_WIDTH: usize = 80;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unterminated template construct
    #[error("{0}")]
    Lex(ErrorDetail),
    /// Malformed tag, unknown filter, bad loop syntax, mismatched end tag or access to an
    /// internal name
    #[error("{0}")]
    Compile(ErrorDetail),
    #[error(transparent)]
    UndefinedVariable(#[from] UndefinedVariableError),
    #[error(transparent)]
    CircularDependency(#[from] CircularDependencyError),
    /// A variable that exists but cannot be used the way it was
    #[error("{0}")]
    Variable(ErrorDetail),
    /// Any other failure while evaluating a template
    #[error("{0}")]
    Render(ErrorDetail),
    /// Malformed vars document
    #[error("{0}")]
    Document(ErrorDetail),
    #[error("Filter {0} already exists")]
    DuplicateFilter(String),
    #[error("Unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failure reported by a collaborator, e.g. a lazily computed context value
    #[error("{0}")]
    External(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn external(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::External(error.into())
    }

    /// All details of this error, in reporting order
    pub fn details(&self) -> Vec<ErrorDetail> {
        match self {
            Error::Lex(detail)
            | Error::Compile(detail)
            | Error::Variable(detail)
            | Error::Render(detail)
            | Error::Document(detail) => vec![detail.clone()],
            Error::UndefinedVariable(e) => e.details.clone(),
            Error::CircularDependency(e) => vec![e.detail.clone()],
            Error::Io { path, source } => {
                vec![ErrorDetail::new(source.to_string()).with_file(Some(path.clone()))]
            }
            other => vec![ErrorDetail::new(other.to_string())],
        }
    }

    /// Boxed diagnostic blocks for every detail, reading quoted source from disk
    pub fn report(&self, color: bool) -> String {
        self.details()
            .iter()
            .map(|detail| detail.render(color))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One diagnostic: message plus best-effort location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    pub file_path: Option<PathBuf>,
    pub start: Option<Position>,
    pub end: Option<Position>,
    pub hint: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file_path: None,
            start: None,
            end: None,
            hint: None,
        }
    }

    pub fn with_file(mut self, file_path: Option<PathBuf>) -> Self {
        self.file_path = file_path;
        self
    }

    pub fn with_span(mut self, start: Position, end: Option<Position>) -> Self {
        self.start = Some(start);
        self.end = end;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn at(self, location: &Location) -> Self {
        self.with_file(location.file.clone())
            .with_span(location.start, location.end)
    }

    /// Render the boxed block, quoting the offending lines from `file_path` if it can be read
    pub fn render(&self, color: bool) -> String {
        let source = self
            .file_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok());
        self.render_with_source(source.as_deref(), color)
    }

    /// Render the boxed block, quoting the offending lines from `source`
    pub fn render_with_source(&self, source: Option<&str>, color: bool) -> String {
        let mut lines: Vec<String> = self.message.lines().map(str::to_owned).collect();
        if lines.is_empty() {
            lines.push(String::new());
        }

        for (idx, line) in lines.iter_mut().enumerate() {
            let text = if color {
                line.bold().to_string()
            } else {
                line.clone()
            };
            *line = if idx == 0 {
                format!("{} {text}", paint("Error:", color))
            } else {
                text
            };
        }

        if let Some(file_path) = &self.file_path {
            let mut position_line = format!("  in {}", file_path.display());
            if let Some(start) = self.start {
                position_line.push_str(&format!(" on line {}", start.line));
                if let Some(column) = start.column {
                    position_line.push_str(&format!(" column {column}"));
                }
            }

            lines.push(String::new());
            lines.push(position_line);

            if let (Some(start), Some(source)) = (self.start, source) {
                for line in source_block(source, start, self.end, color) {
                    lines.push(format!("  {line}"));
                }
            }
        }

        if let Some(hint) = &self.hint {
            lines.push(String::new());
            for line in hint.lines() {
                if line.is_empty() {
                    lines.push(String::new());
                } else {
                    lines.extend(wrap(line, HINT_WIDTH));
                }
            }
        }

        if lines.len() > 1 {
            let bar = paint("│", color);
            for line in lines.iter_mut() {
                *line = format!("{bar} {line}").trim_end().to_owned();
            }
            lines.insert(0, paint("╷", color));
            lines.push(paint("╵", color));
        }

        lines.join("\n")
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn paint(text: &str, color: bool) -> String {
    if color {
        text.red().to_string()
    } else {
        text.to_owned()
    }
}

/// Numbered source lines around `start..end` with the span highlighted
fn source_block(
    source: &str,
    start: Position,
    end: Option<Position>,
    color: bool,
) -> Vec<String> {
    let all: Vec<&str> = source.lines().collect();
    if start.line == 0 || start.line > all.len() {
        return vec![];
    }

    let first = start.line;
    let last = end.map(|end| end.line).unwrap_or(first).clamp(first, all.len());

    // leading context stops at a blank line
    let mut from = first.saturating_sub(CONTEXT_LINES).max(1);
    for n in from..first {
        if all[n - 1].trim().is_empty() {
            from = n + 1;
        }
    }

    // trailing context stops at a blank line
    let mut to = last;
    for n in (last + 1)..=(last + CONTEXT_LINES).min(all.len()) {
        if all[n - 1].trim().is_empty() {
            break;
        }
        to = n;
    }

    let width = to.to_string().len();
    let mut block = vec![];

    for n in from..=to {
        let line = all[n - 1];
        let (lo, hi) = highlight_range(line, n, first, last, start, end);

        let text = match (color, lo, hi) {
            (true, Some(lo), Some(hi)) => {
                let (head, rest) = split_at_char(line, lo);
                let (span, tail) = split_at_char(rest, hi - lo);
                format!("{head}{}{tail}", span.bold())
            }
            _ => line.to_owned(),
        };
        block.push(format!("{n:>width$}:  {text}").trim_end().to_owned());

        if !color && n == first {
            if let (Some(lo), Some(hi)) = (lo, hi) {
                let carets = "^".repeat((hi - lo).max(1));
                block.push(format!("{}{carets}", " ".repeat(width + 3 + lo)));
            }
        }
    }

    block
}

/// Character range of `line` (line number `n`) covered by the span
fn highlight_range(
    line: &str,
    n: usize,
    first: usize,
    last: usize,
    start: Position,
    end: Option<Position>,
) -> (Option<usize>, Option<usize>) {
    if n < first || n > last {
        return (None, None);
    }

    let len = line.chars().count();
    let lo = if n == first {
        start.column.map(|c| c.saturating_sub(1)).unwrap_or(0)
    } else {
        0
    };
    let hi = match end {
        Some(Position {
            line: end_line,
            column: Some(column),
        }) if end_line == n => column.saturating_sub(1),
        _ => len,
    };

    let lo = lo.min(len);
    (Some(lo), Some(hi.clamp(lo, len.max(lo))))
}

fn split_at_char(text: &str, chars: usize) -> (&str, &str) {
    let idx = text
        .char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    text.split_at(idx)
}

fn wrap(line: &str, width: usize) -> Vec<String> {
    let mut wrapped = vec![];
    let mut current = String::new();

    for word in line.split(' ') {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            wrapped.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    wrapped.push(current);

    wrapped
}

fn join_messages(details: &[ErrorDetail]) -> String {
    details
        .iter()
        .map(|detail| detail.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// One or more names could not be resolved
///
/// All unresolved names are collected, not just the first one.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{}", join_messages(.details))]
pub struct UndefinedVariableError {
    /// Sorted, unique
    pub names: Vec<String>,
    /// One detail per name, same order as `names`
    pub details: Vec<ErrorDetail>,
}

impl UndefinedVariableError {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        let details = names
            .iter()
            .map(|name| ErrorDetail::new(format!("{name} is undefined")))
            .collect();

        Self { names, details }
    }

    /// Detail for `name`, to attach a location to it
    pub fn detail_mut(&mut self, name: &str) -> Option<&mut ErrorDetail> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.details.get_mut(idx)
    }
}

/// The object-tree resolver found refs that depend on each other
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{detail}")]
pub struct CircularDependencyError {
    /// The full cycle, first and last element are the same ref
    pub path: Vec<String>,
    pub detail: ErrorDetail,
}

impl CircularDependencyError {
    pub fn new(path: Vec<String>) -> Self {
        let detail = ErrorDetail::new(format!(
            "Found circular dependency: {}",
            path.join(" -> ")
        ));
        Self { path, detail }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_only_is_not_boxed() {
        let detail = ErrorDetail::new("something broke");
        assert_eq!(detail.render_with_source(None, false), "Error: something broke");
    }

    #[test]
    fn boxed_block_with_caret() {
        let source = "line before\n${VAR_5}\nline after\n";
        let detail = ErrorDetail::new("VAR_5 is undefined")
            .with_file(Some("vars.yml".into()))
            .with_span(Position::new(2, 3), Some(Position::new(2, 8)));

        let expected = [
            "╷",
            "│ Error: VAR_5 is undefined",
            "│",
            "│   in vars.yml on line 2 column 3",
            "│   1:  line before",
            "│   2:  ${VAR_5}",
            "│         ^^^^^",
            "│   3:  line after",
            "╵",
        ]
        .join("\n");

        assert_eq!(detail.render_with_source(Some(source), false), expected);
    }

    #[test]
    fn context_stops_at_blank_lines() {
        let source = "a\n\nb\nc\n\nd";
        let block = source_block(source, Position::new(3, 1), None, false);
        assert_eq!(block, vec!["3:  b", "    ^", "4:  c"]);
    }

    #[test]
    fn hint_is_wrapped() {
        let detail = ErrorDetail::new("bad").with_hint("word ".repeat(20).trim_end().to_owned());
        let rendered = detail.render_with_source(None, false);
        assert!(rendered
            .lines()
            .all(|line| line.chars().count() <= HINT_WIDTH + 2));
        assert!(rendered.starts_with("╷\n│ Error: bad\n│\n│ word"));
    }

    #[test]
    fn undefined_names_are_sorted_and_unique() {
        let error = UndefinedVariableError::new(["b", "a", "b"]);
        assert_eq!(error.names, vec!["a", "b"]);
        assert_eq!(error.to_string(), "a is undefined\nb is undefined");
    }
}
