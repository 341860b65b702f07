//! YAML documents that remember where every node came from
//!
//! Vars files are YAML. Besides the [Value] tree a [Document] carries a [Location] per node,
//! keyed by ref path (`a.b.2`, the root is `""`), so templates embedded in scalars report
//! errors at their position in the file.
use crate::error::{Error, ErrorDetail, Result};
use crate::position::{Location, Locations, Position};
use crate::value::{Object, Value};
use crate::variable::join_ref;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::{Marker, TScalarStyle};

static DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static BLOCK_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)[|>][-+1-9]{0,2}\s*(?:#.*)?$").unwrap());

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub value: Value,
    pub locations: Locations,
    pub file: Option<PathBuf>,
}

impl Document {
    pub fn parse(text: &str, file: Option<PathBuf>) -> Result<Self> {
        let mut builder = Builder::new(text, file.clone());
        let mut parser = Parser::new_from_str(text);

        if let Err(e) = parser.load(&mut builder, false) {
            return Err(Error::Document(
                ErrorDetail::new(format!("Invalid YAML: {}", e.info()))
                    .with_file(file)
                    .with_span(position(e.marker()), None),
            ));
        }

        builder.finish()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        tracing::debug!(path = %path.display(), "parsing document");
        Self::parse(&text, Some(path.to_path_buf()))
    }

    pub fn location(&self, reference: &str) -> Option<&Location> {
        self.locations.get(reference)
    }
}

fn position(marker: &Marker) -> Position {
    Position::new(marker.line().max(1), marker.col() + 1)
}

enum Node {
    Sequence {
        reference: String,
        items: Vec<Value>,
    },
    Mapping {
        reference: String,
        object: Object,
        key: Option<String>,
    },
}

/// What the next node in the event stream is
enum Slot {
    Key,
    Value(String),
}

struct Builder<'a> {
    lines: Vec<&'a str>,
    file: Option<PathBuf>,
    stack: Vec<Node>,
    root: Option<Value>,
    locations: Locations,
    error: Option<Error>,
    /// Line of the previous event, a block scalar header is at or after it
    previous_line: usize,
}

impl<'a> Builder<'a> {
    fn new(text: &'a str, file: Option<PathBuf>) -> Self {
        Self {
            lines: text.lines().collect(),
            file,
            stack: vec![],
            root: None,
            locations: Locations::new(),
            error: None,
            previous_line: 1,
        }
    }

    fn finish(self) -> Result<Document> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let mut locations = self.locations;
        if !locations.contains_key("") {
            locations.insert(String::new(), Location::new(self.file.clone(), Position::default(), None));
        }

        Ok(Document {
            value: self.root.unwrap_or_default(),
            locations,
            file: self.file,
        })
    }

    fn fail(&mut self, message: &str, marker: &Marker) {
        if self.error.is_none() {
            self.error = Some(Error::Document(
                ErrorDetail::new(message)
                    .with_file(self.file.clone())
                    .with_span(position(marker), None),
            ));
        }
    }

    fn slot(&self) -> Slot {
        match self.stack.last() {
            None => Slot::Value(String::new()),
            Some(Node::Sequence { reference, items }) => Slot::Value(join_ref(reference, items.len())),
            Some(Node::Mapping {
                key: None,
                ..
            }) => Slot::Key,
            Some(Node::Mapping {
                reference,
                key: Some(key),
                ..
            }) => Slot::Value(join_ref(reference, key)),
        }
    }

    /// Claim the position for a container or reject it as a mapping key
    fn open(&mut self, marker: &Marker) -> Option<String> {
        match self.slot() {
            Slot::Key => {
                self.fail("Mapping keys must be scalars", marker);
                None
            }
            Slot::Value(reference) => {
                self.locate(&reference, position(marker));
                Some(reference)
            }
        }
    }

    fn locate(&mut self, reference: &str, start: Position) {
        self.locations.insert(
            reference.to_owned(),
            Location::new(self.file.clone(), start, None),
        );
    }

    fn complete(&mut self, value: Value) {
        match self.stack.last_mut() {
            None => self.root = Some(value),
            Some(Node::Sequence { items, .. }) => items.push(value),
            Some(Node::Mapping { object, key, .. }) => {
                if let Some(key) = key.take() {
                    object.insert(key, value);
                }
            }
        }
    }

    /// Where the content of a scalar starts, the marker points at the opening quote
    fn scalar_start(&self, marker: &Marker, style: TScalarStyle) -> Position {
        match style {
            TScalarStyle::SingleQuoted | TScalarStyle::DoubleQuoted => {
                Position::new(marker.line().max(1), marker.col() + 2)
            }
            TScalarStyle::Literal | TScalarStyle::Folded => self.block_start(marker),
            _ => position(marker),
        }
    }

    /// First content line of a `|`/`>` block scalar
    ///
    /// The marker of a block scalar does not point at its header, so the header is searched
    /// from the previous event's line on.
    fn block_start(&self, marker: &Marker) -> Position {
        let from = self.previous_line.max(1);
        let to = marker.line().max(from).min(self.lines.len());

        let content = (from..=to)
            .find(|n| BLOCK_HEADER.is_match(self.lines[n - 1]))
            .and_then(|header| {
                (header + 1..=self.lines.len()).find(|n| !self.lines[n - 1].trim().is_empty())
            });

        match content {
            Some(line) => {
                let indent = self.lines[line - 1]
                    .chars()
                    .take_while(|c| *c == ' ')
                    .count();
                Position::new(line, indent + 1)
            }
            None => position(marker),
        }
    }

    fn scalar(&mut self, text: String, style: TScalarStyle, marker: &Marker) {
        let reference = match self.slot() {
            Slot::Key => {
                if let Some(Node::Mapping { key, .. }) = self.stack.last_mut() {
                    *key = Some(text);
                }
                return;
            }
            Slot::Value(reference) => reference,
        };

        let start = self.scalar_start(marker, style);
        self.locate(&reference, start);
        if matches!(style, TScalarStyle::Literal | TScalarStyle::Folded) {
            self.previous_line = self.previous_line.max(start.line);
        }

        let value = match style {
            TScalarStyle::Plain => infer(text),
            _ => Value::String(text),
        };
        self.complete(value);
    }
}

impl<'a> MarkedEventReceiver for Builder<'a> {
    fn on_event(&mut self, ev: Event, marker: Marker) {
        if self.error.is_some() {
            return;
        }

        match ev {
            Event::Scalar(text, style, ..) => self.scalar(text, style, &marker),
            Event::SequenceStart(..) => {
                if let Some(reference) = self.open(&marker) {
                    self.stack.push(Node::Sequence {
                        reference,
                        items: vec![],
                    });
                }
            }
            Event::MappingStart(..) => {
                if let Some(reference) = self.open(&marker) {
                    self.stack.push(Node::Mapping {
                        reference,
                        object: Object::new(),
                        key: None,
                    });
                }
            }
            Event::SequenceEnd | Event::MappingEnd => {
                let value = match self.stack.pop() {
                    Some(Node::Sequence { items, .. }) => Value::Array(items),
                    Some(Node::Mapping { object, .. }) => Value::Object(object),
                    None => return,
                };
                self.complete(value);
            }
            Event::Alias(_) => self.fail("YAML aliases are not supported", &marker),
            _ => {}
        }
        self.previous_line = self.previous_line.max(marker.line());
    }
}

/// Type of a plain scalar, following the YAML core schema
fn infer(text: String) -> Value {
    match text.as_str() {
        "" | "~" | "null" | "Null" | "NULL" => Value::Null,
        "true" | "True" | "TRUE" => Value::Boolean(true),
        "false" | "False" | "FALSE" => Value::Boolean(false),
        ".inf" | ".Inf" | ".INF" | "+.inf" => Value::Decimal(f64::INFINITY),
        "-.inf" | "-.Inf" | "-.INF" => Value::Decimal(f64::NEG_INFINITY),
        ".nan" | ".NaN" | ".NAN" => Value::Decimal(f64::NAN),
        _ => {
            if let Ok(i) = text.parse::<i64>() {
                return Value::Integer(i);
            }
            if text.chars().any(|c| c.is_ascii_digit()) {
                if let Ok(d) = text.parse::<f64>() {
                    return Value::Decimal(d);
                }
            }
            if DATE.is_match(&text) {
                if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
                    return Value::Date(date);
                }
            }
            Value::String(text)
        }
    }
}
