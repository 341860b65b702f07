//! split template text into literal text and tagged constructs
//!
//! The lexer knows five markers. At every position the earliest one wins, ties are broken by
//! the order of [MARKERS]:
//!
//! | marker                        | result                                  |
//! |-------------------------------|-----------------------------------------|
//! | `{% raw %}` .. `{% endraw %}` | one verbatim [TagKind::Raw] token       |
//! | `{#` .. `#}`                  | nothing                                 |
//! | `{{` .. `}}`                  | [TagKind::Expression], content trimmed  |
//! | `{%` .. `%}`                  | [TagKind::Block], content trimmed       |
//! | `${` / `${{` .. `}` / `}}`    | [TagKind::Legacy], content as written   |
//!
//! Offsets are byte offsets into the lexed text.
use once_cell::sync::Lazy;
use regex::Regex;

static RAW_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{%\s*raw\s*%\}").unwrap());
static RAW_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{%\s*endraw\s*%\}").unwrap());
static COMMENT_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{#").unwrap());
static COMMENT_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"#\}").unwrap());
static EXPRESSION_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{").unwrap());
static EXPRESSION_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\}\}").unwrap());
static BLOCK_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{%").unwrap());
static BLOCK_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"%\}").unwrap());
static LEGACY_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{\{?").unwrap());
static LEGACY_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\}?\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Raw,
    Comment,
    Expression,
    Block,
    Legacy,
}

const MARKERS: [Marker; 5] = [
    Marker::Raw,
    Marker::Comment,
    Marker::Expression,
    Marker::Block,
    Marker::Legacy,
];

impl Marker {
    fn start(self) -> &'static Regex {
        match self {
            Marker::Raw => &RAW_START,
            Marker::Comment => &COMMENT_START,
            Marker::Expression => &EXPRESSION_START,
            Marker::Block => &BLOCK_START,
            Marker::Legacy => &LEGACY_START,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub text: &'a str,
    pub offset: usize,
}

impl<'a> Token<'a> {
    pub fn new(text: &'a str, offset: usize) -> Self {
        Self { text, offset }
    }

    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Expression,
    Block,
    Raw,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexeme<'a> {
    Text(Token<'a>),
    Tag {
        kind: TagKind,
        open: Token<'a>,
        content: Token<'a>,
        close: Token<'a>,
    },
}

impl<'a> Lexeme<'a> {
    pub fn offset(&self) -> usize {
        match self {
            Lexeme::Text(token) => token.offset,
            Lexeme::Tag { open, .. } => open.offset,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LexError {
    pub message: String,
    pub start: usize,
    pub end: usize,
}

impl LexError {
    fn unclosed(start: usize, end: usize) -> Self {
        Self {
            message: "Unclosed tag".to_owned(),
            start,
            end,
        }
    }
}

pub fn tokenize(text: &str) -> Result<Vec<Lexeme<'_>>, LexError> {
    let mut lexemes = vec![];
    let mut position = 0;

    while position < text.len() {
        let next = MARKERS
            .iter()
            .filter_map(|marker| Some((*marker, marker.start().find_at(text, position)?)))
            .min_by_key(|(_, found)| found.start());

        let Some((marker, found)) = next else {
            lexemes.push(Lexeme::Text(Token::new(&text[position..], position)));
            break;
        };

        if found.start() > position {
            lexemes.push(Lexeme::Text(Token::new(
                &text[position..found.start()],
                position,
            )));
        }

        let open = Token::new(found.as_str(), found.start());
        position = match marker {
            Marker::Raw => raw_block(text, open, &mut lexemes)?,
            Marker::Comment => match COMMENT_END.find_at(text, open.end()) {
                Some(end) => end.end(),
                None => return Err(LexError::unclosed(open.offset, open.end())),
            },
            Marker::Expression => tag(text, open, TagKind::Expression, &EXPRESSION_END, &mut lexemes)?,
            Marker::Block => tag(text, open, TagKind::Block, &BLOCK_END, &mut lexemes)?,
            Marker::Legacy => tag(text, open, TagKind::Legacy, &LEGACY_END, &mut lexemes)?,
        };
    }

    tracing::trace!(count = lexemes.len(), "tokenized template");
    Ok(lexemes)
}

/// Raw blocks nest: an inner `{% raw %}` needs its own `{% endraw %}` before the outer one closes
fn raw_block<'a>(
    text: &'a str,
    open: Token<'a>,
    lexemes: &mut Vec<Lexeme<'a>>,
) -> Result<usize, LexError> {
    let mut depth = 1;
    let mut cursor = open.end();

    let close = loop {
        let Some(end) = RAW_END.find_at(text, cursor) else {
            return Err(LexError::unclosed(open.offset, open.end()));
        };

        match RAW_START.find_at(text, cursor) {
            Some(inner) if inner.start() < end.start() => {
                depth += 1;
                cursor = inner.end();
            }
            _ => {
                depth -= 1;
                cursor = end.end();
                if depth == 0 {
                    break Token::new(end.as_str(), end.start());
                }
            }
        }
    };

    if close.offset > open.end() {
        lexemes.push(Lexeme::Tag {
            kind: TagKind::Raw,
            open,
            content: Token::new(&text[open.end()..close.offset], open.end()),
            close,
        });
    }

    Ok(close.end())
}

fn tag<'a>(
    text: &'a str,
    open: Token<'a>,
    kind: TagKind,
    end: &Regex,
    lexemes: &mut Vec<Lexeme<'a>>,
) -> Result<usize, LexError> {
    let Some(end) = end.find_at(text, open.end()) else {
        return Err(LexError::unclosed(open.offset, open.end()));
    };

    let raw = &text[open.end()..end.start()];
    let content = if kind == TagKind::Legacy {
        Token::new(raw, open.end())
    } else {
        let trimmed = raw.trim_start();
        let offset = open.end() + raw.len() - trimmed.len();
        Token::new(trimmed.trim_end(), offset)
    };

    // only zero-length bodies are dropped, `{{ }}` reaches the compiler and fails there
    if !raw.is_empty() {
        lexemes.push(Lexeme::Tag {
            kind,
            open,
            content,
            close: Token::new(end.as_str(), end.start()),
        });
    }

    Ok(end.end())
}
