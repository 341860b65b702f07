//! turn lexed template pieces into a [Program]
//!
//! The compiler is incremental: the driver in [crate::template] feeds it one lexeme at a time
//! (`compile_*`). `compile_if` and `compile_for` open blocks, closed by
//! [TemplateCompiler::close_block]. While compiling, bare names are rewritten:
//!
//! - a loop variable in scope stays a [ExprKind::Local]
//! - everything else becomes a [ExprKind::Context] lookup and is recorded as a free reference
//!
//! Names starting with `_` are reserved and rejected, as are attributes starting with `_`.
use crate::ast::{Expr, ExprKind, Span, Stmt, StmtKind};
use crate::error::{Error, ErrorDetail, Result};
use crate::lexer::{LexError, Token};
use crate::parser::{self, ParseError};
use crate::position::{Location, Position, PositionIndex};
use crate::registry;
use crate::value::Value;
use crate::variable::{VariableRef, VariableStore};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

static VAR_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z_0-9]*$").unwrap());

/// A compiled template
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
    /// The template is a single expression and renders to that expression's value
    pub value_mode: bool,
    pub variables: VariableStore,
    pub file: Option<PathBuf>,
    index: PositionIndex,
}

impl Program {
    pub fn position(&self, offset: usize) -> Position {
        self.index.position(offset)
    }
}

#[derive(Debug)]
enum OpenBlock {
    If {
        cond: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        in_else: bool,
        span: Span,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
}

#[derive(Debug)]
pub struct TemplateCompiler {
    value_mode: bool,
    file: Option<PathBuf>,
    index: PositionIndex,
    variables: VariableStore,
    root: Vec<Stmt>,
    blocks: Vec<OpenBlock>,
}

impl TemplateCompiler {
    /// `location` is where `source` starts inside its file, if it came from one
    pub fn new(source: &str, location: Option<&Location>) -> Self {
        Self {
            value_mode: false,
            file: location.and_then(|location| location.file.clone()),
            index: PositionIndex::starting_at(source, location.map(|location| location.start)),
            variables: VariableStore::new(),
            root: vec![],
            blocks: vec![],
        }
    }

    /// In value mode the only compiled piece becomes the template's value instead of text
    pub fn set_value_mode(&mut self, value_mode: bool) {
        self.value_mode = value_mode;
    }

    fn detail(&self, message: impl Into<String>, span: Span) -> ErrorDetail {
        ErrorDetail::new(message)
            .with_file(self.file.clone())
            .with_span(
                self.index.position(span.start),
                Some(self.index.position(span.end)),
            )
    }

    pub fn syntax_error(&self, message: impl Into<String>, span: Span) -> Error {
        Error::Compile(self.detail(message, span))
    }

    pub fn lex_error(&self, error: LexError) -> Error {
        Error::Lex(self.detail(error.message, Span::new(error.start, error.end)))
    }

    fn parse_error(&self, error: ParseError) -> Error {
        self.syntax_error(error.message, error.span)
    }

    fn body(&mut self) -> &mut Vec<Stmt> {
        match self.blocks.last_mut() {
            None => &mut self.root,
            Some(OpenBlock::If {
                body,
                orelse,
                in_else,
                ..
            }) => {
                if *in_else {
                    orelse
                } else {
                    body
                }
            }
            Some(OpenBlock::For { body, .. }) => body,
        }
    }

    fn append(&mut self, expr: Expr, span: Span) {
        let kind = if self.value_mode {
            StmtKind::Return(expr)
        } else {
            StmtKind::Append(expr)
        };
        self.body().push(Stmt { kind, span });
    }

    pub fn compile_constant(&mut self, text: Token) {
        let span = Span::new(text.offset, text.end());
        let literal = Expr::new(ExprKind::Literal(Value::from(text.text)), span);
        self.append(literal, span);
    }

    /// `{{ expr|filter }}`, `content` is the trimmed tag content
    pub fn compile_expression(&mut self, content: Token) -> Result<()> {
        let expr = parser::parse_expression(content.text, content.offset)
            .map_err(|e| self.parse_error(e))?;
        let expr = self.resolve(expr)?;
        self.append(expr, Span::new(content.offset, content.end()));
        Ok(())
    }

    /// `${NAME}`; the doubled `${{NAME}}` and unbalanced forms are kept as text
    pub fn compile_legacy_expression(
        &mut self,
        open: Token,
        content: Token,
        close: Token,
    ) -> Result<()> {
        let span = Span::new(open.offset, close.end());

        let expr = match (open.text, close.text) {
            ("${{", "}}") => Expr::new(
                ExprKind::Literal(Value::String(format!("${{{}}}", content.text))),
                span,
            ),
            ("${{", _) | (_, "}}") => Expr::new(
                ExprKind::Literal(Value::String(format!(
                    "{}{}{}",
                    open.text, content.text, close.text
                ))),
                span,
            ),
            _ => {
                let content = trim(content);
                let expr = parser::parse_value(content.text, content.offset)
                    .map_err(|e| self.parse_error(e))?;
                self.resolve(expr)?
            }
        };

        self.append(expr, span);
        Ok(())
    }

    /// `{% if expr %}`; `args` is everything after `if`, `tag` the tag content
    pub fn compile_if(&mut self, args: Token, tag: Span) -> Result<()> {
        let args = trim(args);
        if args.text.is_empty() {
            return Err(self.syntax_error("Missing condition expression", tag));
        }

        let cond = parser::parse_expression(args.text, args.offset)
            .map_err(|e| self.parse_error(e))?;
        let cond = self.resolve(cond)?;

        self.start_block(OpenBlock::If {
            cond,
            body: vec![],
            orelse: vec![],
            in_else: false,
            span: tag,
        });
        Ok(())
    }

    /// `{% for NAME in expr %}`, NAME is only visible until the matching end tag
    pub fn compile_for(&mut self, args: Token, tag: Span) -> Result<()> {
        let args = trim(args);
        let invalid = || self.syntax_error("Invalid syntax", Span::new(args.offset, args.end()));

        let (var, rest) = split_word(args).ok_or_else(invalid)?;
        let (op, container) = split_word(rest).ok_or_else(invalid)?;

        if !VAR_NAME.is_match(var.text) || op.text != "in" || container.text.is_empty() {
            return Err(invalid());
        }
        if var.text.starts_with('_') {
            return Err(self.syntax_error(
                "Variable names cannot start with an underscore",
                Span::new(var.offset, var.end()),
            ));
        }

        let iter = parser::parse_expression(container.text, container.offset)
            .map_err(|e| self.parse_error(e))?;
        let iter = self.resolve(iter)?;

        self.start_block(OpenBlock::For {
            var: var.text.to_owned(),
            iter,
            body: vec![],
            span: tag,
        });
        self.variables.declare(var.text);
        Ok(())
    }

    /// `{% include "name" [indent=N] [key=value ...] %}`
    ///
    /// Without an explicit `indent`, included lines are indented to the column of the tag.
    pub fn compile_include(&mut self, args: Token, tag_offset: usize, tag: Span) -> Result<()> {
        let args = trim(args);
        let arguments = parser::parse_arguments(args.text, args.offset)
            .map_err(|e| self.parse_error(e))?;

        let [target] = <[Expr; 1]>::try_from(arguments.positional).map_err(|_| {
            self.syntax_error("include takes exactly one template name", tag)
        })?;
        let target = self.resolve(target)?;

        let mut indent = None;
        let mut bindings = vec![];
        for (name, span, value) in arguments.keywords {
            let value = self.resolve(value)?;
            match name.as_str() {
                "indent" => indent = Some(value),
                _ if name.starts_with('_') => {
                    return Err(self.syntax_error(
                        "Variable names cannot start with an underscore",
                        span,
                    ))
                }
                _ => bindings.push((name, value)),
            }
        }

        let indent = indent.unwrap_or_else(|| {
            let column = self.index.position(tag_offset).column.unwrap_or(1);
            Expr::new(
                ExprKind::Literal(Value::Integer(column as i64 - 1)),
                tag,
            )
        });

        let include = Expr::new(
            ExprKind::Include {
                target: Box::new(target),
                args: bindings,
                indent: Box::new(indent),
            },
            tag,
        );
        self.append(include, tag);
        Ok(())
    }

    fn start_block(&mut self, block: OpenBlock) {
        self.blocks.push(block);
        self.variables.begin_scope();
    }

    pub fn close_block(&mut self) -> Result<()> {
        let (kind, span) = match self.blocks.pop() {
            Some(OpenBlock::If {
                cond,
                body,
                orelse,
                span,
                ..
            }) => (StmtKind::If { cond, body, orelse }, span),
            Some(OpenBlock::For {
                var,
                iter,
                body,
                span,
            }) => (StmtKind::For { var, iter, body }, span),
            None => {
                return Err(self.syntax_error("Unexpected end block", Span::default()));
            }
        };

        self.variables.end_scope();
        self.body().push(Stmt { kind, span });
        Ok(())
    }

    pub fn start_else_block(&mut self, span: Span) -> Result<()> {
        match self.blocks.last_mut() {
            Some(OpenBlock::If { in_else, .. }) if !*in_else => {
                *in_else = true;
                Ok(())
            }
            _ => Err(self.syntax_error("Unexpected else block", span)),
        }
    }

    pub fn finalize(self) -> Result<Program> {
        if let Some(block) = self.blocks.last() {
            let span = match block {
                OpenBlock::If { span, .. } | OpenBlock::For { span, .. } => *span,
            };
            return Err(self.syntax_error("Unclosed block", span));
        }

        tracing::trace!(
            statements = self.root.len(),
            value_mode = self.value_mode,
            "compiled template"
        );

        Ok(Program {
            body: self.root,
            value_mode: self.value_mode,
            variables: self.variables,
            file: self.file,
            index: self.index,
        })
    }

    /// Record the free reference `expr` makes (if any) and rewrite its names
    fn resolve(&mut self, expr: Expr) -> Result<Expr> {
        if let Some((nodes, end)) = self.reference_nodes(&expr) {
            let reference = VariableRef::from_nodes(
                nodes,
                self.index.position(expr.span.start),
                self.index.position(end),
            );
            self.variables.record(reference);
        }
        self.rewrite(expr)
    }

    /// Nodes of the static part of an access chain rooted at a free name, with the offset where
    /// that static part ends
    fn reference_nodes(&self, expr: &Expr) -> Option<(Vec<String>, usize)> {
        match &expr.kind {
            ExprKind::Name(name)
                if !name.starts_with('_')
                    && !self.variables.is_local(name)
                    && !registry::is_builtin(name) =>
            {
                Some((vec![name.clone()], expr.span.end))
            }
            ExprKind::Attr(target, attr) => {
                let (mut nodes, _) = self.reference_nodes(target)?;
                nodes.push(attr.clone());
                Some((nodes, expr.span.end))
            }
            ExprKind::Index(target, index) => {
                let (mut nodes, end) = self.reference_nodes(target)?;
                match &index.kind {
                    ExprKind::Literal(Value::String(key)) => nodes.push(key.clone()),
                    ExprKind::Literal(Value::Integer(idx)) => nodes.push(idx.to_string()),
                    _ => return Some((nodes, end)),
                }
                Some((nodes, expr.span.end))
            }
            ExprKind::Slice { target, .. } => self.reference_nodes(target),
            _ => None,
        }
    }

    fn resolve_all(&mut self, exprs: Vec<Expr>) -> Result<Vec<Expr>> {
        exprs.into_iter().map(|expr| self.resolve(expr)).collect()
    }

    fn resolve_boxed(&mut self, expr: Box<Expr>) -> Result<Box<Expr>> {
        Ok(Box::new(self.resolve(*expr)?))
    }

    /// Rewrite names without recording; the caller recorded the chain `expr` belongs to
    fn rewrite(&mut self, expr: Expr) -> Result<Expr> {
        let Expr { kind, span } = expr;

        let kind = match kind {
            ExprKind::Name(name) => {
                if name.starts_with('_') {
                    return Err(self.syntax_error(
                        "Variable names cannot start with an underscore",
                        span,
                    ));
                }
                if self.variables.is_local(&name) {
                    ExprKind::Local(name)
                } else if registry::is_builtin(&name) {
                    return Err(self.syntax_error(
                        format!("{name} is a built-in function and must be called"),
                        span,
                    ));
                } else {
                    ExprKind::Context(name)
                }
            }
            ExprKind::Attr(target, attr) => {
                if attr.starts_with('_') {
                    return Err(self.syntax_error(format!("Unknown attribute: {attr}"), span));
                }
                ExprKind::Attr(Box::new(self.rewrite(*target)?), attr)
            }
            ExprKind::Index(target, index) => {
                let target = Box::new(self.rewrite(*target)?);
                ExprKind::Index(target, self.resolve_boxed(index)?)
            }
            ExprKind::Slice {
                target,
                lower,
                upper,
            } => ExprKind::Slice {
                target: Box::new(self.rewrite(*target)?),
                lower: lower.map(|e| self.resolve_boxed(e)).transpose()?,
                upper: upper.map(|e| self.resolve_boxed(e)).transpose()?,
            },
            ExprKind::List(items) => ExprKind::List(self.resolve_all(items)?),
            ExprKind::Unary(op, operand) => ExprKind::Unary(op, self.resolve_boxed(operand)?),
            ExprKind::Binary(op, left, right) => {
                let left = self.resolve_boxed(left)?;
                ExprKind::Binary(op, left, self.resolve_boxed(right)?)
            }
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => ExprKind::Conditional {
                cond: self.resolve_boxed(cond)?,
                then: self.resolve_boxed(then)?,
                otherwise: self.resolve_boxed(otherwise)?,
            },
            ExprKind::Call { name, args } => {
                if !registry::is_builtin(&name) {
                    return Err(self.syntax_error(format!("Unknown function: {name}"), span));
                }
                ExprKind::Call {
                    name,
                    args: self.resolve_all(args)?,
                }
            }
            ExprKind::Filter { name, input, args } => {
                let Some(filter) = registry::lookup_filter(&name) else {
                    let name_span = Span::new(span.start, span.start + name.len());
                    return Err(self.syntax_error(format!("Unknown filter: {name}"), name_span));
                };
                self.variables.define(name.clone(), filter);

                ExprKind::Filter {
                    name,
                    input: self.resolve_boxed(input)?,
                    args: self.resolve_all(args)?,
                }
            }
            ExprKind::Include {
                target,
                args,
                indent,
            } => ExprKind::Include {
                target: self.resolve_boxed(target)?,
                args: args
                    .into_iter()
                    .map(|(name, value)| Ok((name, self.resolve(value)?)))
                    .collect::<Result<_>>()?,
                indent: self.resolve_boxed(indent)?,
            },
            kind @ (ExprKind::Literal(_) | ExprKind::Context(_) | ExprKind::Local(_)) => kind,
        };

        Ok(Expr::new(kind, span))
    }
}

/// `token` without surrounding whitespace
pub(crate) fn trim(token: Token<'_>) -> Token<'_> {
    let start = token.text.trim_start();
    let offset = token.offset + token.text.len() - start.len();
    Token::new(start.trim_end(), offset)
}

/// The first whitespace separated word of `token` and the trimmed rest
pub(crate) fn split_word(token: Token<'_>) -> Option<(Token<'_>, Token<'_>)> {
    let (word, rest) = token.text.split_once(char::is_whitespace)?;
    let rest = Token::new(rest, token.offset + word.len() + 1);
    Some((Token::new(word, token.offset), trim(rest)))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compiler(source: &str) -> TemplateCompiler {
        TemplateCompiler::new(source, None)
    }

    fn span_of(error: Error) -> (String, Option<Position>, Option<Position>) {
        let detail = error.details().remove(0);
        (detail.message, detail.start, detail.end)
    }

    #[test]
    fn value_mode_returns_the_expression() {
        let mut c = compiler("{{ 5 }}");
        c.set_value_mode(true);
        c.compile_expression(Token::new("5", 3)).unwrap();
        let program = c.finalize().unwrap();

        assert_eq!(
            program.body,
            vec![Stmt {
                kind: StmtKind::Return(Expr::new(
                    ExprKind::Literal(Value::Integer(5)),
                    Span::new(3, 4)
                )),
                span: Span::new(3, 4),
            }]
        );
    }

    #[test]
    fn free_names_become_context_lookups() {
        let mut c = compiler("{{ a.b[0] + x[y] }}");
        c.compile_expression(Token::new("a.b[0] + x[y]", 3)).unwrap();
        let program = c.finalize().unwrap();

        let refs: Vec<_> = program.variables.refs().map(|r| r.name.as_str()).collect();
        assert_eq!(refs, vec!["a.b.0", "x", "y"]);

        let StmtKind::Append(expr) = &program.body[0].kind else {
            panic!("expected append");
        };
        let ExprKind::Binary(_, _, right) = &expr.kind else {
            panic!("expected binary");
        };
        assert!(matches!(
            &right.kind,
            ExprKind::Index(target, index)
                if target.kind == ExprKind::Context("x".into())
                    && index.kind == ExprKind::Context("y".into())
        ));
    }

    #[test]
    fn reference_positions() {
        let mut c = compiler("{{ x[y] }}");
        c.compile_expression(Token::new("x[y]", 3)).unwrap();
        let program = c.finalize().unwrap();

        let x = program.variables.get_ref("x").unwrap();
        assert_eq!((x.start, x.end), (Position::new(1, 4), Position::new(1, 5)));
    }

    #[test]
    fn loop_variables_are_scoped() {
        let source = "{% for item in items %}{{ item.name }}{% endfor %}{{ item }}";
        let mut c = compiler(source);
        c.compile_for(Token::new(" item in items", 6), Span::new(3, 20)).unwrap();
        c.compile_expression(Token::new("item.name", 26)).unwrap();
        c.close_block().unwrap();
        c.compile_expression(Token::new("item", 53)).unwrap();
        let program = c.finalize().unwrap();

        let refs: Vec<_> = program.variables.refs().map(|r| r.name.as_str()).collect();
        assert_eq!(refs, vec!["items", "item"]);

        let StmtKind::For { body, .. } = &program.body[0].kind else {
            panic!("expected for");
        };
        assert!(matches!(
            &body[0].kind,
            StmtKind::Append(Expr { kind: ExprKind::Attr(target, _), .. })
                if target.kind == ExprKind::Local("item".into())
        ));
    }

    #[test]
    fn reserved_names() {
        let mut c = compiler("{{ _x }}");
        assert_eq!(
            span_of(c.compile_expression(Token::new("_x", 3)).unwrap_err()),
            (
                "Variable names cannot start with an underscore".to_owned(),
                Some(Position::new(1, 4)),
                Some(Position::new(1, 6))
            )
        );

        let mut c = compiler("{{ a._b }}");
        assert_eq!(
            span_of(c.compile_expression(Token::new("a._b", 3)).unwrap_err()).0,
            "Unknown attribute: _b"
        );
    }

    #[test]
    fn unknown_filter_points_at_its_name() {
        let mut c = compiler("{{ x|nope }}");
        assert_eq!(
            span_of(c.compile_expression(Token::new("x|nope", 3)).unwrap_err()),
            (
                "Unknown filter: nope".to_owned(),
                Some(Position::new(1, 6)),
                Some(Position::new(1, 10))
            )
        );
    }

    #[test]
    fn only_builtins_are_callable() {
        let mut c = compiler("{{ open(x) }}");
        assert_eq!(
            span_of(c.compile_expression(Token::new("open(x)", 3)).unwrap_err()).0,
            "Unknown function: open"
        );
    }

    #[test]
    fn legacy_forms() {
        let literal = |open, content, close| {
            let mut c = compiler("");
            c.compile_legacy_expression(
                Token::new(open, 0),
                Token::new(content, 0),
                Token::new(close, 0),
            )
            .unwrap();
            match c.finalize().unwrap().body.remove(0).kind {
                StmtKind::Append(Expr {
                    kind: ExprKind::Literal(Value::String(text)),
                    ..
                }) => Some(text),
                _ => None,
            }
        };

        assert_eq!(literal("${{", "X", "}}"), Some("${X}".to_owned()));
        assert_eq!(literal("${", "X", "}}"), Some("${X}}".to_owned()));
        assert_eq!(literal("${{", "X", "}"), Some("${{X}".to_owned()));
        assert_eq!(literal("${", "X", "}"), None);
    }

    #[test]
    fn bad_for_syntax() {
        for args in [" x", " x of y", " 1x in y", " x in "] {
            let mut c = compiler("");
            assert_eq!(
                span_of(c.compile_for(Token::new(args, 0), Span::default()).unwrap_err()).0,
                "Invalid syntax",
                "{args}"
            );
        }
    }

    #[test]
    fn include_indent_defaults_to_tag_column() {
        let source = "key:\n    {% include \"part.txt\" %}";
        let mut c = compiler(source);
        c.compile_include(Token::new(" \"part.txt\"", 19), 9, Span::new(12, 30))
            .unwrap();
        let program = c.finalize().unwrap();

        let StmtKind::Append(Expr {
            kind: ExprKind::Include { indent, .. },
            ..
        }) = &program.body[0].kind
        else {
            panic!("expected include");
        };
        assert_eq!(indent.kind, ExprKind::Literal(Value::Integer(4)));
    }

    #[test]
    fn embedded_templates_report_document_positions() {
        let location = Location::new(Some("vars.yml".into()), Position::new(3, 8), None);
        let mut c = TemplateCompiler::new("{{ x|nope }}", Some(&location));
        let detail = c
            .compile_expression(Token::new("x|nope", 3))
            .unwrap_err()
            .details()
            .remove(0);

        assert_eq!(detail.file_path, Some("vars.yml".into()));
        assert_eq!(detail.start, Some(Position::new(3, 13)));
    }

    #[test]
    fn else_only_inside_if() {
        let mut c = compiler("");
        assert!(c.start_else_block(Span::default()).is_err());

        c.compile_if(Token::new(" x", 2), Span::new(0, 4)).unwrap();
        c.start_else_block(Span::default()).unwrap();
        assert!(c.start_else_block(Span::default()).is_err());
    }
}
