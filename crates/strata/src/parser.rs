//! expression grammar
//!
//! ```text
//! pipeline    := conditional ( "|" NAME ( ":" conditional ( "," conditional )* )? )*
//! conditional := or ( "if" or "else" conditional )?
//! or          := and ( "or" and )*
//! and         := not ( "and" not )*
//! not         := "not" not | comparison
//! comparison  := sum ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "not" "in" ) sum )*
//! sum         := term ( ( "+" | "-" ) term )*
//! term        := unary ( ( "*" | "/" | "//" | "%" ) unary )*
//! unary       := ( "-" | "+" ) unary | postfix
//! postfix     := primary ( "." NAME | "[" index "]" | "(" arguments ")" )*
//! primary     := INT | FLOAT | STRING | NAME | "(" pipeline ")" | "[" list "]"
//! ```
//!
//! Spans are byte offsets into the template, `base` is where the parsed source starts.
//! Nesting through parentheses, lists, `not` and unary signs is limited to [MAX_DEPTH] levels.
use crate::ast::{BinaryOp, Expr, ExprKind, Span, UnaryOp};
use crate::value::Value;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }

    fn invalid(span: Span) -> Self {
        Self::new("Invalid syntax", span)
    }
}

type ParseResult<T> = Result<T, ParseError>;

pub const MAX_DEPTH: usize = 32;

/// Arguments of an `{% include %}` tag
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    pub positional: Vec<Expr>,
    pub keywords: Vec<(String, Span, Expr)>,
}

/// An expression, filters included
pub fn parse_expression(source: &str, base: usize) -> ParseResult<Expr> {
    let mut parser = Parser::new(source, base)?;
    let expr = parser.pipeline()?;
    parser.finish()?;
    Ok(expr)
}

/// An expression without filters
pub fn parse_value(source: &str, base: usize) -> ParseResult<Expr> {
    let mut parser = Parser::new(source, base)?;
    let expr = parser.conditional()?;
    parser.finish()?;
    Ok(expr)
}

/// Positional arguments followed by `name=value` arguments, commas between them are optional
///
/// `"part.txt" indent=4 name="web"` and `"part.txt", indent=4, name="web"` are the same.
pub fn parse_arguments(source: &str, base: usize) -> ParseResult<Arguments> {
    let mut parser = Parser::new(source, base)?;
    let mut arguments = Arguments::default();

    while !parser.at_end() {
        let keyword = match (parser.peek(), parser.peek_at(1)) {
            (Tok::Ident(name), Tok::Op("=")) => Some((name.clone(), parser.span())),
            _ => None,
        };

        match keyword {
            Some((name, span)) => {
                parser.advance();
                parser.advance();
                let value = parser.conditional()?;
                arguments.keywords.push((name, span, value));
            }
            None => {
                let value = parser.conditional()?;
                if !arguments.keywords.is_empty() {
                    return Err(ParseError::new(
                        "Positional argument follows keyword argument",
                        value.span,
                    ));
                }
                arguments.positional.push(value);
            }
        }

        parser.eat_op(",");
    }

    parser.finish()?;
    Ok(arguments)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    End,
}

const OPS: [&str; 21] = [
    "//", "==", "!=", "<=", ">=", "(", ")", "[", "]", ",", ".", ":", "|", "=", "<", ">", "+", "-",
    "*", "/", "%",
];

const KEYWORDS: [&str; 6] = ["and", "or", "not", "in", "if", "else"];

fn scan(source: &str, base: usize) -> ParseResult<Vec<(Tok, Span)>> {
    let bytes = source.as_bytes();
    let mut toks = vec![];
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let tok = if c.is_ascii_digit() {
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let is_float =
                i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }

            let text = &source[start..i];
            let span = Span::new(base + start, base + i);
            if is_float {
                Tok::Float(text.parse().map_err(|_| ParseError::invalid(span))?)
            } else {
                Tok::Int(
                    text.parse()
                        .map_err(|_| ParseError::new("Integer literal is too large", span))?,
                )
            }
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            Tok::Ident(source[start..i].to_owned())
        } else if c == b'"' || c == b'\'' {
            let (text, end) = scan_string(source, start, base)?;
            i = end;
            Tok::Str(text)
        } else {
            let op: &'static str = *OPS
                .iter()
                .find(|op| source[start..].starts_with(**op))
                .ok_or_else(|| {
                    let width = source[start..].chars().next().map_or(1, char::len_utf8);
                    ParseError::invalid(Span::new(base + start, base + start + width))
                })?;
            i += op.len();
            Tok::Op(op)
        };

        toks.push((tok, Span::new(base + start, base + i)));
    }

    toks.push((Tok::End, Span::new(base + source.len(), base + source.len())));
    Ok(toks)
}

fn scan_string(source: &str, start: usize, base: usize) -> ParseResult<(String, usize)> {
    let mut chars = source[start..].char_indices();
    let quote = chars.next().map(|(_, c)| c).unwrap_or('"');
    let mut text = String::new();

    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, 'r')) => text.push('\r'),
                Some((_, '\\')) => text.push('\\'),
                Some((_, '"')) => text.push('"'),
                Some((_, '\'')) => text.push('\''),
                Some((_, other)) => {
                    text.push('\\');
                    text.push(other);
                }
                None => break,
            },
            c if c == quote => return Ok((text, start + idx + c.len_utf8())),
            c => text.push(c),
        }
    }

    Err(ParseError::new(
        "Unterminated string",
        Span::new(base + start, base + source.len()),
    ))
}

struct Parser {
    toks: Vec<(Tok, Span)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(source: &str, base: usize) -> ParseResult<Self> {
        Ok(Self {
            toks: scan(source, base)?,
            pos: 0,
            depth: 0,
        })
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(ParseError::new(
                "Expression is nested too deeply",
                self.span(),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        let idx = (self.pos + ahead).min(self.toks.len() - 1);
        &self.toks[idx].0
    }

    fn span(&self) -> Span {
        self.toks[self.pos.min(self.toks.len() - 1)].1
    }

    fn previous_span(&self) -> Span {
        self.toks[self.pos.saturating_sub(1)].1
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Tok::End)
    }

    fn advance(&mut self) -> (Tok, Span) {
        let tok = self.toks[self.pos.min(self.toks.len() - 1)].clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Ident(name) if name == keyword)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let found = self.is_op(op);
        if found {
            self.advance();
        }
        found
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.is_keyword(keyword);
        if found {
            self.advance();
        }
        found
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<Span> {
        if self.is_op(op) {
            Ok(self.advance().1)
        } else {
            Err(ParseError::invalid(self.span()))
        }
    }

    fn expect_name(&mut self) -> ParseResult<(String, Span)> {
        match self.advance() {
            (Tok::Ident(name), span) if !KEYWORDS.contains(&name.as_str()) => Ok((name, span)),
            (_, span) => Err(ParseError::invalid(span)),
        }
    }

    fn finish(&self) -> ParseResult<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(ParseError::invalid(self.span()))
        }
    }

    fn pipeline(&mut self) -> ParseResult<Expr> {
        let mut expr = self.conditional()?;

        while self.eat_op("|") {
            let (name, name_span) = self.expect_name()?;
            let mut args = vec![];

            if self.eat_op(":") {
                loop {
                    args.push(self.conditional()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
            }

            let span = name_span.to(self.previous_span());
            if self.is_op(":") {
                return Err(ParseError::new("Invalid Syntax", span.to(self.span())));
            }

            expr = Expr::new(
                ExprKind::Filter {
                    name,
                    input: Box::new(expr),
                    args,
                },
                span,
            );
        }

        Ok(expr)
    }

    fn conditional(&mut self) -> ParseResult<Expr> {
        self.nested(Self::ternary)
    }

    fn ternary(&mut self) -> ParseResult<Expr> {
        let then = self.or()?;
        if !self.eat_keyword("if") {
            return Ok(then);
        }

        let cond = self.or()?;
        if !self.eat_keyword("else") {
            return Err(ParseError::invalid(self.span()));
        }
        let otherwise = self.conditional()?;

        let span = then.span.to(otherwise.span);
        Ok(Expr::new(
            ExprKind::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    fn or(&mut self) -> ParseResult<Expr> {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> ParseResult<Expr> {
        let mut left = self.not()?;
        while self.eat_keyword("and") {
            let right = self.not()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn not(&mut self) -> ParseResult<Expr> {
        if self.is_keyword("not") {
            let start = self.advance().1;
            let operand = self.nested(Self::not)?;
            let span = start.to(operand.span);
            return Ok(Expr::new(
                ExprKind::Unary(UnaryOp::Not, Box::new(operand)),
                span,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut left = self.sum()?;

        loop {
            let op = match self.peek() {
                Tok::Op("==") => BinaryOp::Eq,
                Tok::Op("!=") => BinaryOp::Ne,
                Tok::Op("<") => BinaryOp::Lt,
                Tok::Op("<=") => BinaryOp::Le,
                Tok::Op(">") => BinaryOp::Gt,
                Tok::Op(">=") => BinaryOp::Ge,
                Tok::Ident(name) if name == "in" => BinaryOp::In,
                Tok::Ident(name)
                    if name == "not" && matches!(self.peek_at(1), Tok::Ident(n) if n == "in") =>
                {
                    self.advance();
                    BinaryOp::NotIn
                }
                _ => break,
            };
            self.advance();

            let right = self.sum()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn sum(&mut self) -> ParseResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinaryOp::Add,
                Tok::Op("-") => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinaryOp::Mul,
                Tok::Op("/") => BinaryOp::Div,
                Tok::Op("//") => BinaryOp::FloorDiv,
                Tok::Op("%") => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            _ => return self.postfix(),
        };

        let start = self.advance().1;
        let operand = self.nested(Self::unary)?;
        let span = start.to(operand.span);
        Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), span))
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.eat_op(".") {
                let (name, name_span) = self.expect_name()?;
                let span = expr.span.to(name_span);
                expr = Expr::new(ExprKind::Attr(Box::new(expr), name), span);
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.is_op("(") {
                let name = match &expr.kind {
                    ExprKind::Name(name) => name.clone(),
                    _ => return Err(ParseError::invalid(self.span())),
                };
                self.advance();

                let mut args = vec![];
                while !self.is_op(")") {
                    args.push(self.conditional()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                let end = self.expect_op(")")?;
                expr = Expr::new(ExprKind::Call { name, args }, expr.span.to(end));
            } else {
                return Ok(expr);
            }
        }
    }

    fn subscript(&mut self, target: Expr) -> ParseResult<Expr> {
        let lower = if self.is_op(":") {
            None
        } else {
            Some(Box::new(self.conditional()?))
        };

        if !self.eat_op(":") {
            let end = self.expect_op("]")?;
            let index = lower.ok_or_else(|| ParseError::invalid(end))?;
            let span = target.span.to(end);
            return Ok(Expr::new(ExprKind::Index(Box::new(target), index), span));
        }

        let upper = if self.is_op("]") {
            None
        } else {
            Some(Box::new(self.conditional()?))
        };
        let end = self.expect_op("]")?;
        let span = target.span.to(end);

        Ok(Expr::new(
            ExprKind::Slice {
                target: Box::new(target),
                lower,
                upper,
            },
            span,
        ))
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let (tok, span) = self.advance();

        let kind = match tok {
            Tok::Int(i) => ExprKind::Literal(Value::Integer(i)),
            Tok::Float(f) => ExprKind::Literal(Value::Decimal(f)),
            Tok::Str(s) => ExprKind::Literal(Value::String(s)),
            Tok::Ident(name) => match name.as_str() {
                "True" | "true" => ExprKind::Literal(Value::Boolean(true)),
                "False" | "false" => ExprKind::Literal(Value::Boolean(false)),
                "None" | "null" => ExprKind::Literal(Value::Null),
                keyword if KEYWORDS.contains(&keyword) => {
                    return Err(ParseError::invalid(span))
                }
                _ => ExprKind::Name(name),
            },
            Tok::Op("(") => {
                let inner = self.pipeline()?;
                let end = self.expect_op(")")?;
                return Ok(Expr::new(inner.kind, span.to(end)));
            }
            Tok::Op("[") => {
                let mut items = vec![];
                while !self.is_op("]") {
                    items.push(self.conditional()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                let end = self.expect_op("]")?;
                return Ok(Expr::new(ExprKind::List(items), span.to(end)));
            }
            _ => return Err(ParseError::invalid(span)),
        };

        Ok(Expr::new(kind, span))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.to(right.span);
    Expr::new(ExprKind::Binary(op, Box::new(left), Box::new(right)), span)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn name(name: &str, start: usize) -> Expr {
        Expr::new(
            ExprKind::Name(name.to_owned()),
            Span::new(start, start + name.len()),
        )
    }

    #[test]
    fn spans_are_offset_by_base() {
        let expr = parse_expression("a.b", 10).unwrap();
        assert_eq!(
            expr,
            Expr::new(
                ExprKind::Attr(Box::new(name("a", 10)), "b".to_owned()),
                Span::new(10, 13)
            )
        );
    }

    #[test]
    fn precedence() {
        let expr = parse_value("1 + 2 * 3 == 7 and not x", 0).unwrap();
        let ExprKind::Binary(BinaryOp::And, left, right) = expr.kind else {
            panic!("expected and, got {expr:?}");
        };
        assert!(matches!(left.kind, ExprKind::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(right.kind, ExprKind::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn not_in() {
        let expr = parse_value("a not in b", 0).unwrap();
        assert_eq!(
            expr,
            Expr::new(
                ExprKind::Binary(BinaryOp::NotIn, Box::new(name("a", 0)), Box::new(name("b", 9))),
                Span::new(0, 10)
            )
        );
    }

    #[test]
    fn filters_chain_left_to_right() {
        let expr = parse_expression("\"AbC\"|lowercase|date:\"%Y\", 2", 0).unwrap();
        let ExprKind::Filter { name, input, args } = expr.kind else {
            panic!("expected filter");
        };
        assert_eq!(name, "date");
        assert_eq!(expr.span, Span::new(16, 28));
        assert_eq!(args.len(), 2);
        assert!(matches!(input.kind, ExprKind::Filter { ref name, .. } if name == "lowercase"));
    }

    #[test]
    fn second_argument_list_is_rejected() {
        let error = parse_expression("x|date:1:2", 0).unwrap_err();
        assert_eq!(error.message, "Invalid Syntax");
        assert_eq!(error.span, Span::new(2, 9));
    }

    #[test]
    fn subscripts_and_slices() {
        assert!(matches!(
            parse_value("a[0]", 0).unwrap().kind,
            ExprKind::Index(..)
        ));
        assert!(matches!(
            parse_value("a[1:]", 0).unwrap().kind,
            ExprKind::Slice { lower: Some(_), upper: None, .. }
        ));
        assert!(matches!(
            parse_value("a[:-1]", 0).unwrap().kind,
            ExprKind::Slice { lower: None, upper: Some(_), .. }
        ));
    }

    #[test]
    fn literals() {
        let literal = |source| match parse_value(source, 0).unwrap().kind {
            ExprKind::Literal(value) => value,
            other => panic!("expected literal, got {other:?}"),
        };

        assert_eq!(literal("5"), Value::Integer(5));
        assert_eq!(literal("2.5"), Value::Decimal(2.5));
        assert_eq!(literal("'it\\'s'"), Value::from("it's"));
        assert_eq!(literal("\"a\\nb\""), Value::from("a\nb"));
        assert_eq!(literal("None"), Value::Null);
        assert_eq!(literal("true"), Value::Boolean(true));
    }

    #[test]
    fn syntax_errors_point_at_the_token() {
        assert_eq!(parse_value("a +", 4).unwrap_err().span, Span::new(7, 7));
        assert_eq!(parse_value("a b", 0).unwrap_err().span, Span::new(2, 3));
        assert_eq!(parse_value("a.if", 0).unwrap_err().span, Span::new(2, 4));
        assert_eq!(
            parse_value("'abc", 0).unwrap_err().message,
            "Unterminated string"
        );
        assert_eq!(parse_value("x.y()", 0).unwrap_err().span, Span::new(3, 4));
    }

    #[test]
    fn include_arguments() {
        let arguments = parse_arguments("\"x.txt\", indent=2, name=a", 0).unwrap();
        assert_eq!(arguments.positional.len(), 1);
        let names: Vec<_> = arguments.keywords.iter().map(|(name, _, _)| name.as_str()).collect();
        assert_eq!(names, vec!["indent", "name"]);

        assert_eq!(
            parse_arguments("indent=2, \"x\"", 0).unwrap_err().message,
            "Positional argument follows keyword argument"
        );
    }

    #[test]
    fn include_arguments_without_commas() {
        let keywords = |source| {
            let arguments = parse_arguments(source, 0).unwrap();
            assert_eq!(arguments.positional.len(), 1);
            arguments
                .keywords
                .into_iter()
                .map(|(name, _, _)| name)
                .collect::<Vec<_>>()
        };

        assert_eq!(keywords("\"x.txt\" x=1 name=\"web\""), vec!["x", "name"]);
        assert_eq!(keywords("\"x.txt\" indent=2, name=a.b"), vec!["indent", "name"]);
        assert_eq!(keywords("\"x.txt\", x=1 + 2 y=[1, 2]"), vec!["x", "y"]);
        assert_eq!(keywords("\"x.txt\""), Vec::<String>::new());
        assert!(parse_arguments("\"x.txt\" x=1,, y=2", 0).is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let parens = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse_value(&parens(MAX_DEPTH - 2), 0).is_ok());

        let error = parse_value(&parens(10_000), 0).unwrap_err();
        assert_eq!(error.message, "Expression is nested too deeply");

        let nots = format!("{}x", "not ".repeat(10_000));
        assert_eq!(
            parse_value(&nots, 0).unwrap_err().message,
            "Expression is nested too deeply"
        );
        let signs = format!("{}1", "-".repeat(10_000));
        assert_eq!(
            parse_expression(&signs, 0).unwrap_err().message,
            "Expression is nested too deeply"
        );
        assert!(parse_value(&format!("{}1", "-".repeat(8)), 0).is_ok());
    }
}
