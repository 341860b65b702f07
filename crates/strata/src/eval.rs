//! tree-walking interpreter for compiled templates
//!
//! Failures are reported as a [Fault] tagged with the span of the statement that was executing.
//! [crate::template::Template] turns them into located [crate::Error]s.
use crate::ast::{BinaryOp, Expr, ExprKind, Span, Stmt, StmtKind, UnaryOp};
use crate::context::Context;
use crate::error::{Error, ErrorDetail};
use crate::registry::{self, FilterError};
use crate::template::Template;
use crate::value::Value;
use std::cmp::Ordering;

#[derive(Debug)]
pub(crate) enum Fault {
    /// Names (dotted paths for missing keys) that could not be resolved
    Undefined(Vec<String>),
    /// A context value exists but could not be produced
    Variable { name: String, detail: ErrorDetail },
    /// Anything else, `kind` categorizes the failure in the message
    Runtime { kind: &'static str, message: String },
    /// Already reported error from an included template or a collaborator
    Foreign(Error),
}

impl Fault {
    pub(crate) fn runtime(kind: &'static str, message: impl Into<String>) -> Self {
        Fault::Runtime {
            kind,
            message: message.into(),
        }
    }

    fn type_error(message: impl Into<String>) -> Self {
        Self::runtime("TypeError", message)
    }
}

impl From<FilterError> for Fault {
    fn from(error: FilterError) -> Self {
        Fault::Runtime {
            kind: error.kind,
            message: error.message,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Raised {
    pub fault: Fault,
    /// Span of the innermost statement being executed
    pub span: Span,
}

type Eval<T> = Result<T, Fault>;

pub(crate) fn execute(template: &Template, context: &Context, depth: usize) -> Result<Value, Raised> {
    let mut frame = Frame {
        template,
        context,
        locals: vec![],
        depth,
    };

    let mut output = String::new();
    match frame.run(&template.program().body, &mut output)? {
        Some(value) => Ok(value),
        None => Ok(Value::String(output)),
    }
}

struct Frame<'t> {
    template: &'t Template,
    context: &'t Context,
    locals: Vec<(String, Value)>,
    depth: usize,
}

impl<'t> Frame<'t> {
    /// Runs statements, `Some` is the value of a value-mode template
    fn run(&mut self, body: &[Stmt], output: &mut String) -> Result<Option<Value>, Raised> {
        for stmt in body {
            let raised = |fault| Raised {
                fault,
                span: stmt.span,
            };

            match &stmt.kind {
                StmtKind::Append(expr) => {
                    let value = self.eval(expr).map_err(raised)?;
                    output.push_str(&value.to_text());
                }
                StmtKind::Return(expr) => {
                    return Ok(Some(self.eval(expr).map_err(raised)?));
                }
                StmtKind::If { cond, body, orelse } => {
                    let branch = match self.eval(cond).map_err(raised)?.is_truthy() {
                        true => body,
                        false => orelse,
                    };
                    if let Some(value) = self.run(branch, output)? {
                        return Ok(Some(value));
                    }
                }
                StmtKind::For { var, iter, body } => {
                    let items = iterate(self.eval(iter).map_err(raised)?).map_err(raised)?;
                    for item in items {
                        self.locals.push((var.clone(), item));
                        let result = self.run(body, output);
                        self.locals.pop();

                        if let Some(value) = result? {
                            return Ok(Some(value));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    fn lookup(&self, name: &str) -> Eval<Value> {
        match self.context.get(name) {
            Ok(value) => Ok(value),
            Err(Error::UndefinedVariable(error)) => Err(Fault::Undefined(error.names)),
            Err(Error::Variable(detail)) => Err(Fault::Variable {
                name: name.to_owned(),
                detail,
            }),
            Err(error) => Err(Fault::Foreign(error)),
        }
    }

    fn eval(&self, expr: &Expr) -> Eval<Value> {
        match &expr.kind {
            ExprKind::Literal(value) => Ok(value.clone()),
            ExprKind::List(items) => Ok(Value::Array(self.eval_all(items)?)),
            ExprKind::Name(name) | ExprKind::Context(name) => self.lookup(name),
            ExprKind::Local(name) => self
                .locals
                .iter()
                .rev()
                .find(|(local, _)| local == name)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Fault::Undefined(vec![name.clone()])),
            ExprKind::Attr(target, attr) => match self.eval(target)? {
                Value::Object(mut object) => object
                    .swap_remove(attr)
                    .ok_or_else(|| Fault::Undefined(vec![child_path(target, attr)])),
                other => Err(Fault::runtime(
                    "AttributeError",
                    format!("'{}' object has no attribute '{attr}'", other.type_name()),
                )),
            },
            ExprKind::Index(target, index) => {
                let container = self.eval(target)?;
                let key = self.eval(index)?;
                subscript(target, container, key)
            }
            ExprKind::Slice {
                target,
                lower,
                upper,
            } => {
                let container = self.eval(target)?;
                let lower = self.slice_bound(lower.as_deref())?;
                let upper = self.slice_bound(upper.as_deref())?;
                slice(container, lower, upper)
            }
            ExprKind::Unary(op, operand) => unary(*op, self.eval(operand)?),
            ExprKind::Binary(BinaryOp::And, left, right) => {
                let left = self.eval(left)?;
                match left.is_truthy() {
                    true => self.eval(right),
                    false => Ok(left),
                }
            }
            ExprKind::Binary(BinaryOp::Or, left, right) => {
                let left = self.eval(left)?;
                match left.is_truthy() {
                    true => Ok(left),
                    false => self.eval(right),
                }
            }
            ExprKind::Binary(op, left, right) => {
                let left = self.eval(left)?;
                binary(*op, left, self.eval(right)?)
            }
            ExprKind::Conditional {
                cond,
                then,
                otherwise,
            } => match self.eval(cond)?.is_truthy() {
                true => self.eval(then),
                false => self.eval(otherwise),
            },
            ExprKind::Call { name, args } => {
                Ok(registry::call_builtin(name, &self.eval_all(args)?)?)
            }
            ExprKind::Filter { name, input, args } => {
                let input = self.eval(input)?;
                let args = self.eval_all(args)?;
                let filter = self
                    .template
                    .program()
                    .variables
                    .global(name)
                    .ok_or_else(|| Fault::runtime("NameError", format!("Unknown filter: {name}")))?;
                Ok(filter.apply(&input, &args)?)
            }
            ExprKind::Include {
                target,
                args,
                indent,
            } => self.include(target, args, indent),
        }
    }

    fn eval_all(&self, exprs: &[Expr]) -> Eval<Vec<Value>> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn slice_bound(&self, bound: Option<&Expr>) -> Eval<Option<i64>> {
        match bound.map(|expr| self.eval(expr)).transpose()? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(i)) => Ok(Some(i)),
            Some(other) => Err(Fault::type_error(format!(
                "slice indices must be integers or None, not {}",
                other.type_name()
            ))),
        }
    }

    fn include(&self, target: &Expr, args: &[(String, Expr)], indent: &Expr) -> Eval<Value> {
        let name = match self.eval(target)? {
            Value::String(name) => name,
            other => {
                return Err(Fault::type_error(format!(
                    "include expects a template name, got {}",
                    other.type_name()
                )))
            }
        };
        let indent = match self.eval(indent)? {
            Value::Integer(indent) if indent >= 0 => indent as usize,
            other => {
                return Err(Fault::type_error(format!(
                    "indent must be a non-negative int, got {}",
                    other.to_text()
                )))
            }
        };

        let rendered = if args.is_empty() {
            self.template
                .include(&name, self.context, indent, self.depth + 1)?
        } else {
            let context = self.context.chain();
            for (key, value) in args {
                context.insert(key.as_str(), self.eval(value)?);
            }
            self.template
                .include(&name, &context, indent, self.depth + 1)?
        };

        Ok(Value::String(rendered))
    }
}

/// `a.b` for a missing `b` on `a`, falling back to the bare key for dynamic targets
fn child_path(target: &Expr, key: &str) -> String {
    match static_path(target) {
        Some(path) => format!("{path}.{key}"),
        None => key.to_owned(),
    }
}

fn static_path(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Context(name) | ExprKind::Local(name) => Some(name.clone()),
        ExprKind::Attr(target, attr) => Some(format!("{}.{attr}", static_path(target)?)),
        ExprKind::Index(target, index) => match &index.kind {
            ExprKind::Literal(Value::String(key)) => Some(format!("{}.{key}", static_path(target)?)),
            ExprKind::Literal(Value::Integer(idx)) => {
                Some(format!("{}.{idx}", static_path(target)?))
            }
            _ => None,
        },
        _ => None,
    }
}

fn iterate(value: Value) -> Eval<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(object) => Ok(object.into_keys().map(Value::String).collect()),
        Value::String(text) => Ok(text.chars().map(|c| Value::String(c.to_string())).collect()),
        other => Err(Fault::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Python-style index: negative counts from the end
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 { index + len as i64 } else { index };
    (0..len as i64).contains(&index).then_some(index as usize)
}

fn subscript(target: &Expr, container: Value, key: Value) -> Eval<Value> {
    match (container, key) {
        (Value::Array(mut items), Value::Integer(index)) => normalize_index(index, items.len())
            .map(|index| items.swap_remove(index))
            .ok_or_else(|| Fault::runtime("IndexError", "list index out of range")),
        (Value::String(text), Value::Integer(index)) => {
            let chars: Vec<char> = text.chars().collect();
            normalize_index(index, chars.len())
                .map(|index| Value::String(chars[index].to_string()))
                .ok_or_else(|| Fault::runtime("IndexError", "string index out of range"))
        }
        (Value::Object(mut object), key) => {
            let key = key.to_text();
            object
                .swap_remove(&key)
                .ok_or_else(|| Fault::Undefined(vec![child_path(target, &key)]))
        }
        (Value::Array(_), key) => Err(Fault::type_error(format!(
            "list indices must be integers, not {}",
            key.type_name()
        ))),
        (other, _) => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn slice(container: Value, lower: Option<i64>, upper: Option<i64>) -> Eval<Value> {
    let bounds = |len: usize| {
        let clamp = |bound: i64| {
            let bound = if bound < 0 { bound + len as i64 } else { bound };
            bound.clamp(0, len as i64) as usize
        };
        let start = lower.map_or(0, clamp);
        let end = upper.map_or(len, clamp);
        (start, end.max(start))
    };

    match container {
        Value::Array(items) => {
            let (start, end) = bounds(items.len());
            Ok(Value::Array(items[start..end].to_vec()))
        }
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            let (start, end) = bounds(chars.len());
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: Value) -> Eval<Value> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Boolean(!value.is_truthy())),
        (UnaryOp::Neg, Value::Integer(i)) => i
            .checked_neg()
            .map(Value::Integer)
            .ok_or_else(|| Fault::runtime("OverflowError", "integer overflow")),
        (UnaryOp::Neg, Value::Decimal(d)) => Ok(Value::Decimal(-d)),
        (UnaryOp::Pos, value @ (Value::Integer(_) | Value::Decimal(_))) => Ok(value),
        (op, value) => Err(Fault::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            value.type_name()
        ))),
    }
}

/// Upper bound for the length of a repeated string (bytes) or list (items)
const MAX_REPEAT_LEN: usize = 1 << 24;

/// Number of copies for `sequence * n`, a negative `n` gives none
fn repeat_count(len: usize, n: i64) -> Eval<usize> {
    let count = usize::try_from(n.max(0))
        .map_err(|_| Fault::runtime("OverflowError", "repeat count too large"))?;
    match len.checked_mul(count) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(count),
        _ => Err(Fault::runtime(
            "MemoryError",
            format!("repeated sequence would exceed {MAX_REPEAT_LEN} elements"),
        )),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Eval<Value> {
    use Value::{Array, Decimal, Integer};

    let unsupported = |left: &Value, right: &Value| {
        Fault::type_error(format!(
            "unsupported operand type(s) for {op}: '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))
    };
    let overflow = || Fault::runtime("OverflowError", "integer overflow");

    match op {
        BinaryOp::Eq => Ok(Value::Boolean(left == right)),
        BinaryOp::Ne => Ok(Value::Boolean(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = left.partial_cmp(&right).ok_or_else(|| {
                Fault::type_error(format!(
                    "'{op}' not supported between instances of '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ))
            })?;
            Ok(Value::Boolean(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => contains(&right, &left).map(Value::Boolean),
        BinaryOp::NotIn => contains(&right, &left).map(|found| Value::Boolean(!found)),
        BinaryOp::Add => match (left, right) {
            (Integer(a), Integer(b)) => a.checked_add(b).map(Integer).ok_or_else(overflow),
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Array(mut a), Array(b)) => {
                a.extend(b);
                Ok(Array(a))
            }
            (left, right) => float_op(&left, &right, |a, b| a + b).ok_or_else(|| unsupported(&left, &right)),
        },
        BinaryOp::Sub => match (left, right) {
            (Integer(a), Integer(b)) => a.checked_sub(b).map(Integer).ok_or_else(overflow),
            (left, right) => float_op(&left, &right, |a, b| a - b).ok_or_else(|| unsupported(&left, &right)),
        },
        BinaryOp::Mul => match (left, right) {
            (Integer(a), Integer(b)) => a.checked_mul(b).map(Integer).ok_or_else(overflow),
            (Value::String(s), Integer(n)) | (Integer(n), Value::String(s)) => {
                let count = repeat_count(s.len(), n)?;
                Ok(Value::String(s.repeat(count)))
            }
            (Array(items), Integer(n)) | (Integer(n), Array(items)) => {
                let len = items.len() * repeat_count(items.len(), n)?;
                Ok(Array(items.into_iter().cycle().take(len).collect()))
            }
            (left, right) => float_op(&left, &right, |a, b| a * b).ok_or_else(|| unsupported(&left, &right)),
        },
        BinaryOp::Div => {
            let (a, b) = floats(&left, &right).ok_or_else(|| unsupported(&left, &right))?;
            if b == 0.0 {
                return Err(Fault::runtime("ZeroDivisionError", "division by zero"));
            }
            Ok(Decimal(a / b))
        }
        BinaryOp::FloorDiv | BinaryOp::Mod => {
            let floor = op == BinaryOp::FloorDiv;
            match (left, right) {
                (Integer(_), Integer(0)) => Err(Fault::runtime(
                    "ZeroDivisionError",
                    "integer division or modulo by zero",
                )),
                // i64::MIN % -1 has no overflow in Python terms
                (Integer(_), Integer(-1)) if !floor => Ok(Integer(0)),
                (Integer(a), Integer(b)) => {
                    let q = a.checked_div(b).ok_or_else(overflow)?;
                    let r = a - q * b;
                    let adjust = r != 0 && ((r < 0) != (b < 0));
                    Ok(Integer(match (floor, adjust) {
                        (true, true) => q - 1,
                        (true, false) => q,
                        (false, true) => r + b,
                        (false, false) => r,
                    }))
                }
                (left, right) => {
                    let (a, b) = floats(&left, &right).ok_or_else(|| unsupported(&left, &right))?;
                    if b == 0.0 {
                        return Err(Fault::runtime("ZeroDivisionError", "float division by zero"));
                    }
                    let q = (a / b).floor();
                    Ok(Decimal(if floor { q } else { a - q * b }))
                }
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuited by the caller"),
    }
}

fn floats(left: &Value, right: &Value) -> Option<(f64, f64)> {
    Some((left.as_f64()?, right.as_f64()?))
}

fn float_op(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> Option<Value> {
    floats(left, right).map(|(a, b)| Value::Decimal(op(a, b)))
}

fn contains(container: &Value, needle: &Value) -> Eval<bool> {
    match (container, needle) {
        (Value::Array(items), needle) => Ok(items.contains(needle)),
        (Value::String(text), Value::String(needle)) => Ok(text.contains(needle.as_str())),
        (Value::String(_), other) => Err(Fault::type_error(format!(
            "'in <string>' requires string as left operand, not {}",
            other.type_name()
        ))),
        (Value::Object(object), Value::String(key)) => Ok(object.contains_key(key)),
        (Value::Object(_), _) => Ok(false),
        (other, _) => Err(Fault::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}
