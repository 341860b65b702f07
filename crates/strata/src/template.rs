//! compiled templates
//!
//! A [Template] owns its source and the compiled [Program]. Compilation happens once in the
//! constructor, rendering can happen any number of times against different [Context]s. Every
//! error a render produces is located in the template's file (or the document the template was
//! embedded in).
use crate::ast::Span;
use crate::compiler::{Program, TemplateCompiler};
use crate::context::Context;
use crate::error::{Error, ErrorDetail, Result, UndefinedVariableError};
use crate::eval::{self, Fault, Raised};
use crate::lexer::{self, Lexeme, TagKind, Token};
use crate::position::{Location, Position};
use crate::value::Value;
use crate::variable::VariableStore;
use std::path::{Path, PathBuf};

/// Includes nested deeper than this fail instead of recursing forever
pub const MAX_INCLUDE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    location: Option<Location>,
    program: Program,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        Self::with_location(source, None)
    }

    /// A template embedded in a document at `location`
    pub fn with_location(source: impl Into<String>, location: Option<Location>) -> Result<Self> {
        let source = source.into();
        let program = compile(&source, location.as_ref())?;
        Ok(Self {
            source,
            location,
            program,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::with_location(source, Some(Location::file(path)))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn file(&self) -> Option<&Path> {
        self.program.file.as_deref()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The free references of this template, in order of first appearance
    pub fn variables(&self) -> &VariableStore {
        &self.program.variables
    }

    /// A single-expression template renders to the expression's value, anything else to a string
    pub fn render(&self, context: &Context) -> Result<Value> {
        self.render_at_depth(context, 0)
    }

    pub fn render_text(&self, context: &Context) -> Result<String> {
        Ok(self.render(context)?.to_text())
    }

    /// Render into `target`, creating missing parent directories
    pub fn render_to_file(&self, target: impl AsRef<Path>, context: &Context) -> Result<()> {
        let target = target.as_ref();
        let text = self.render_text(context)?;

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(target, text).map_err(|e| Error::io(target, e))?;

        tracing::debug!(target = %target.display(), "rendered template");
        Ok(())
    }

    pub(crate) fn render_at_depth(&self, context: &Context, depth: usize) -> Result<Value> {
        eval::execute(self, context, depth).map_err(|raised| self.locate(raised))
    }

    /// Render the template `name` next to this one, re-indenting every line after the first
    pub(crate) fn include(
        &self,
        name: &str,
        context: &Context,
        indent: usize,
        depth: usize,
    ) -> Result<String, Fault> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(Fault::runtime(
                "RecursionError",
                format!("Maximum include depth of {MAX_INCLUDE_DEPTH} exceeded while including '{name}'"),
            ));
        }

        let dir = self
            .file()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let path = dir.join(name);
        if !path.is_file() {
            return Err(Fault::runtime(
                "FileNotFoundError",
                format!("Included template '{name}' not found in '{}'", dir.display()),
            ));
        }

        tracing::debug!(path = %path.display(), depth, "include template");
        let text = Template::from_file(&path)
            .and_then(|template| template.render_at_depth(context, depth))
            .map_err(Fault::Foreign)?
            .to_text();

        Ok(match indent {
            0 => text,
            n => text.replace('\n', &format!("\n{}", " ".repeat(n))),
        })
    }

    fn locate(&self, raised: Raised) -> Error {
        let file = self.file().map(Path::to_path_buf);
        let variables = &self.program.variables;

        match raised.fault {
            Fault::Undefined(names) => {
                let mut error = UndefinedVariableError::new(names);
                for name in error.names.clone() {
                    if let Some(detail) = error.detail_mut(&name) {
                        detail.file_path = file.clone();
                        if let Some(reference) = variables.find_ref(&name) {
                            detail.start = Some(reference.start);
                            detail.end = Some(reference.end);
                        }
                    }
                }
                Error::UndefinedVariable(error)
            }
            Fault::Variable { name, mut detail } => {
                if detail.file_path.is_none() {
                    detail.file_path = file;
                }
                if let Some(reference) = variables.find_ref(&name) {
                    detail.start = Some(reference.start);
                    detail.end = Some(reference.end);
                }
                Error::Variable(detail)
            }
            Fault::Runtime { kind, message } => {
                let line = self.program.position(raised.span.start).line;
                Error::Render(
                    ErrorDetail::new(format!("({kind}) {message}"))
                        .with_file(file)
                        .with_span(Position::line(line), None),
                )
            }
            Fault::Foreign(error) => error,
        }
    }
}

fn compile(source: &str, location: Option<&Location>) -> Result<Program> {
    let mut compiler = TemplateCompiler::new(source, location);
    let lexemes = lexer::tokenize(source).map_err(|e| compiler.lex_error(e))?;
    compiler.set_value_mode(lexemes.len() <= 1);

    let mut blocks: Vec<(&str, Span)> = vec![];

    for lexeme in lexemes {
        match lexeme {
            Lexeme::Text(text) => compiler.compile_constant(text),
            Lexeme::Tag {
                kind: TagKind::Raw,
                content,
                ..
            } => compiler.compile_constant(content),
            Lexeme::Tag {
                kind: TagKind::Legacy,
                open,
                content,
                close,
            } => compiler.compile_legacy_expression(open, content, close)?,
            Lexeme::Tag {
                kind: TagKind::Expression,
                content,
                ..
            } => compiler.compile_expression(content)?,
            Lexeme::Tag {
                kind: TagKind::Block,
                open,
                content,
                ..
            } => {
                let span = Span::new(content.offset, content.end());
                let (action, args) = split_action(content);
                let has_args = !args.text.trim().is_empty();

                match action {
                    "if" => {
                        compiler.compile_if(args, span)?;
                        blocks.push(("if", span));
                    }
                    "for" => {
                        compiler.compile_for(args, span)?;
                        blocks.push(("for", span));
                    }
                    "include" => compiler.compile_include(args, open.offset, span)?,
                    "else" if has_args => {
                        return Err(compiler.syntax_error("else block does not take any argument", span))
                    }
                    "else" => compiler.start_else_block(span)?,
                    "raw" => {
                        return Err(compiler.syntax_error("raw action tag does not take any argument", span))
                    }
                    "" => return Err(compiler.syntax_error("Missing action tag", span)),
                    _ if action.starts_with("end") => {
                        let what = &action[3..];
                        if has_args {
                            return Err(compiler.syntax_error("End block does not take any argument", span));
                        }
                        match blocks.pop() {
                            None => return Err(compiler.syntax_error("Unexpected end block", span)),
                            Some((start, open_span)) if start != what => {
                                return Err(compiler.syntax_error(
                                    format!("Expecting end{start} block, got end{what}"),
                                    open_span.to(span),
                                ))
                            }
                            Some(_) => compiler.close_block()?,
                        }
                    }
                    _ => {
                        return Err(compiler.syntax_error(format!("Unknown action tag: {action}"), span))
                    }
                }
            }
        }
    }

    if let Some((start, span)) = blocks.last() {
        return Err(compiler.syntax_error(format!("Unclosed tag: {start}"), *span));
    }

    compiler.finalize()
}

/// `if x > 1` into `if` and ` x > 1`
fn split_action(content: Token<'_>) -> (&str, Token<'_>) {
    match content.text.find(char::is_whitespace) {
        Some(idx) => (
            &content.text[..idx],
            Token::new(&content.text[idx..], content.offset + idx),
        ),
        None => (content.text, Token::new("", content.end())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn render(source: &str, context: &Context) -> Value {
        Template::new(source).unwrap().render(context).unwrap()
    }

    fn compile_error(source: &str) -> String {
        Template::new(source).unwrap_err().details().remove(0).message
    }

    #[test]
    fn single_expression_keeps_its_type() {
        let context = Context::from_iter([("n", Value::Integer(5))]);
        assert_eq!(render("{{ n + 1 }}", &context), Value::Integer(6));
        assert_eq!(render("${n}", &context), Value::Integer(5));
        assert_eq!(render("n={{ n }}", &context), Value::from("n=5"));
        assert_eq!(render("", &context), Value::from(""));
    }

    #[test]
    fn blocks() {
        let context = Context::from_iter([
            ("items", Value::from(vec!["a", "b"])),
            ("flag", Value::Boolean(false)),
        ]);
        assert_eq!(
            render("{% for i in items %}[{{ i }}]{% endfor %}", &context),
            Value::from("[a][b]")
        );
        assert_eq!(
            render("{% if flag %}yes{% else %}no{% endif %}", &context),
            Value::from("no")
        );
        assert_eq!(
            render("{% raw %}{{ x }}{% endraw %}", &context),
            Value::from("{{ x }}")
        );
    }

    #[test]
    fn block_structure_errors() {
        assert_eq!(compile_error("{% endif %}"), "Unexpected end block");
        assert_eq!(compile_error("{% if x %}{% endfor %}"), "Expecting endif block, got endfor");
        assert_eq!(compile_error("{% if x %}{% endif x %}"), "End block does not take any argument");
        assert_eq!(compile_error("{% if x %}"), "Unclosed tag: if");
        assert_eq!(compile_error("{% while x %}"), "Unknown action tag: while");
        assert_eq!(compile_error("{% raw x %}"), "raw action tag does not take any argument");
        assert_eq!(compile_error("{% else %}"), "Unexpected else block");
        assert_eq!(compile_error("{{ x"), "Unclosed tag");
        assert_eq!(compile_error("{%   %}"), "Missing action tag");
    }

    #[test]
    fn blank_expressions_are_rejected() {
        assert_eq!(compile_error("a {{   }} b"), "Invalid syntax");
        assert_eq!(compile_error("{{ }}"), "Invalid syntax");
        assert_eq!(render("{{}}", &Context::new()), Value::from(""));
    }

    #[test]
    fn runtime_errors_name_the_line() {
        let template = Template::new("a\n{{ 1 // 0 }}\n").unwrap();
        let detail = template.render(&Context::new()).unwrap_err().details().remove(0);
        assert_eq!(detail.message, "(ZeroDivisionError) integer division or modulo by zero");
        assert_eq!(detail.start, Some(Position::line(2)));
    }

    #[test]
    fn undefined_variables_point_at_their_reference() {
        let template = Template::new("x {{ a.b }} {{ c }}").unwrap();
        let context = Context::from_iter([("a", Value::Object(Default::default()))]);

        let Err(Error::UndefinedVariable(error)) = template.render(&context) else {
            panic!("expected undefined variable");
        };
        assert_eq!(error.names, vec!["a.b".to_owned()]);
        assert_eq!(error.details[0].start, Some(Position::new(1, 6)));
        assert_eq!(error.details[0].end, Some(Position::new(1, 9)));
    }

    #[test]
    fn include_indents_and_binds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part.txt"), "a: {{ x }}\nb: 2").unwrap();
        std::fs::write(dir.path().join("main.txt"), "root:\n  {% include \"part.txt\" x=1 %}").unwrap();

        let template = Template::from_file(dir.path().join("main.txt")).unwrap();
        assert_eq!(
            template.render(&Context::new()).unwrap(),
            Value::from("root:\n  a: 1\n  b: 2")
        );
    }

    #[test]
    fn include_argument_forms() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part.txt"), "{{ name }}-{{ x }}\n{{ x * 2 }}").unwrap();

        let render_main = |main: &str| {
            std::fs::write(dir.path().join("main.txt"), main).unwrap();
            let template = Template::from_file(dir.path().join("main.txt")).unwrap();
            template.render(&Context::new()).unwrap()
        };

        assert_eq!(
            render_main("{% include \"part.txt\" x=1 name=\"web\" %}"),
            Value::from("web-1\n2")
        );
        assert_eq!(
            render_main("{% include \"part.txt\", x=1, name=\"web\" %}"),
            Value::from("web-1\n2")
        );
        assert_eq!(
            render_main("{% include \"part.txt\" x=2, name=\"db\" indent=4 %}"),
            Value::from("db-2\n    4")
        );
    }

    #[test]
    fn missing_include() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.txt"), "{% include \"nope.txt\" %}").unwrap();

        let template = Template::from_file(dir.path().join("main.txt")).unwrap();
        let message = template.render(&Context::new()).unwrap_err().details().remove(0).message;
        assert!(message.starts_with("(FileNotFoundError) Included template 'nope.txt' not found"));
    }

    #[test]
    fn recursive_include_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loop.txt"), "{% include \"loop.txt\" %}").unwrap();

        let template = Template::from_file(dir.path().join("loop.txt")).unwrap();
        let message = template.render(&Context::new()).unwrap_err().details().remove(0).message;
        assert!(message.starts_with("(RecursionError)"), "{message}");
    }

    #[test]
    fn render_to_file_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out/nested/file.txt");
        Template::new("hi {{ who }}")
            .unwrap()
            .render_to_file(&target, &Context::from_iter([("who", "there")]))
            .unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "hi there");
    }
}
