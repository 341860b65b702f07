//! # strata - layered configuration templating
//!
//! ## Introduction for developers
//!
//! Read this to understand how `strata` works internally.
//!
//! ### Templates
//!
//! A template is text with tags:
//!
//! ```text
//! {# a comment, dropped #}
//! plain text is copied
//! {{ name|uppercase }}                      an expression, optionally piped through filters
//! ${name}                                   the same, older syntax
//! {% if x %}..{% else %}..{% endif %}       conditionals
//! {% for item in items %}..{% endfor %}     loops
//! {% include "part.txt" indent=2 %}         another template file next to this one
//! {% raw %}{{ kept as is }}{% endraw %}
//! ```
//!
//! A template that consists of a single expression renders to that expression's [Value]
//! (`${replicas}` stays an integer). Everything else renders to a string.
//!
//! ### Compiling
//!
//! [Template::new] runs once per template:
//!
//! - [lexer::tokenize] splits the text into literal text and tags, remembering byte offsets
//! - [compiler::TemplateCompiler] parses each tag ([parser]) into an [ast] and checks names:
//!   loop variables are locals, filters are looked up in the [registry], every other name is a
//!   *free reference* into the context and gets recorded in a [variable::VariableStore]
//!   together with its position
//!
//! Templates are often embedded in a larger document (a scalar in a vars file). Positions are
//! therefore computed with the position of the template inside that document, see
//! [position::PositionIndex].
//!
//! ### Rendering
//!
//! [Template::render] walks the compiled tree ([eval]) against a [Context]. Failures are mapped
//! back to the template: undefined names point at their reference, everything else at the line
//! of the statement that failed.
//!
//! ### Contexts
//!
//! A [Context] is a stack of layers. [Context::chain] adds a layer, lookups walk from the
//! newest layer to the root. Writes are copy-on-write: when a layer overwrites a key its live
//! child layers keep seeing the old value.
//!
//! Values can be lazy ([Context::insert_lazy]), they are produced on first access and cached.
//!
//! ### Vars documents
//!
//! A vars file is a YAML mapping whose strings are templates that may reference each other.
//! [ObjectTemplate] renders such a tree in dependency order:
//!
//! ```yaml
//! url: https://${name}.example.com   # waits for name
//! name: app-${env}                   # waits for env
//! env: prod
//! ```
//!
//! Names nobody defines are reported together, dependency cycles as a path (`a -> b -> a`).
//!
//! ### Errors
//!
//! Every [Error] carries one or more [error::ErrorDetail]s that know their file and position.
//! [Error::report] renders them as a block quoting the offending lines.
pub mod ast;
pub mod compiler;
pub mod context;
pub mod document;
pub mod error;
mod eval;
mod filters;
pub mod lexer;
pub mod parser;
pub mod position;
pub mod registry;
pub mod substitution;
pub mod template;
pub mod value;
pub mod variable;

pub use context::Context;
pub use document::Document;
pub use error::{Error, Result};
pub use registry::register_filter;
pub use substitution::ObjectTemplate;
pub use template::Template;
pub use value::Value;
