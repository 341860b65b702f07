//! render every string inside a nested value
//!
//! Strings in a vars document are templates that may reference each other:
//!
//! ```yaml
//! name: app-${env}
//! env: prod
//! url: https://${name}.example.com
//! ```
//!
//! [ObjectTemplate] renders such a tree in dependency order. Every string leaf becomes a unit
//! bound to its ref path, every container that holds one becomes a unit that completes once
//! all of its children are rendered. Units are then resolved in passes until none is left.
//! When the root is a mapping, finished units are published into a working context layer right
//! away, so later units see rendered siblings instead of their source text.
//!
//! A pass without progress means a deadlock: names nobody defines are reported as undefined,
//! otherwise the first dependency cycle is reported as `a -> b -> a`.
use crate::context::Context;
use crate::document::Document;
use crate::error::{CircularDependencyError, Error, ErrorDetail, Result, UndefinedVariableError};
use crate::position::{Location, Locations};
use crate::template::Template;
use crate::value::{Object, Value};
use crate::variable::{join_ref, REF_SEP};
use indexmap::{IndexMap, IndexSet};
use std::path::Path;

/// Renders nested values against a [Context]
#[derive(Debug, Clone)]
pub struct ObjectTemplate {
    context: Context,
}

impl ObjectTemplate {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
        }
    }

    pub fn render(&self, value: &Value) -> Result<Value> {
        self.render_with(value, &Locations::new(), None)
    }

    /// Like [Self::render], errors point into the document's file
    pub fn render_document(&self, document: &Document) -> Result<Value> {
        self.render_with(&document.value, &document.locations, document.file.as_deref())
    }

    fn render_with(&self, value: &Value, locations: &Locations, file: Option<&Path>) -> Result<Value> {
        let location = |reference: &str| {
            locations
                .get(reference)
                .cloned()
                .or_else(|| file.map(Location::file))
        };

        match value {
            Value::String(text) => Template::with_location(text.as_str(), location(""))?.render(&self.context),
            Value::Array(_) | Value::Object(_) => {
                let mut walk = Walk {
                    units: vec![],
                    location: &location,
                };
                let root = walk.slot(value, "", vec![])?;
                Resolver::new(&self.context, root, walk.units, locations).run()
            }
            other => Ok(other.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A node of the tree being rendered
#[derive(Debug)]
enum Slot {
    Pending,
    Ready(Value),
    Sequence(Vec<Slot>),
    Mapping(IndexMap<String, Slot>),
}

impl Slot {
    fn is_ready(&self) -> bool {
        matches!(self, Slot::Ready(_))
    }

    /// Current value, pending leaves show up as null
    fn snapshot(&self) -> Value {
        match self {
            Slot::Pending => Value::Null,
            Slot::Ready(value) => value.clone(),
            Slot::Sequence(items) => Value::Array(items.iter().map(Slot::snapshot).collect()),
            Slot::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, slot)| (key.clone(), slot.snapshot()))
                    .collect(),
            ),
        }
    }

    fn children(&self) -> Box<dyn Iterator<Item = &Slot> + '_> {
        match self {
            Slot::Sequence(items) => Box::new(items.iter()),
            Slot::Mapping(entries) => Box::new(entries.values()),
            _ => Box::new(std::iter::empty()),
        }
    }

    fn get_mut(&mut self, path: &[Segment]) -> Option<&mut Slot> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        let child = match (self, first) {
            (Slot::Sequence(items), Segment::Index(idx)) => items.get_mut(*idx)?,
            (Slot::Mapping(entries), Segment::Key(key)) => entries.get_mut(key)?,
            _ => return None,
        };
        child.get_mut(rest)
    }

    fn get(&self, path: &[Segment]) -> Option<&Slot> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        let child = match (self, first) {
            (Slot::Sequence(items), Segment::Index(idx)) => items.get(*idx)?,
            (Slot::Mapping(entries), Segment::Key(key)) => entries.get(key)?,
            _ => return None,
        };
        child.get(rest)
    }
}

#[derive(Debug)]
enum UnitKind {
    Leaf { template: Template },
    Container { children: Vec<String> },
}

#[derive(Debug)]
struct Unit {
    reference: String,
    path: Vec<Segment>,
    kind: UnitKind,
}

impl Unit {
    fn top(&self) -> &str {
        top(&self.reference)
    }

    fn is_leaf(&self) -> bool {
        matches!(self.kind, UnitKind::Leaf { .. })
    }
}

fn top(reference: &str) -> &str {
    reference.split(REF_SEP).next().unwrap_or(reference)
}

/// `a`, `a.b` and `a.b.c` for `a.b.c`
fn prefixes(reference: &str) -> impl Iterator<Item = &str> {
    reference
        .match_indices(REF_SEP)
        .map(move |(idx, _)| &reference[..idx])
        .chain(std::iter::once(reference))
}

/// `prefix` is `reference` or one of its ancestors
fn covers(prefix: &str, reference: &str) -> bool {
    reference == prefix
        || (reference.starts_with(prefix) && reference[prefix.len()..].starts_with(REF_SEP))
}

struct Walk<'l, F> {
    units: Vec<Unit>,
    location: &'l F,
}

impl<'l, F: Fn(&str) -> Option<Location>> Walk<'l, F> {
    /// Allocate the slot for `value`, queueing units for everything that needs rendering
    fn slot(&mut self, value: &Value, reference: &str, path: Vec<Segment>) -> Result<Slot> {
        let slot = match value {
            Value::String(text) => {
                let template = Template::with_location(text.as_str(), (self.location)(reference))?;
                self.units.push(Unit {
                    reference: reference.to_owned(),
                    path,
                    kind: UnitKind::Leaf { template },
                });
                return Ok(Slot::Pending);
            }
            Value::Array(items) => Slot::Sequence(
                items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| {
                        let mut path = path.clone();
                        path.push(Segment::Index(idx));
                        self.slot(item, &join_ref(reference, idx), path)
                    })
                    .collect::<Result<_>>()?,
            ),
            Value::Object(entries) => Slot::Mapping(
                entries
                    .iter()
                    .map(|(key, item)| {
                        let mut path = path.clone();
                        path.push(Segment::Key(key.clone()));
                        Ok((key.clone(), self.slot(item, &join_ref(reference, key), path)?))
                    })
                    .collect::<Result<_>>()?,
            ),
            other => return Ok(Slot::Ready(other.clone())),
        };

        if slot.children().all(Slot::is_ready) {
            return Ok(Slot::Ready(slot.snapshot()));
        }

        // the root is collected after resolution
        if !path.is_empty() {
            let children = match value {
                Value::Array(items) => (0..items.len()).map(|idx| join_ref(reference, idx)).collect(),
                Value::Object(entries) => entries.keys().map(|key| join_ref(reference, key)).collect(),
                _ => vec![],
            };
            self.units.push(Unit {
                reference: reference.to_owned(),
                path,
                kind: UnitKind::Container { children },
            });
        }
        Ok(slot)
    }
}

struct Resolver<'a> {
    root: Slot,
    units: Vec<Unit>,
    done: Vec<bool>,
    /// Per unit, the refs it waits for
    requires: Vec<Vec<String>>,
    /// Top-level names produced by units, empty unless the root is a mapping
    unit_tops: IndexSet<String>,
    /// Per ref path, the number of pending leaves bound to it
    pending_leaves: IndexMap<String, usize>,
    /// Per ref path, the number of pending units at or below it
    pending_below: IndexMap<String, usize>,
    context: Context,
    publish: bool,
    locations: &'a Locations,
}

impl<'a> Resolver<'a> {
    fn new(context: &Context, root: Slot, units: Vec<Unit>, locations: &'a Locations) -> Self {
        let publish = matches!(root, Slot::Mapping(_));

        let (context, unit_tops) = if publish {
            let working = context.chain();
            if let Slot::Mapping(entries) = &root {
                for (key, slot) in entries {
                    working.insert(key.as_str(), slot.snapshot());
                }
            }
            let tops = units.iter().map(|unit| unit.top().to_owned()).collect();
            (working, tops)
        } else {
            (context.clone(), IndexSet::new())
        };

        let requires = units
            .iter()
            .map(|unit| match &unit.kind {
                UnitKind::Leaf { template } => template
                    .variables()
                    .refs()
                    .map(|reference| reference.name.clone())
                    .filter(|name| unit_tops.contains(top(name)) || !context.contains(top(name)))
                    .collect(),
                UnitKind::Container { .. } => vec![],
            })
            .collect();

        let mut pending_leaves = IndexMap::new();
        let mut pending_below = IndexMap::new();
        for unit in &units {
            if unit.is_leaf() {
                *pending_leaves.entry(unit.reference.clone()).or_insert(0) += 1;
            }
            for prefix in prefixes(&unit.reference) {
                *pending_below.entry(prefix.to_owned()).or_insert(0) += 1;
            }
        }

        Self {
            root,
            done: vec![false; units.len()],
            units,
            requires,
            unit_tops,
            pending_leaves,
            pending_below,
            context,
            publish,
            locations,
        }
    }

    fn pending(&self) -> impl Iterator<Item = (usize, &Unit)> {
        self.units
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.done[*idx])
    }

    /// Pending units that `reference` has to wait for
    fn blockers(&self, reference: &str) -> Vec<usize> {
        self.pending()
            .filter(|(_, unit)| {
                (unit.is_leaf() && covers(&unit.reference, reference)) || covers(reference, &unit.reference)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Same answer as a non-empty [Self::blockers], without scanning every unit
    fn is_blocked(&self, reference: &str) -> bool {
        let count = |index: &IndexMap<String, usize>, key: &str| index.get(key).copied().unwrap_or(0);

        !self.unit_tops.contains(top(reference))
            || prefixes(reference).any(|prefix| count(&self.pending_leaves, prefix) > 0)
            || count(&self.pending_below, reference) > 0
    }

    fn finish(&mut self, idx: usize) {
        self.done[idx] = true;

        let unit = &self.units[idx];
        if unit.is_leaf() {
            if let Some(count) = self.pending_leaves.get_mut(&unit.reference) {
                *count -= 1;
            }
        }
        for prefix in prefixes(&unit.reference) {
            if let Some(count) = self.pending_below.get_mut(prefix) {
                *count -= 1;
            }
        }
    }

    fn is_ready(&self, idx: usize) -> bool {
        match &self.units[idx].kind {
            UnitKind::Leaf { .. } => self.requires[idx].iter().all(|r| !self.is_blocked(r)),
            UnitKind::Container { .. } => self
                .root
                .get(&self.units[idx].path)
                .map(|slot| slot.children().all(Slot::is_ready))
                .unwrap_or(false),
        }
    }

    fn run(mut self) -> Result<Value> {
        tracing::debug!(units = self.units.len(), "resolving object template");

        let mut pending: Vec<usize> = (0..self.units.len()).rev().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::with_capacity(before);
            for idx in pending {
                if self.is_ready(idx) {
                    self.resolve(idx)?;
                    self.finish(idx);
                } else {
                    waiting.push(idx);
                }
            }

            if waiting.len() == before {
                return Err(self.deadlock());
            }
            pending = waiting;
        }

        Ok(self.root.snapshot())
    }

    fn resolve(&mut self, idx: usize) -> Result<()> {
        let unit = &self.units[idx];
        let value = match &unit.kind {
            UnitKind::Leaf { template } => template.render(&self.context)?,
            UnitKind::Container { .. } => self
                .root
                .get(&unit.path)
                .map(Slot::snapshot)
                .unwrap_or_default(),
        };
        tracing::trace!(reference = %unit.reference, "resolved");

        if let Some(slot) = self.root.get_mut(&unit.path) {
            *slot = Slot::Ready(value);
        }

        if self.publish {
            if let Some(Segment::Key(key)) = unit.path.first() {
                let snapshot = self
                    .root
                    .get(&unit.path[..1])
                    .map(Slot::snapshot)
                    .unwrap_or_default();
                self.context.insert(key.as_str(), snapshot);
            }
        }
        Ok(())
    }

    fn deadlock(&self) -> Error {
        let mut undefined: Vec<(&str, usize)> = vec![];
        for (idx, _) in self.pending() {
            for reference in &self.requires[idx] {
                if !self.unit_tops.contains(top(reference))
                    && !undefined.iter().any(|(name, _)| *name == reference.as_str())
                {
                    undefined.push((reference.as_str(), idx));
                }
            }
        }

        if !undefined.is_empty() {
            tracing::debug!(count = undefined.len(), "undefined variables in object template");
            let mut error = UndefinedVariableError::new(undefined.iter().map(|(name, _)| *name));
            for (name, idx) in undefined {
                let (Some(detail), UnitKind::Leaf { template }) =
                    (error.detail_mut(name), &self.units[idx].kind)
                else {
                    continue;
                };
                detail.file_path = template.file().map(Path::to_path_buf);
                if let Some(reference) = template.variables().find_ref(name) {
                    detail.start = Some(reference.start);
                    detail.end = Some(reference.end);
                }
            }
            return Error::UndefinedVariable(error);
        }

        if let Some(path) = self.find_cycle() {
            tracing::debug!(cycle = ?path, "circular dependency in object template");
            let mut error = CircularDependencyError::new(path);
            if let Some(location) = self.locations.get(&error.path[0]) {
                error.detail = error.detail.at(location);
            }
            return Error::CircularDependency(error);
        }

        let stuck: Vec<&str> = self.pending().map(|(_, unit)| unit.reference.as_str()).collect();
        Error::Variable(ErrorDetail::new(format!("Unable to resolve {}", stuck.join(", "))))
    }

    /// Waits-for edges between pending units, shallow refs first
    fn edges(&self, idx: usize) -> Vec<usize> {
        let edges: IndexSet<usize> = match &self.units[idx].kind {
            UnitKind::Leaf { .. } => self.requires[idx]
                .iter()
                .flat_map(|reference| self.blockers(reference))
                .collect(),
            UnitKind::Container { children } => self
                .pending()
                .filter(|(_, unit)| children.contains(&unit.reference))
                .map(|(idx, _)| idx)
                .collect(),
        };
        let mut edges: Vec<usize> = edges.into_iter().collect();
        edges.sort_by_key(|idx| self.units[*idx].reference.matches(REF_SEP).count());
        edges
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = vec![false; self.units.len()];
        let mut stack = vec![];

        let pending: Vec<usize> = self.pending().map(|(idx, _)| idx).collect();
        pending
            .into_iter()
            .find_map(|idx| self.visit(idx, &mut visited, &mut stack))
    }

    fn visit(&self, idx: usize, visited: &mut [bool], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|on_stack| *on_stack == idx) {
            let mut cycle: Vec<String> = stack[pos..]
                .iter()
                .map(|idx| self.units[*idx].reference.clone())
                .collect();
            cycle.push(self.units[idx].reference.clone());
            return Some(cycle);
        }
        if visited[idx] {
            return None;
        }

        visited[idx] = true;
        stack.push(idx);
        let cycle = self
            .edges(idx)
            .into_iter()
            .find_map(|next| self.visit(next, visited, stack));
        stack.pop();
        cycle
    }
}

/// Render every string of `values` against `context`, see [ObjectTemplate]
pub fn render_object(context: &Context, values: Object) -> Result<Object> {
    match ObjectTemplate::new(context).render(&Value::Object(values))? {
        Value::Object(rendered) => Ok(rendered),
        _ => Ok(Object::new()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml(text: &str) -> Value {
        Document::parse(text, None).unwrap().value
    }

    fn render(context: &Context, text: &str) -> Result<Value> {
        ObjectTemplate::new(context).render(&yaml(text))
    }

    #[test]
    fn siblings_resolve_in_dependency_order() {
        let rendered = render(
            &Context::new(),
            "url: https://${name}.example.com\nname: app-${env}\nenv: prod\n",
        )
        .unwrap();
        assert_eq!(
            rendered,
            yaml("url: https://app-prod.example.com\nname: app-prod\nenv: prod\n")
        );
    }

    #[test]
    fn nested_references() {
        let rendered = render(
            &Context::new(),
            "db:\n  host: ${hosts[0]}\n  port: 5432\nhosts:\n  - ${region}.db\nregion: eu\nport: ${db.port}\n",
        )
        .unwrap();
        assert_eq!(
            rendered,
            yaml("db:\n  host: eu.db\n  port: 5432\nhosts:\n  - eu.db\nregion: eu\nport: 5432\n")
        );
    }

    #[test]
    fn values_keep_their_type() {
        let context = Context::from_iter([("count", Value::Integer(3))]);
        let rendered = render(&context, "replicas: ${count}\nlabel: n=${count}\n").unwrap();
        assert_eq!(rendered, yaml("replicas: 3\nlabel: n=3\n"));
    }

    #[test]
    fn context_names_are_not_dependencies() {
        let context = Context::from_iter([("env", "dev")]);
        let rendered = render(&context, "name: app-${env}\n").unwrap();
        assert_eq!(rendered, yaml("name: app-dev\n"));
    }

    #[test]
    fn loop_variables_are_not_dependencies() {
        let rendered = render(
            &Context::new(),
            "items: [a, b]\nall: '{% for item in items %}{{ item }}{% endfor %}'\n",
        )
        .unwrap();
        assert_eq!(rendered.as_object().unwrap()["all"], Value::from("ab"));
    }

    #[test]
    fn sequences_at_the_root() {
        let context = Context::from_iter([("x", "1")]);
        let rendered = render(&context, "- a${x}\n- ['b${x}', '${x}']\n- c: ${x}\n").unwrap();
        assert_eq!(rendered, yaml("- a1\n- [b1, '1']\n- c: '1'\n"));
    }

    #[test]
    fn scalars_pass_through() {
        let context = Context::from_iter([("x", 2i64)]);
        let template = ObjectTemplate::new(&context);
        assert_eq!(template.render(&Value::Integer(5)).unwrap(), Value::Integer(5));
        assert_eq!(template.render(&Value::from("${x}")).unwrap(), Value::Integer(2));
    }

    #[test]
    fn all_undefined_names_are_reported() {
        let Err(Error::UndefinedVariable(error)) = render(&Context::new(), "a: ${zeta}\nb: ${alpha}\n")
        else {
            panic!("expected undefined variables");
        };
        assert_eq!(error.names, vec!["alpha".to_owned(), "zeta".to_owned()]);
    }

    #[test]
    fn cycles_are_reported_as_paths() {
        let Err(Error::CircularDependency(error)) = render(&Context::new(), "a: ${b}\nb: ${a}\n") else {
            panic!("expected circular dependency");
        };
        assert_eq!(error.path, vec!["a", "b", "a"]);
        assert_eq!(error.detail.message, "Found circular dependency: a -> b -> a");
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let Err(Error::CircularDependency(error)) = render(&Context::new(), "a: x${a}\n") else {
            panic!("expected circular dependency");
        };
        assert_eq!(error.path, vec!["a", "a"]);
    }

    #[test]
    fn container_cycles_go_through_the_container() {
        let Err(Error::CircularDependency(error)) = render(&Context::new(), "a:\n  b: ${a}\n") else {
            panic!("expected circular dependency");
        };
        assert_eq!(error.path, vec!["a.b", "a", "a.b"]);
    }

    #[test]
    fn cycle_is_located_in_the_document() {
        let document = Document::parse("x: 1\na: ${b}\nb: ${a}\n", Some("vars.yml".into())).unwrap();
        let Err(Error::CircularDependency(error)) =
            ObjectTemplate::new(&Context::new()).render_document(&document)
        else {
            panic!("expected circular dependency");
        };
        assert_eq!(error.detail.file_path, Some("vars.yml".into()));
        assert_eq!(error.detail.start.map(|p| p.line), Some(2));
    }

    #[test]
    fn ref_prefixes() {
        assert_eq!(prefixes("a").collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(prefixes("a.b.2").collect::<Vec<_>>(), vec!["a", "a.b", "a.b.2"]);
    }

    #[test]
    fn long_dependency_chains() {
        let count = 500;
        let mut values: Object = (1..count)
            .map(|n| (format!("k{n}"), Value::from(format!("${{k{}}}", n - 1))))
            .collect();
        values.insert("k0".to_owned(), Value::from("v"));

        let rendered = render_object(&Context::new(), values).unwrap();
        assert_eq!(rendered.len(), count);
        assert!(rendered.values().all(|value| *value == Value::from("v")));
    }

    #[test]
    fn parents_wait_for_pending_children() {
        let rendered = render(
            &Context::new(),
            "all: ${app}
first: ${app.hosts[0]}
app:
  hosts:
    - ${name}-1
  port: ${port}
name: web
port: 80
",
        )
        .unwrap();
        assert_eq!(
            rendered,
            yaml("all:
  hosts: [web-1]
  port: 80
first: web-1
app:
  hosts: [web-1]
  port: 80
name: web
port: 80
")
        );
    }

    #[test]
    fn render_object_keeps_key_order() {
        let values: Object = [("b", Value::from("${a}")), ("a", Value::from("1"))]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        let rendered = render_object(&Context::new(), values).unwrap();
        assert_eq!(rendered.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
