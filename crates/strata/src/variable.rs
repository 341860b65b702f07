//! names seen by the compiler
//!
//! [VariableStore] answers two questions while a template compiles: is a bare name bound
//! inside the template (a loop variable, a filter, a built-in), and which free names does the
//! template read from its context. The second answer outlives compilation: the object-tree
//! resolver orders work by it and rendering errors use it to find a position for a name.
use crate::position::Position;
use crate::registry::{self, Filter};
use indexmap::IndexMap;

pub const REF_SEP: &str = ".";

/// Ref path of the child `segment` of `parent`, the root's children have bare names
pub fn join_ref(parent: &str, segment: impl std::fmt::Display) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{REF_SEP}{segment}")
    }
}

/// A free reference like `a.b[0]`, canonicalized as `a.b.0`
#[derive(Debug, Clone, derive_new::new)]
pub struct VariableRef {
    pub name: String,
    pub nodes: Vec<String>,
    pub start: Position,
    pub end: Position,
}

impl VariableRef {
    pub fn from_nodes(nodes: Vec<String>, start: Position, end: Position) -> Self {
        Self::new(nodes.join(REF_SEP), nodes, start, end)
    }

    pub fn top(&self) -> &str {
        &self.nodes[0]
    }
}

impl PartialEq for VariableRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for VariableRef {}

#[derive(Debug, Default, Clone)]
pub struct VariableStore {
    locals: Vec<String>,
    bounds: Vec<usize>,
    globals: IndexMap<String, Filter>,
    refs: IndexMap<String, VariableRef>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_scope(&mut self) {
        self.bounds.push(self.locals.len());
    }

    /// Forget every local declared since the matching [Self::begin_scope]
    pub fn end_scope(&mut self) {
        let bound = self.bounds.pop().unwrap_or(0);
        self.locals.truncate(bound);
    }

    pub fn declare(&mut self, name: impl Into<String>) {
        self.locals.push(name.into());
    }

    /// Make a filter callable from compiled code
    pub fn define(&mut self, name: impl Into<String>, filter: Filter) {
        self.globals.insert(name.into(), filter);
    }

    pub fn global(&self, name: &str) -> Option<&Filter> {
        self.globals.get(name)
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|local| local == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.is_local(name) || self.globals.contains_key(name) || registry::is_builtin(name)
    }

    /// Remember a free reference; the first occurrence of a name keeps its position
    pub fn record(&mut self, reference: VariableRef) {
        tracing::trace!(name = %reference.name, "free reference");
        self.refs.entry(reference.name.clone()).or_insert(reference);
    }

    pub fn refs(&self) -> impl Iterator<Item = &VariableRef> {
        self.refs.values()
    }

    /// The recorded reference with the fewest nodes among those starting with `name`
    pub fn get_ref(&self, name: &str) -> Option<&VariableRef> {
        let nodes: Vec<&str> = name.split(REF_SEP).collect();

        self.refs
            .values()
            .filter(|reference| {
                reference.nodes.len() >= nodes.len()
                    && reference.nodes.iter().zip(&nodes).all(|(a, b)| a == b)
            })
            .min_by_key(|reference| reference.nodes.len())
    }

    /// Like [Self::get_ref], falling back to the longest recorded parent of `name`
    ///
    /// `a.b.c` is found through `a.b` when `c` was only known at render time.
    pub fn find_ref(&self, name: &str) -> Option<&VariableRef> {
        let mut name = name;
        loop {
            if let Some(reference) = self.get_ref(name) {
                return Some(reference);
            }
            name = name.rsplit_once(REF_SEP)?.0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store(refs: &[&[&str]]) -> VariableStore {
        let mut store = VariableStore::new();
        for nodes in refs {
            store.record(VariableRef::from_nodes(
                nodes.iter().map(|n| n.to_string()).collect(),
                Position::default(),
                Position::default(),
            ));
        }
        store
    }

    #[test]
    fn get_ref_prefers_shortest_match() {
        let lookup = |refs: &[&[&str]], name| store(refs).get_ref(name).map(|r| r.name.clone());

        assert_eq!(lookup(&[], "unknown"), None);
        assert_eq!(lookup(&[&["a"]], "a"), Some("a".to_owned()));
        assert_eq!(lookup(&[&["ab"]], "a"), None);
        assert_eq!(lookup(&[&["a", "b"]], "a"), Some("a.b".to_owned()));
        assert_eq!(lookup(&[&["a", "b"], &["a"]], "a"), Some("a".to_owned()));
        assert_eq!(lookup(&[&["a", "b"]], "a.b.c"), None);
    }

    #[test]
    fn scopes_discard_declared_names() {
        let mut store = VariableStore::new();
        store.declare("outer");
        store.begin_scope();
        store.declare("item");
        assert!(store.contains("item"));
        store.end_scope();

        assert!(!store.contains("item"));
        assert!(store.contains("outer"));
        assert!(store.contains("range"));
    }

    #[test]
    fn refs_compare_by_name() {
        let a = VariableRef::from_nodes(vec!["a".into()], Position::new(1, 1), Position::new(1, 2));
        let b = VariableRef::from_nodes(vec!["a".into()], Position::new(3, 1), Position::new(3, 2));
        assert_eq!(a, b);
    }

    #[test]
    fn ref_paths() {
        assert_eq!(join_ref("", "a"), "a");
        assert_eq!(join_ref("a.b", 2), "a.b.2");
    }

    #[test]
    fn find_ref_falls_back_to_parents() {
        let store = store(&[&["a"], &["b", "c"]]);
        assert_eq!(store.find_ref("a.x.y").unwrap().name, "a");
        assert_eq!(store.find_ref("b.c.d").unwrap().name, "b.c");
        assert!(store.find_ref("z.a").is_none());
    }
}
