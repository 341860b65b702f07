//! layered variables
//!
//! A [Context] is a handle to one layer of name → value bindings. [Context::chain] creates a child
//! layer: lookups fall through to the parent, writes stay in the child.
//!
//! Writes are copy-on-write towards children. When a layer writes a key that is visible to one
//! of its live children, the *old* value is first pushed into every child that does not already
//! bind the key itself. A child therefore keeps seeing what it saw when it was created, no
//! matter what happens to its ancestors later on:
//!
//! ```
//! use strata::context::Context;
//! use strata::value::Value;
//!
//! let parent = Context::from_iter([("region", "eu-west-1")]);
//! let child = parent.chain();
//! parent.insert("region", "us-east-1");
//!
//! assert_eq!(child.get("region").unwrap(), Value::from("eu-west-1"));
//! ```
//!
//! Parents only keep weak handles to their children; a dropped child deregisters itself.
//!
//! The root layer of a chained context holds the *initial* (protected) variables, they cannot be
//! overwritten by vars files nor removed.
use crate::document::Document;
use crate::error::{Error, ErrorDetail, Result, UndefinedVariableError};
use crate::position::{Location, Position};
use crate::substitution::ObjectTemplate;
use crate::value::{Object, Value};
use indexmap::{IndexMap, IndexSet};
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::path::Path;
use std::rc::{Rc, Weak};

/// Computes a lazy value on first access
pub type Resolver = dyn Fn() -> Result<Value>;

struct LazyValue {
    resolve: Box<Resolver>,
    value: OnceCell<Value>,
}

impl LazyValue {
    fn force(&self) -> Result<Value> {
        self.value.get_or_try_init(|| (self.resolve)()).cloned()
    }
}

#[derive(Clone)]
enum Slot {
    Value(Value),
    Lazy(Rc<LazyValue>),
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Value(value) => value.fmt(f),
            Slot::Lazy(lazy) => match lazy.value.get() {
                Some(value) => value.fmt(f),
                None => f.write_str("<lazy>"),
            },
        }
    }
}

#[derive(Default)]
struct Layer {
    data: IndexMap<String, Slot>,
    parent: Option<Context>,
    children: Vec<Weak<RefCell<Layer>>>,
}

impl Drop for Layer {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            // a busy parent prunes dead children on its next write
            if let Ok(mut parent) = parent.layer.try_borrow_mut() {
                parent.children.retain(|child| child.strong_count() > 0);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct Context {
    layer: Rc<RefCell<Layer>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// New empty layer on top of this one
    pub fn chain(&self) -> Context {
        let child = Context {
            layer: Rc::new(RefCell::new(Layer {
                data: IndexMap::new(),
                parent: Some(self.clone()),
                children: vec![],
            })),
        };

        self.layer
            .borrow_mut()
            .children
            .push(Rc::downgrade(&child.layer));
        child
    }

    pub fn parent(&self) -> Option<Context> {
        self.layer.borrow().parent.clone()
    }

    fn root(&self) -> Context {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    fn find(&self, key: &str) -> Option<Slot> {
        let mut current = Some(self.clone());
        while let Some(context) = current {
            let layer = context.layer.borrow();
            if let Some(slot) = layer.data.get(key) {
                return Some(slot.clone());
            }
            current = layer.parent.clone();
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Value bound to `key` in this layer or the nearest ancestor binding it
    ///
    /// Lazy values are computed on first access and cached in the layer that defines them.
    pub fn get(&self, key: &str) -> Result<Value> {
        match self.find(key) {
            Some(Slot::Value(value)) => Ok(value),
            Some(Slot::Lazy(lazy)) => lazy.force(),
            None => Err(UndefinedVariableError::new([key]).into()),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write(key.into(), Slot::Value(value.into()));
    }

    /// Bind `key` to a value computed by `resolve` on first access
    pub fn insert_lazy<F>(&self, key: impl Into<String>, resolve: F)
    where
        F: Fn() -> Result<Value> + 'static,
    {
        let lazy = LazyValue {
            resolve: Box::new(resolve),
            value: OnceCell::new(),
        };
        self.write(key.into(), Slot::Lazy(Rc::new(lazy)));
    }

    pub fn extend<K, V>(&self, values: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in values {
            self.insert(key, value);
        }
    }

    fn write(&self, key: String, slot: Slot) {
        self.preserve_for_children(&key);
        self.layer.borrow_mut().data.insert(key, slot);
    }

    /// Push the currently visible value of `key` into children that do not bind it themselves
    fn preserve_for_children(&self, key: &str) {
        let Some(old) = self.find(key) else {
            return;
        };

        let children: Vec<Context> = {
            let mut layer = self.layer.borrow_mut();
            layer.children.retain(|child| child.strong_count() > 0);
            layer
                .children
                .iter()
                .filter_map(Weak::upgrade)
                .map(|layer| Context { layer })
                .collect()
        };

        for child in children {
            let mut layer = child.layer.borrow_mut();
            if !layer.data.contains_key(key) {
                tracing::debug!(key, "preserve value in child context");
                layer.data.insert(key.to_owned(), old.clone());
            }
        }
    }

    /// Remove `key` from this layer
    ///
    /// Initial variables and keys bound by an ancestor layer cannot be removed.
    pub fn remove(&self, key: &str) -> Result<Value> {
        if self.initial_vars().contains(key) {
            return Err(Error::Variable(protected(key)));
        }

        let own = self.layer.borrow().data.contains_key(key);
        if !own {
            if self.contains(key) {
                return Err(Error::Variable(ErrorDetail::new(format!(
                    "{key} is defined by a parent context and cannot be removed."
                ))));
            }
            return Err(UndefinedVariableError::new([key]).into());
        }

        let value = self.get(key)?;
        self.preserve_for_children(key);
        self.layer.borrow_mut().data.shift_remove(key);
        Ok(value)
    }

    /// All visible keys, outermost layer first
    pub fn keys(&self) -> IndexSet<String> {
        let mut layers = vec![];
        let mut current = Some(self.clone());
        while let Some(context) = current {
            current = context.parent();
            layers.push(context);
        }

        let mut keys = IndexSet::new();
        for context in layers.iter().rev() {
            keys.extend(context.layer.borrow().data.keys().cloned());
        }
        keys
    }

    /// Keys of the root layer if this context is chained, nothing otherwise
    pub fn initial_vars(&self) -> IndexSet<String> {
        if self.parent().is_none() {
            return IndexSet::new();
        }
        let root = self.root();
        let keys = root.layer.borrow().data.keys().cloned().collect();
        keys
    }

    /// Every visible binding with lazy values forced
    pub fn as_map(&self, exclude_initial: bool) -> Result<Object> {
        let initial = match exclude_initial {
            true => self.initial_vars(),
            false => IndexSet::new(),
        };

        self.keys()
            .into_iter()
            .filter(|key| !initial.contains(key))
            .map(|key| {
                let value = self.get(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Values of all `names`, or an error naming every unknown one
    pub fn require<S: AsRef<str>>(&self, names: &[S]) -> Result<Object> {
        let unknown: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !self.contains(name))
            .collect();

        if !unknown.is_empty() {
            return Err(UndefinedVariableError::new(unknown).into());
        }

        names
            .iter()
            .map(|name| Ok((name.as_ref().to_owned(), self.get(name.as_ref())?)))
            .collect()
    }

    /// Render a vars file against this context and bind every top-level key
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let document = Document::from_file(path.as_ref())?;
        self.load_document(&document)
    }

    pub fn load_document(&self, document: &Document) -> Result<()> {
        let location = |reference: &str| {
            document
                .locations
                .get(reference)
                .cloned()
                .unwrap_or_else(|| Location::new(document.file.clone(), Position::default(), None))
        };

        match &document.value {
            Value::Null => return Ok(()),
            Value::Object(_) => {}
            other => {
                return Err(Error::Document(
                    ErrorDetail::new(format!(
                        "Expected a mapping of variables, got {}",
                        other.type_name()
                    ))
                    .at(&location("")),
                ))
            }
        }

        let rendered = ObjectTemplate::new(self).render_document(document)?;
        let Value::Object(vars) = rendered else {
            return Ok(());
        };

        let initial = self.initial_vars();
        if let Some(key) = vars.keys().find(|key| initial.contains(*key)) {
            return Err(Error::Variable(protected(key).at(&location(key))));
        }

        tracing::info!(
            file = ?document.file,
            count = vars.len(),
            "loaded variables"
        );
        self.extend(vars);
        Ok(())
    }
}

fn protected(key: &str) -> ErrorDetail {
    ErrorDetail::new(format!("{key} is protected variable and cannot be altered."))
        .with_hint("Protected variables come from the command line or the environment.")
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let context = Context::new();
        context.extend(iter);
        context
    }
}

impl From<Object> for Context {
    fn from(values: Object) -> Self {
        values.into_iter().collect()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let layer = self.layer.borrow();
        f.debug_struct("Context")
            .field("data", &layer.data)
            .field("parent", &layer.parent)
            .finish()
    }
}
