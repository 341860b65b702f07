//! process-wide filters and built-ins
//!
//! Filters are looked up by name when a template compiles, so registering one after a template
//! was compiled does not affect that template.
use crate::error::{Error, Result};
use crate::filters;
use crate::value::Value;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, PoisonError, RwLock};

pub type FilterFn = dyn Fn(&Value, &[Value]) -> Result<Value, FilterError> + Send + Sync;

/// Failure inside a filter or built-in, `kind` is the category shown in diagnostics
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FilterError {
    pub kind: &'static str,
    pub message: String,
}

impl FilterError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self {
            kind: "TypeError",
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self {
            kind: "ValueError",
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct Filter {
    name: String,
    func: Arc<FilterFn>,
}

impl Filter {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, FilterError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, input: &Value, args: &[Value]) -> Result<Value, FilterError> {
        (self.func)(input, args)
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Filter").field(&self.name).finish()
    }
}

static FILTERS: Lazy<RwLock<IndexMap<String, Filter>>> = Lazy::new(|| {
    let filters = filters::core()
        .into_iter()
        .chain(filters::extensions())
        .map(|filter| (filter.name().to_owned(), filter))
        .collect();
    RwLock::new(filters)
});

/// Make `func` available as `{{ value|name }}` in templates compiled from now on
pub fn register_filter<F>(name: &str, func: F) -> Result<()>
where
    F: Fn(&Value, &[Value]) -> Result<Value, FilterError> + Send + Sync + 'static,
{
    let mut filters = FILTERS.write().unwrap_or_else(PoisonError::into_inner);
    if filters.contains_key(name) {
        return Err(Error::DuplicateFilter(name.to_owned()));
    }

    tracing::debug!(name, "register filter");
    filters.insert(name.to_owned(), Filter::new(name, func));
    Ok(())
}

pub fn lookup_filter(name: &str) -> Option<Filter> {
    FILTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

pub fn filter_names() -> Vec<String> {
    FILTERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}

/// Upper bound for the number of items `range()` produces
pub const MAX_RANGE_LEN: i128 = 1 << 24;

/// The only functions a template may call
pub const BUILTINS: [&str; 2] = ["range", "str"];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value, FilterError> {
    match name {
        "range" => range(args),
        "str" => match args {
            [] => Ok(Value::from("")),
            [value] => Ok(Value::String(value.to_text())),
            _ => Err(FilterError::type_error(format!(
                "str expected at most 1 argument, got {}",
                args.len()
            ))),
        },
        _ => Err(FilterError::type_error(format!("{name} is not callable"))),
    }
}

fn range(args: &[Value]) -> Result<Value, FilterError> {
    let ints = args
        .iter()
        .map(|arg| match arg {
            Value::Integer(i) => Ok(*i),
            other => Err(FilterError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(FilterError::type_error(format!(
                "range expected 1 to 3 arguments, got {}",
                ints.len()
            )))
        }
    };

    if step == 0 {
        return Err(FilterError::value_error("range() arg 3 must not be zero"));
    }

    let (start_wide, stop_wide, step_wide) = (start as i128, stop as i128, step as i128);
    let len = if step > 0 {
        (stop_wide - start_wide + step_wide - 1).div_euclid(step_wide)
    } else {
        (start_wide - stop_wide - step_wide - 1).div_euclid(-step_wide)
    };
    if len > MAX_RANGE_LEN {
        return Err(FilterError {
            kind: "MemoryError",
            message: format!("range() would produce more than {MAX_RANGE_LEN} items"),
        });
    }

    let mut items = Vec::with_capacity(len.max(0) as usize);
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        items.push(Value::Integer(current));
        current = match current.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }

    Ok(Value::Array(items))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn core_and_extension_filters_are_registered() {
        for name in ["uppercase", "lowercase", "titlecase", "strip", "date", "datetime", "base64"] {
            assert!(lookup_filter(name).is_some(), "{name}");
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        register_filter("registry_test_twice", |value, _| Ok(value.clone())).unwrap();
        let error = register_filter("registry_test_twice", |value, _| Ok(value.clone())).unwrap_err();
        assert_eq!(error.to_string(), "Filter registry_test_twice already exists");
        assert!(register_filter("uppercase", |value, _| Ok(value.clone())).is_err());
    }

    #[test]
    fn range_builtin() {
        let ints = |args: &[i64]| {
            let args: Vec<Value> = args.iter().map(|i| Value::Integer(*i)).collect();
            call_builtin("range", &args).unwrap()
        };

        assert_eq!(ints(&[3]), Value::from(vec![0i64, 1, 2]));
        assert_eq!(ints(&[1, 3]), Value::from(vec![1i64, 2]));
        assert_eq!(ints(&[5, 0, -2]), Value::from(vec![5i64, 3, 1]));
        assert_eq!(ints(&[0]), Value::Array(vec![]));
        assert_eq!(ints(&[3, 1]), Value::Array(vec![]));
        assert_eq!(ints(&[-3, 3, 4]), Value::from(vec![-3i64, 1]));

        let error = call_builtin("range", &[Value::Integer(i64::MAX)]).unwrap_err();
        assert_eq!(error.kind, "MemoryError");
        let error = call_builtin(
            "range",
            &[Value::Integer(i64::MAX), Value::Integer(i64::MIN), Value::Integer(-1)],
        )
        .unwrap_err();
        assert_eq!(error.kind, "MemoryError");
        assert_eq!(
            call_builtin("range", &[Value::Integer(1), Value::Integer(2), Value::Integer(0)]).unwrap_err(),
            FilterError::value_error("range() arg 3 must not be zero")
        );
    }

    #[test]
    fn str_builtin() {
        assert_eq!(call_builtin("str", &[Value::Integer(4)]).unwrap(), Value::from("4"));
        assert_eq!(call_builtin("str", &[]).unwrap(), Value::from(""));
    }
}
