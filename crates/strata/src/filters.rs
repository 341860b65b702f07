//! the filters every template can pipe through
use crate::registry::{Filter, FilterError};
use crate::value::Value;
use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt::Write;

pub(crate) fn core() -> Vec<Filter> {
    vec![
        Filter::new("uppercase", |value, args| {
            no_args("uppercase", args)?;
            Ok(Value::String(text("uppercase", value)?.to_uppercase()))
        }),
        Filter::new("lowercase", |value, args| {
            no_args("lowercase", args)?;
            Ok(Value::String(text("lowercase", value)?.to_lowercase()))
        }),
        Filter::new("titlecase", |value, args| {
            no_args("titlecase", args)?;
            Ok(Value::String(titlecase(text("titlecase", value)?)))
        }),
        Filter::new("strip", |value, args| {
            no_args("strip", args)?;
            Ok(Value::from(text("strip", value)?.trim()))
        }),
        Filter::new("date", |value, args| format_date("date", value, args)),
        Filter::new("datetime", |value, args| format_date("datetime", value, args)),
    ]
}

pub(crate) fn extensions() -> Vec<Filter> {
    vec![Filter::new("base64", |value, args| {
        no_args("base64", args)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(text("base64", value)?);
        Ok(Value::String(encoded))
    })]
}

fn text<'a>(filter: &str, value: &'a Value) -> Result<&'a str, FilterError> {
    value.as_str().ok_or_else(|| {
        FilterError::type_error(format!(
            "{filter} expects a str, got {}",
            value.type_name()
        ))
    })
}

fn no_args(filter: &str, args: &[Value]) -> Result<(), FilterError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(FilterError::type_error(format!(
            "{filter} takes no arguments, got {}",
            args.len()
        )))
    }
}

/// Upper-case the first letter of every run of letters, lower-case the rest
fn titlecase(value: &str) -> String {
    let mut titled = String::with_capacity(value.len());
    let mut in_word = false;

    for c in value.chars() {
        if c.is_alphabetic() {
            if in_word {
                titled.extend(c.to_lowercase());
            } else {
                titled.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            titled.push(c);
            in_word = false;
        }
    }

    titled
}

fn format_date(filter: &str, value: &Value, args: &[Value]) -> Result<Value, FilterError> {
    let format = match args {
        [Value::String(format)] => format,
        [other] => {
            return Err(FilterError::type_error(format!(
                "{filter} format must be a str, got {}",
                other.type_name()
            )))
        }
        _ => {
            return Err(FilterError::type_error(format!(
                "{filter} expects exactly one format argument"
            )))
        }
    };

    let mut formatted = String::new();
    let written = match value {
        Value::Date(date) => write!(formatted, "{}", date.format(format)),
        Value::DateTime(datetime) => write!(formatted, "{}", datetime.format(format)),
        Value::String(text) => match parse_datetime(text) {
            Some(Value::Date(date)) => write!(formatted, "{}", date.format(format)),
            Some(Value::DateTime(datetime)) => write!(formatted, "{}", datetime.format(format)),
            _ => {
                return Err(FilterError::value_error(format!(
                    "Expected a datetime object, got str '{text}'"
                )))
            }
        },
        other => {
            return Err(FilterError::value_error(format!(
                "Expected a datetime object, got {}",
                other.type_name()
            )))
        }
    };

    written.map_err(|_| FilterError::value_error(format!("Invalid format string: {format}")))?;
    Ok(Value::String(formatted))
}

fn parse_datetime(text: &str) -> Option<Value> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(Value::DateTime)
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(Value::Date)
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::lookup_filter;
    use pretty_assertions::assert_eq;

    fn apply(name: &str, value: impl Into<Value>, args: &[Value]) -> Result<Value, FilterError> {
        lookup_filter(name).unwrap().apply(&value.into(), args)
    }

    #[test]
    fn string_filters() {
        assert_eq!(apply("uppercase", "abC", &[]).unwrap(), Value::from("ABC"));
        assert_eq!(apply("lowercase", "AbC", &[]).unwrap(), Value::from("abc"));
        assert_eq!(apply("strip", "  x \n", &[]).unwrap(), Value::from("x"));
        assert_eq!(apply("base64", "hello", &[]).unwrap(), Value::from("aGVsbG8="));
    }

    #[test]
    fn titlecase_follows_word_runs() {
        assert_eq!(titlecase("hello wORLD"), "Hello World");
        assert_eq!(titlecase("they're 1st"), "They'Re 1St");
        assert_eq!(titlecase("abc-def"), "Abc-Def");
    }

    #[test]
    fn string_filters_reject_other_types() {
        let error = apply("uppercase", 5i64, &[]).unwrap_err();
        assert_eq!(error.kind, "TypeError");
        assert_eq!(error.message, "uppercase expects a str, got int");
    }

    #[test]
    fn date_filters() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let format = [Value::from("%d/%m/%Y")];

        assert_eq!(apply("date", date, &format).unwrap(), Value::from("09/03/2024"));
        assert_eq!(apply("date", "2024-03-09", &format).unwrap(), Value::from("09/03/2024"));
        assert_eq!(
            apply("datetime", "2024-03-09T10:11:12", &[Value::from("%H:%M")]).unwrap(),
            Value::from("10:11")
        );
    }

    #[test]
    fn date_filter_errors() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();

        assert_eq!(
            apply("date", 3i64, &[Value::from("%Y")]).unwrap_err().message,
            "Expected a datetime object, got int"
        );
        assert_eq!(apply("date", date, &[]).unwrap_err().kind, "TypeError");
        assert_eq!(
            apply("date", date, &[Value::from("%Q")]).unwrap_err().message,
            "Invalid format string: %Q"
        );
    }
}
