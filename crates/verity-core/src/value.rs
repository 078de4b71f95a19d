//! Property values
//!
//! Elements carry their properties as a [`ValueMap`]. The same [`Value`]
//! is what expressions evaluate to, what `name=value` run parameters parse
//! into, and what `Format` splices into constraint messages, so its
//! `Display` form is the one users read in validation reports.

use crate::identity::ElementId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A property value or expression result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// Missing property, or no result
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Another element of the same model, followed with `Follow`
    ElementRef(ElementId),
    List(Vec<Value>),
    Map(ValueMap),
}

/// Named values in declaration order: element properties, script variables
/// and run parameters
pub type ValueMap = IndexMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by arithmetic and comparisons; integers widen
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Name used in type errors and metamodel diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::ElementRef(_) => "element",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Whether a check or guard that produced this value holds
    ///
    /// Null, `false`, zero and empty strings or collections fail; an element
    /// reference always holds.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::ElementRef(_) => true,
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Type the value half of a `name=value` run parameter
    ///
    /// Integers, finite floats and booleans are recognised. A value wrapped
    /// in double quotes is always a string, without the quotes, so `"007"`
    /// stays text. Anything else is kept as a trimmed string.
    pub fn parse_literal(text: &str) -> Value {
        let text = text.trim();
        if let Some(quoted) = text
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            return Value::String(quoted.to_string());
        }
        if let Ok(n) = text.parse::<i64>() {
            return Value::Int(n);
        }
        match text.parse::<f64>() {
            Ok(x) if x.is_finite() => Value::Float(x),
            _ => match text {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(text.to_string()),
            },
        }
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl IntoIterator<Item = T>,
) -> fmt::Result {
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Message form: strings unquoted, collections bracketed
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => f.write_str(s),
            Value::ElementRef(id) => write!(f, "{}", id),
            Value::List(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                write_joined(f, map.iter().map(|(k, v)| format!("{}: {}", k, v)))?;
                f.write_str("}")
            }
        }
    }
}

macro_rules! value_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(v: $source) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    f64 => Float,
    String => String,
    &str => String,
    ElementId => ElementRef,
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}
