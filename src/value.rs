//! Values produced by the script front-end.
//!
//! A rule constructor call arrives as a type name plus keyword arguments.
//! Argument values are restricted to the small tagged union below so the
//! rule factory can validate them without knowing anything about the
//! front-end's own value model.

use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;
use serde::Serialize;

/// Keyword arguments of one rule constructor call, in declaration order.
pub type Kwargs = IndexMap<String, Value>;

/// A single keyword argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// A plain string.
    String(String),
    /// A list of strings.
    List(Vec<String>),
    /// A boolean flag.
    Bool(bool),
    /// An integer.
    Int(i64),
}

impl Value {
    /// Human-readable name of the variant, used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<Vec<&str>> for Value {
    fn from(values: Vec<&str>) -> Self {
        Self::List(values.into_iter().map(str::to_owned).collect())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => write!(f, "{items:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
        }
    }
}
