//! Script front-end: turns a BUILD file into rule constructor calls.
//!
//! The core only depends on [`ScriptFrontend`]. The shipped implementation,
//! [`YamlFrontend`], reads a YAML sequence of single-key maps, each naming a
//! rule constructor and its keyword arguments:
//!
//! ```yaml
//! - cc_library:
//!     name: base
//!     srcs: ["src/*.cc"]
//!     include: [inc1]
//! ```
//!
//! The YAML is parsed into a JSON value first and then narrowed to the
//! [`Value`] union, so shapes the rule factory cannot use (nested maps,
//! floats, nulls) are rejected here with the offending key in the message.

use camino::Utf8Path;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{BuildError, Result};
use crate::value::{Kwargs, Value};

/// One rule constructor call reported by the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCall {
    /// Constructor name, e.g. `cc_binary`.
    pub type_name: String,
    /// Keyword arguments in declaration order.
    pub kwargs: Kwargs,
}

/// Evaluates rule-declaration files.
pub trait ScriptFrontend: Send + Sync {
    /// Evaluate `path` and return its constructor calls in order.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] when the file cannot be read and
    /// [`BuildError::Script`] when its contents are malformed.
    fn evaluate_file(&self, path: &Utf8Path) -> Result<Vec<RuleCall>>;
}

/// Front-end for YAML BUILD files.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlFrontend;

impl YamlFrontend {
    /// Parse BUILD file text. `path` is only used in diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Script`] when the document is not a sequence of
    /// single-key maps with scalar or string-list arguments.
    pub fn parse_str(source: &str, path: &Utf8Path) -> Result<Vec<RuleCall>> {
        if source.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: JsonValue = serde_saphyr::from_str(source).map_err(|e| BuildError::Script {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let entries = match doc {
            JsonValue::Null => return Ok(Vec::new()),
            JsonValue::Array(entries) => entries,
            other => {
                return Err(script_error(
                    path,
                    format!(
                        "expected a list of rule declarations, found {}",
                        json_kind(&other)
                    ),
                ));
            }
        };
        entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| parse_entry(entry, index, path))
            .collect()
    }
}

impl ScriptFrontend for YamlFrontend {
    fn evaluate_file(&self, path: &Utf8Path) -> Result<Vec<RuleCall>> {
        let source =
            std::fs::read_to_string(path).map_err(|source| BuildError::io(path, source))?;
        let calls = Self::parse_str(&source, path)?;
        debug!(%path, rules = calls.len(), "evaluated BUILD file");
        Ok(calls)
    }
}

fn parse_entry(entry: JsonValue, index: usize, path: &Utf8Path) -> Result<RuleCall> {
    let JsonValue::Object(map) = entry else {
        return Err(script_error(
            path,
            format!("entry {index} must be a map of rule type to arguments"),
        ));
    };
    let mut fields = map.into_iter();
    let (Some((type_name, args)), None) = (fields.next(), fields.next()) else {
        return Err(script_error(
            path,
            format!("entry {index} must have exactly one rule type key"),
        ));
    };
    let kwargs = match args {
        JsonValue::Object(args) => args
            .into_iter()
            .map(|(key, value)| {
                let converted = convert_value(value).map_err(|reason| {
                    script_error(path, format!("{type_name} argument '{key}' {reason}"))
                })?;
                Ok((key, converted))
            })
            .collect::<Result<Kwargs>>()?,
        JsonValue::Null => Kwargs::new(),
        other => {
            return Err(script_error(
                path,
                format!(
                    "arguments of {type_name} must be a map, found {}",
                    json_kind(&other)
                ),
            ));
        }
    };
    Ok(RuleCall { type_name, kwargs })
}

fn convert_value(value: JsonValue) -> std::result::Result<Value, String> {
    match value {
        JsonValue::String(s) => Ok(Value::String(s)),
        JsonValue::Bool(b) => Ok(Value::Bool(b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| format!("must be an integer, found {n}")),
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::String(s) => Ok(s),
                other => Err(format!(
                    "must be a list of strings, found {}",
                    json_kind(&other)
                )),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::List),
        other => Err(format!("has unsupported type {}", json_kind(&other))),
    }
}

const fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "map",
    }
}

fn script_error(path: &Utf8Path, message: String) -> BuildError {
    BuildError::Script {
        path: path.to_path_buf(),
        message,
    }
}
