//! Rule construction from front-end constructor calls.

use std::collections::HashSet;

use camino::Utf8Path;

use super::rule::{
    CcAttrs, DEFAULT_VERSION, ExternalAttrs, RuleDecl, RuleKind, RuleType, ShellScriptAttrs,
};
use crate::error::{BuildError, Result};
use crate::frontend::RuleCall;
use crate::value::{Kwargs, Value};

/// Rule constructors understood by the factory.
pub const RULE_TYPES: [&str; 5] = [
    "cc_library",
    "cc_binary",
    "cc_test",
    "external_project",
    "shell_script",
];

/// Turn one constructor call into a rule declaration.
///
/// # Errors
///
/// Returns [`BuildError::UnknownRuleType`] for unknown constructors and
/// [`BuildError::InvalidAttribute`] for missing, unknown, or ill-typed
/// keyword arguments.
pub fn construct(call: &RuleCall, path: &Utf8Path) -> Result<RuleDecl> {
    let rule_type = match call.type_name.as_str() {
        "cc_library" => RuleType::CC | RuleType::LIBRARY,
        "cc_binary" => RuleType::CC | RuleType::BINARY,
        "cc_test" => RuleType::CC | RuleType::BINARY | RuleType::TEST,
        "external_project" | "shell_script" => RuleType::EXTERNAL,
        other => {
            return Err(BuildError::UnknownRuleType {
                type_name: other.to_owned(),
                path: path.to_path_buf(),
            });
        }
    };

    let mut args = KwargsReader::new(&call.kwargs, path, &call.type_name);
    let name = args.required_string("name")?;
    args.context = format!("{path}:{name}");
    let version = args
        .string("version")?
        .unwrap_or_else(|| DEFAULT_VERSION.to_owned());
    let raw_deps = args.list("deps")?;

    let kind = match call.type_name.as_str() {
        "external_project" => RuleKind::External(ExternalAttrs {
            install_script: args.required_string("install_script")?,
            exports: args.list("exports")?,
        }),
        "shell_script" => RuleKind::ShellScript(ShellScriptAttrs {
            script: args.required_string("script")?,
            outputs: args.list("outputs")?,
        }),
        _ => RuleKind::Cc(CcAttrs {
            srcs: args.list("srcs")?,
            headers: args.list("headers")?,
            excludes: args.list("excludes")?,
            include: args.list("include")?,
            defines: args.list("defines")?,
            cflags: args.list("cflags")?,
            cxxflags: args.list("cxxflags")?,
            ldflags: args.list("ldflags")?,
            args: if rule_type.contains(RuleType::TEST) {
                args.list("args")?
            } else {
                Vec::new()
            },
        }),
    };
    args.finish()?;

    Ok(RuleDecl {
        rule_type,
        type_name: call.type_name.clone(),
        name,
        version,
        raw_deps,
        kind,
    })
}

/// Typed access to keyword arguments that remembers what was consumed.
struct KwargsReader<'a> {
    kwargs: &'a Kwargs,
    used: HashSet<&'a str>,
    context: String,
}

impl<'a> KwargsReader<'a> {
    fn new(kwargs: &'a Kwargs, path: &Utf8Path, type_name: &str) -> Self {
        Self {
            kwargs,
            used: HashSet::new(),
            context: format!("{path}:{type_name}"),
        }
    }

    fn take(&mut self, key: &str) -> Option<&'a Value> {
        let (stored, value) = self.kwargs.get_key_value(key)?;
        self.used.insert(stored.as_str());
        Some(value)
    }

    fn required_string(&mut self, key: &str) -> Result<String> {
        self.string(key)?
            .ok_or_else(|| self.invalid(key, "is required".to_owned()))
    }

    fn string(&mut self, key: &str) -> Result<Option<String>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.is_empty() => {
                Err(self.invalid(key, "must not be empty".to_owned()))
            }
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Int(i)) if key == "version" => Ok(Some(i.to_string())),
            Some(other) => Err(self.invalid(key, format!("must be a string, got {}", other.kind()))),
        }
    }

    /// A list attribute; a single string is accepted as a one-element list.
    fn list(&mut self, key: &str) -> Result<Vec<String>> {
        match self.take(key) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(items.clone()),
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(other) => Err(self.invalid(key, format!("must be a list, got {}", other.kind()))),
        }
    }

    fn finish(self) -> Result<()> {
        match self
            .kwargs
            .keys()
            .find(|key| !self.used.contains(key.as_str()))
        {
            Some(unknown) => Err(self.invalid(unknown, "is not recognised".to_owned())),
            None => Ok(()),
        }
    }

    fn invalid(&self, key: &str, reason: String) -> BuildError {
        BuildError::InvalidAttribute {
            rule: self.context.clone(),
            attribute: key.to_owned(),
            reason,
        }
    }
}
