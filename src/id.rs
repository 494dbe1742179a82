//! Rule reference parsing.
//!
//! Dependencies are declared as strings. This module turns them into a
//! structured [`BuildRuleId`]:
//!
//! | Form                 | Position   | Package      |
//! |----------------------|------------|--------------|
//! | `//pkg[/BUILD]:rule` | `Absolute` | `pkg`        |
//! | `##pkg[/BUILD]:rule` | `Builtin`  | `pkg`        |
//! | `:rule`              | `This`     | none         |
//! | `pkg[/BUILD]:rule`   | `Relative` | `pkg`        |
//!
//! A colon preceded by a backslash belongs to the package name. The rule part
//! may end in `@version` to require an exact rule version.
//!
//! ```
//! use jkbuild::id::{self, Position};
//!
//! let id = id::parse("//lib/base/BUILD:base").expect("valid identifier");
//! assert_eq!(id.position, Position::Absolute);
//! assert_eq!(id.package_name.as_deref(), Some("lib/base"));
//! assert_eq!(id.rule_name, "base");
//! ```

use std::fmt::{self, Display, Formatter};

use crate::error::{BuildError, Result};

const BUILD_SUFFIX: &str = "BUILD";

/// Where a reference's package is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// Relative to the project root (`//`).
    Absolute,
    /// Relative to the referencing package's directory.
    Relative,
    /// Inside the builtin rule tree (`##`).
    Builtin,
    /// The referencing package itself (`:rule`).
    This,
}

/// A parsed dependency reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRuleId {
    /// Lookup position of the package.
    pub position: Position,
    /// Package path, absent for [`Position::This`].
    pub package_name: Option<String>,
    /// Target rule name.
    pub rule_name: String,
    /// Exact version required of the target, if any.
    pub version_requirement: Option<String>,
}

/// Parse a rule reference.
///
/// # Errors
///
/// Returns [`BuildError::Parse`] when the input is empty, has no unescaped
/// `:` separator, or names an empty rule or version.
pub fn parse(input: &str) -> Result<BuildRuleId> {
    if input.is_empty() {
        return Err(parse_error(input, "identifier is empty"));
    }
    let (position, rest) = if let Some(rest) = input.strip_prefix("//") {
        (Position::Absolute, rest)
    } else if let Some(rest) = input.strip_prefix("##") {
        (Position::Builtin, rest)
    } else if input.starts_with(':') {
        (Position::This, input)
    } else {
        (Position::Relative, input)
    };

    let (package, rule_part) =
        split_package(rest).ok_or_else(|| parse_error(input, "missing ':' separator"))?;
    let (rule_name, version_requirement) = split_version(rule_part);
    if rule_name.is_empty() {
        return Err(parse_error(input, "rule name is empty"));
    }
    if version_requirement.is_some_and(str::is_empty) {
        return Err(parse_error(input, "version after '@' is empty"));
    }

    let package_name = match position {
        Position::This => None,
        _ => Some(strip_build_suffix(&package).to_owned()),
    };
    Ok(BuildRuleId {
        position,
        package_name,
        rule_name: rule_name.to_owned(),
        version_requirement: version_requirement.map(str::to_owned),
    })
}

/// Scan for the first unescaped colon, removing `\:` escapes from the
/// package part.
fn split_package(text: &str) -> Option<(String, &str)> {
    let mut package = String::new();
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\\' if matches!(chars.peek(), Some((_, ':'))) => {
                package.push(':');
                chars.next();
            }
            ':' => return text.get(idx + 1..).map(|rule| (package, rule)),
            other => package.push(other),
        }
    }
    None
}

fn split_version(rule: &str) -> (&str, Option<&str>) {
    rule.split_once('@')
        .map_or((rule, None), |(name, version)| (name, Some(version)))
}

fn strip_build_suffix(package: &str) -> &str {
    if package == BUILD_SUFFIX {
        return "";
    }
    package
        .strip_suffix(BUILD_SUFFIX)
        .and_then(|p| p.strip_suffix('/'))
        .unwrap_or(package)
}

fn parse_error(input: &str, reason: &str) -> BuildError {
    BuildError::Parse {
        input: input.to_owned(),
        reason: reason.to_owned(),
    }
}

impl BuildRuleId {
    /// Resolve the package key this reference points at, given the package
    /// that declared it.
    ///
    /// Builtin packages are keyed with a leading `##` so they never collide
    /// with project packages.
    #[must_use]
    pub fn resolve_package(&self, current_package: &str) -> String {
        let package = self.package_name.as_deref().unwrap_or_default();
        match self.position {
            Position::This => current_package.to_owned(),
            Position::Absolute => normalize_package(package),
            Position::Builtin => format!("##{}", normalize_package(package)),
            Position::Relative => normalize_package(&format!("{current_package}/{package}")),
        }
    }
}

/// Collapse `.`/`..` segments and empty components in a package path.
pub(crate) fn normalize_package(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

impl Display for BuildRuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let prefix = match self.position {
            Position::Absolute => "//",
            Position::Builtin => "##",
            Position::Relative | Position::This => "",
        };
        let package = self
            .package_name
            .as_deref()
            .unwrap_or_default()
            .replace(':', "\\:");
        write!(f, "{prefix}{package}:{}", self.rule_name)?;
        if let Some(version) = &self.version_requirement {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}
