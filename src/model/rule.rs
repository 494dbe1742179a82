//! Declared build rules.
//!
//! A [`BuildRule`] is the immutable record of one constructor call in a
//! BUILD file. Everything derived later lives elsewhere: dependency edges in
//! [`super::LinkedGraph`], resolved flags and sources in
//! [`crate::prepare::ResolvedRule`].

use std::fmt::{self, Display, Formatter};
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};

/// Version assigned to rules that do not declare one.
pub const DEFAULT_VERSION: &str = "DEFAULT";

bitflags::bitflags! {
    /// Capability bits describing what a rule produces.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RuleType: u8 {
        /// Produces a library other rules link against.
        const LIBRARY  = 1 << 0;
        /// Produces an executable.
        const BINARY   = 1 << 1;
        /// Executable run by the `test` target.
        const TEST     = 1 << 2;
        /// Opaque externally-built artifact.
        const EXTERNAL = 1 << 3;
        /// Built with the C/C++ toolchain.
        const CC       = 1 << 4;
    }
}

/// Index of a rule in the rule arena.
///
/// Ids are handed out in construction order and double as indices into the
/// flat per-rule arrays used by the graph algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(usize);

impl RuleId {
    /// Wrap a raw arena index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Attributes of `cc_library`, `cc_binary` and `cc_test` rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CcAttrs {
    /// Source patterns, relative to the package directory.
    pub srcs: Vec<String>,
    /// Header patterns, relative to the package directory.
    pub headers: Vec<String>,
    /// Patterns removed from `srcs` and `headers`.
    pub excludes: Vec<String>,
    /// Include directories, propagated to dependents.
    pub include: Vec<String>,
    /// Preprocessor defines, propagated to dependents.
    pub defines: Vec<String>,
    /// C compiler flags for this rule only.
    pub cflags: Vec<String>,
    /// C++ compiler flags for this rule only.
    pub cxxflags: Vec<String>,
    /// Linker flags, inherited by every rule that links this one.
    pub ldflags: Vec<String>,
    /// Arguments passed when a test binary is run.
    pub args: Vec<String>,
}

/// Attributes of an `external_project` rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalAttrs {
    /// Opaque installation script, run inside the working folder.
    pub install_script: String,
    /// Files the installation leaves behind, relative to the working folder.
    pub exports: Vec<String>,
}

/// Attributes of a `shell_script` rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellScriptAttrs {
    /// Script run from the package directory.
    pub script: String,
    /// Files the script produces, relative to the package directory.
    pub outputs: Vec<String>,
}

/// Type-specific payload of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// C/C++ library, binary or test.
    Cc(CcAttrs),
    /// Externally built project.
    External(ExternalAttrs),
    /// Arbitrary generator script.
    ShellScript(ShellScriptAttrs),
}

/// A rule as produced by the rule factory, before it joins a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDecl {
    /// Capability bits.
    pub rule_type: RuleType,
    /// Constructor name used for compiler dispatch, such as `cc_library`.
    pub type_name: String,
    /// Name, unique within the package.
    pub name: String,
    /// Declared version.
    pub version: String,
    /// Dependency references exactly as written.
    pub raw_deps: Vec<String>,
    /// Type-specific attributes.
    pub kind: RuleKind,
}

/// Derived names, computed once per rule.
#[derive(Debug)]
struct RuleNames {
    full: String,
    quoted: String,
    full_no_version: String,
    quoted_no_version: String,
}

/// One declared build target.
#[derive(Debug)]
pub struct BuildRule {
    object_id: RuleId,
    package: String,
    decl: RuleDecl,
    names: OnceLock<RuleNames>,
}

impl BuildRule {
    pub(crate) const fn new(object_id: RuleId, package: String, decl: RuleDecl) -> Self {
        Self {
            object_id,
            package,
            decl,
            names: OnceLock::new(),
        }
    }

    /// Stable arena id of this rule.
    #[must_use]
    pub const fn object_id(&self) -> RuleId {
        self.object_id
    }

    /// Capability bits.
    #[must_use]
    pub const fn rule_type(&self) -> RuleType {
        self.decl.rule_type
    }

    /// Constructor name, e.g. `cc_library`.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.decl.type_name
    }

    /// Owning package key.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Rule name within the package.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// Declared version, [`DEFAULT_VERSION`] when omitted.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.decl.version
    }

    /// Dependency references as declared.
    #[must_use]
    pub fn raw_dependencies(&self) -> &[String] {
        &self.decl.raw_deps
    }

    /// Type-specific attributes.
    #[must_use]
    pub const fn kind(&self) -> &RuleKind {
        &self.decl.kind
    }

    /// C/C++ attributes, if this is a CC rule.
    #[must_use]
    pub const fn cc(&self) -> Option<&CcAttrs> {
        match &self.decl.kind {
            RuleKind::Cc(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// `package/name@version`.
    #[must_use]
    pub fn full_qualified_name(&self) -> &str {
        &self.names().full
    }

    /// `package/name`.
    #[must_use]
    pub fn full_qualified_name_with_no_version(&self) -> &str {
        &self.names().full_no_version
    }

    /// The qualified name with every `/` replaced by `@@`, safe to use as a
    /// file or target name.
    #[must_use]
    pub fn quoted_full_qualified_name(&self) -> &str {
        &self.names().quoted
    }

    /// [`Self::quoted_full_qualified_name`] without the version suffix.
    #[must_use]
    pub fn quoted_full_qualified_name_with_no_version(&self) -> &str {
        &self.names().quoted_no_version
    }

    /// Per-rule output directory below `build_root`.
    #[must_use]
    pub fn working_folder(&self, build_root: &Utf8Path) -> Utf8PathBuf {
        build_root.join(self.quoted_full_qualified_name())
    }

    fn names(&self) -> &RuleNames {
        self.names.get_or_init(|| {
            let full_no_version = if self.package.is_empty() {
                self.decl.name.clone()
            } else {
                format!("{}/{}", self.package, self.decl.name)
            };
            let full = format!("{full_no_version}@{}", self.decl.version);
            RuleNames {
                quoted: quote(&full),
                quoted_no_version: quote(&full_no_version),
                full,
                full_no_version,
            }
        })
    }
}

fn quote(name: &str) -> String {
    name.replace('/', "@@")
}

impl Display for BuildRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_qualified_name())
    }
}
