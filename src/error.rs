//! Error types shared by every stage of the generation pipeline.
//!
//! The generator is a one-shot batch compiler: any violated invariant aborts
//! the whole run. All fatal conditions therefore funnel into [`BuildError`],
//! whose variants carry enough context to print a self-contained message
//! naming the rules and files involved.

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::pool::PoolError;

/// Convenience alias used throughout the library.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Fatal conditions raised while loading, linking, analysing, or compiling
/// the rule graph.
#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    /// A rule reference string could not be parsed.
    #[error("invalid rule identifier '{input}': {reason}")]
    #[diagnostic(
        code(jkbuild::id::parse),
        help("references take the form //pkg:rule, ##pkg:rule, pkg:rule, or :rule")
    )]
    Parse {
        /// The offending identifier text.
        input: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The script front-end rejected a rule-declaration file.
    #[error("failed to evaluate {path}: {message}")]
    #[diagnostic(code(jkbuild::frontend::script))]
    Script {
        /// File being evaluated.
        path: Utf8PathBuf,
        /// Front-end diagnostic.
        message: String,
    },

    /// Reading or writing a file failed.
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(code(jkbuild::io))]
    Io {
        /// Path involved in the failed operation.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A dependency names a package or rule that does not exist.
    #[error("rule {rule} depends on {target}, which does not exist")]
    #[diagnostic(
        code(jkbuild::link::not_found),
        help("check the package path and rule name of the dependency")
    )]
    DependencyNotFound {
        /// Qualified name of the referencing rule.
        rule: String,
        /// The missing target as written.
        target: String,
    },

    /// Linking reached a package the loader never evaluated.
    #[error("internal error: package '{package}' referenced by {rule} was never loaded")]
    #[diagnostic(code(jkbuild::link::not_loaded))]
    PackageNotLoaded {
        /// Qualified name of the referencing rule.
        rule: String,
        /// Package key that was expected to exist.
        package: String,
    },

    /// The rule graph contains a cycle.
    #[error("circular dependency among rules: {}", rules.join(" -> "))]
    #[diagnostic(
        code(jkbuild::analyze::cycle),
        help("build graphs must be acyclic; remove one of the dependencies")
    )]
    Cycle {
        /// Qualified names of the rules forming the cycle.
        rules: Vec<String>,
    },

    /// Two rules in one package share a name.
    #[error("rule '{name}' is declared more than once in package '{package}'")]
    #[diagnostic(code(jkbuild::model::duplicate_rule))]
    DuplicateRule {
        /// Package holding both declarations.
        package: String,
        /// The repeated rule name.
        name: String,
    },

    /// Two rules claim the same source file.
    #[error("source {path} is claimed by both {first} and {second}")]
    #[diagnostic(code(jkbuild::prepare::duplicate_source))]
    DuplicateSource {
        /// Project-relative source path.
        path: Utf8PathBuf,
        /// Rule that registered the file first.
        first: String,
        /// Rule that attempted to register it again.
        second: String,
    },

    /// A source pattern matched a file above the project root.
    #[error("source {path} of {rule} lies outside the project")]
    #[diagnostic(
        code(jkbuild::prepare::source_outside_project),
        help("declare the file in a package of its own and depend on that package")
    )]
    SourceOutsideProject {
        /// Qualified name of the rule.
        rule: String,
        /// The path as matched, relative to the project root.
        path: Utf8PathBuf,
    },

    /// No compiler is registered for a `(format, type)` combination that
    /// is expected to produce output.
    #[error("no '{format}' compiler registered for rule type '{type_name}' (rule {rule})")]
    #[diagnostic(code(jkbuild::compiler::unregistered))]
    NoCompiler {
        /// Requested output format.
        format: String,
        /// Rule type tag.
        type_name: String,
        /// Qualified name of the rule being compiled.
        rule: String,
    },

    /// A rule declaration has a missing, unknown, or ill-typed attribute.
    #[error("{rule}: attribute '{attribute}' {reason}")]
    #[diagnostic(code(jkbuild::model::attribute))]
    InvalidAttribute {
        /// Rule (or file) carrying the attribute.
        rule: String,
        /// Attribute name.
        attribute: String,
        /// Description of the problem.
        reason: String,
    },

    /// The front-end reported a rule constructor nobody knows.
    #[error("unknown rule type '{type_name}' in {path}")]
    #[diagnostic(
        code(jkbuild::model::unknown_type),
        help("supported types: cc_library, cc_binary, cc_test, external_project, shell_script")
    )]
    UnknownRuleType {
        /// The unrecognised constructor name.
        type_name: String,
        /// Declaring file.
        path: Utf8PathBuf,
    },

    /// A source pattern could not be expanded.
    #[error("invalid source pattern '{pattern}' in {rule}: {reason}")]
    #[diagnostic(code(jkbuild::prepare::pattern))]
    Pattern {
        /// Qualified name of the rule.
        rule: String,
        /// The pattern as declared.
        pattern: String,
        /// Expander diagnostic.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    #[diagnostic(code(jkbuild::config))]
    Config(String),

    /// A worker pool task failed to complete.
    #[error(transparent)]
    #[diagnostic(code(jkbuild::pool))]
    WorkerPool(#[from] PoolError),

    /// Formatting generated text failed.
    #[error("failed to format generated output")]
    #[diagnostic(code(jkbuild::writer::format))]
    Format(#[from] std::fmt::Error),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    #[diagnostic(code(jkbuild::internal))]
    Internal(String),
}

impl BuildError {
    /// Build an [`BuildError::Io`] for `path`.
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
