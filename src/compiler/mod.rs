//! Compiler dispatch.
//!
//! A compiler turns one prepared rule into generated build-script text for a
//! single output format. The [`CompilerRegistry`] maps `(format, type_name)`
//! pairs to compilers and tells apart three outcomes:
//!
//! - [`Dispatch::Found`]: a compiler produces output for the rule.
//! - [`Dispatch::ExplicitNoop`]: the rule type is registered as inert for the
//!   format, so nothing is generated.
//! - [`Dispatch::Unregistered`]: nobody claimed the pair, which is fatal.
//!
//! After every rule has been compiled, the format's [`RootGenerator`] emits
//! the top-level script tying the per-rule fragments together.

pub mod compdb;
pub mod makefile;

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::analyzer::SccTable;
use crate::error::{BuildError, Result};
use crate::model::{BuildRule, RuleId};
use crate::prepare::{PreparedGraph, ResolvedRule, SourceFile, object_path};
use crate::session::{BuildType, Session};
use crate::writer::GeneratedFiles;

/// Name of the Makefile output format.
pub const MAKEFILE_FORMAT: &str = "makefile";
/// Name of the JSON compilation database format.
pub const COMPILE_COMMANDS_FORMAT: &str = "compile_commands";

const CC_TYPES: [&str; 3] = ["cc_library", "cc_binary", "cc_test"];

/// Everything a compiler may read while generating output.
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    /// The run's session.
    pub session: &'a Session,
    /// Prepared rules.
    pub graph: &'a PreparedGraph,
    /// Strongly connected components of the rule graph.
    pub sccs: &'a SccTable,
    /// Rules in emission order, dependencies first.
    pub order: &'a [RuleId],
    /// Output sink.
    pub files: &'a GeneratedFiles,
}

impl CompileContext<'_> {
    /// Rule and preparation result for `id`.
    #[must_use]
    pub fn rule(&self, id: RuleId) -> (&BuildRule, &ResolvedRule) {
        (self.graph.rule(id), self.graph.resolved(id))
    }

    /// Exported files of every transitive dependency of `id`.
    #[must_use]
    pub fn dependency_artifacts(&self, id: RuleId, build_type: BuildType) -> Vec<Utf8PathBuf> {
        let mut artifacts = Vec::new();
        for dep in &self.graph.resolved(id).dependency_order {
            for file in self.graph.resolved(*dep).artifacts_for(build_type) {
                if !artifacts.contains(file) {
                    artifacts.push(file.clone());
                }
            }
        }
        artifacts
    }

    /// The command compiling `source` of rule `id` for `build_type`.
    #[must_use]
    pub fn compile_command(
        &self,
        id: RuleId,
        source: &SourceFile,
        build_type: BuildType,
    ) -> CompileCommand {
        let (rule, resolved) = self.rule(id);
        let toolchain = self.session.toolchain();
        let (compiler, own_flags) = match rule.cc() {
            Some(attrs) if source.is_c() => (toolchain.cc.clone(), attrs.cflags.as_slice()),
            Some(attrs) => (toolchain.cxx.clone(), attrs.cxxflags.as_slice()),
            None => (toolchain.cxx.clone(), &[][..]),
        };
        let object = object_path(rule, self.session.build_root(), build_type, source);
        let mut arguments = vec![compiler];
        arguments.extend(build_type.flags().iter().map(|f| (*f).to_owned()));
        arguments.extend(resolved.includes.iter().cloned());
        arguments.extend(resolved.defines.iter().cloned());
        arguments.extend(own_flags.iter().cloned());
        arguments.extend([
            "-c".to_owned(),
            source.path.to_string(),
            "-o".to_owned(),
            object.to_string(),
        ]);
        CompileCommand {
            source: source.path.clone(),
            object,
            arguments,
        }
    }
}

/// One compiler invocation, shared by the Makefile and database generators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    /// Source file, relative to the project root.
    pub source: Utf8PathBuf,
    /// Object file, relative to the project root.
    pub object: Utf8PathBuf,
    /// Program followed by its arguments.
    pub arguments: Vec<String>,
}

/// Generates output for one rule.
pub trait Compiler: Send + Sync {
    /// Emit the files for `rule` through `ctx.files`.
    ///
    /// # Errors
    ///
    /// Returns an error if output cannot be produced.
    fn compile(&self, ctx: &CompileContext<'_>, rule: RuleId) -> Result<()>;
}

/// Generates the top-level file of a format.
pub trait RootGenerator: Send + Sync {
    /// Emit the root file(s) once every rule has been compiled.
    ///
    /// # Errors
    ///
    /// Returns an error if output cannot be produced.
    fn generate(&self, ctx: &CompileContext<'_>) -> Result<()>;
}

#[derive(Clone)]
enum Registration {
    Compiler(Arc<dyn Compiler>),
    Nop,
}

/// Result of a registry lookup.
pub enum Dispatch<'a> {
    /// A compiler is registered.
    Found(&'a dyn Compiler),
    /// The pair is registered as producing nothing.
    ExplicitNoop,
    /// Nothing is registered for the pair.
    Unregistered,
}

/// Maps `(format, type_name)` to compilers and formats to root generators.
#[derive(Clone, Default)]
pub struct CompilerRegistry {
    compilers: HashMap<(String, String), Registration>,
    roots: HashMap<String, Arc<dyn RootGenerator>>,
}

impl CompilerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Makefile and compilation database generators.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let cc: Arc<dyn Compiler> = Arc::new(makefile::CcCompiler);
        for type_name in CC_TYPES {
            registry.register(MAKEFILE_FORMAT, type_name, Arc::clone(&cc));
        }
        registry.register(
            MAKEFILE_FORMAT,
            "external_project",
            Arc::new(makefile::ExternalProjectCompiler),
        );
        registry.register(
            MAKEFILE_FORMAT,
            "shell_script",
            Arc::new(makefile::ShellScriptCompiler),
        );
        registry.register_root(MAKEFILE_FORMAT, Arc::new(makefile::RootMakefile));

        let compdb: Arc<dyn Compiler> = Arc::new(compdb::CcCompileDb);
        for type_name in CC_TYPES {
            registry.register(COMPILE_COMMANDS_FORMAT, type_name, Arc::clone(&compdb));
        }
        registry.register_nop(COMPILE_COMMANDS_FORMAT, "external_project");
        registry.register_nop(COMPILE_COMMANDS_FORMAT, "shell_script");
        registry.register_root(COMPILE_COMMANDS_FORMAT, Arc::new(compdb::RootCompileDb));
        registry
    }

    /// Register `compiler` for `(format, type_name)`.
    pub fn register(&mut self, format: &str, type_name: &str, compiler: Arc<dyn Compiler>) {
        self.compilers.insert(
            (format.to_owned(), type_name.to_owned()),
            Registration::Compiler(compiler),
        );
    }

    /// Declare that `type_name` produces nothing for `format`.
    pub fn register_nop(&mut self, format: &str, type_name: &str) {
        self.compilers
            .insert((format.to_owned(), type_name.to_owned()), Registration::Nop);
    }

    /// Register the root generator of `format`.
    pub fn register_root(&mut self, format: &str, generator: Arc<dyn RootGenerator>) {
        self.roots.insert(format.to_owned(), generator);
    }

    /// Look up the compiler for `(format, type_name)`.
    #[must_use]
    pub fn find(&self, format: &str, type_name: &str) -> Dispatch<'_> {
        match self
            .compilers
            .get(&(format.to_owned(), type_name.to_owned()))
        {
            Some(Registration::Compiler(compiler)) => Dispatch::Found(compiler.as_ref()),
            Some(Registration::Nop) => Dispatch::ExplicitNoop,
            None => Dispatch::Unregistered,
        }
    }

    /// Whether `format` has a root generator.
    #[must_use]
    pub fn has_format(&self, format: &str) -> bool {
        self.roots.contains_key(format)
    }

    /// Known formats, sorted.
    #[must_use]
    pub fn formats(&self) -> Vec<&str> {
        let mut formats: Vec<&str> = self.roots.keys().map(String::as_str).collect();
        formats.sort_unstable();
        formats
    }

    fn root(&self, format: &str) -> Option<&dyn RootGenerator> {
        self.roots.get(format).map(|root| &**root)
    }
}

/// Run every requested format's compilers over `order`, then its root
/// generator.
///
/// # Errors
///
/// Returns [`BuildError::Cycle`] before emitting anything if any component
/// of `ctx.sccs` is cyclic, [`BuildError::NoCompiler`] for an unregistered
/// `(format, type)` pair, or the first error a compiler reports.
pub fn compile_all(ctx: &CompileContext<'_>) -> Result<()> {
    ctx.sccs.ensure_acyclic(ctx.graph.graph())?;
    let registry = ctx.session.registry();
    for format in ctx.session.formats() {
        let mut compiled = 0_usize;
        for &id in ctx.order {
            let rule = ctx.graph.rule(id);
            match registry.find(format, rule.type_name()) {
                Dispatch::Found(compiler) => {
                    compiler.compile(ctx, id)?;
                    compiled += 1;
                }
                Dispatch::ExplicitNoop => {
                    debug!(rule = %rule, format = %format, "no output for rule type");
                }
                Dispatch::Unregistered => {
                    return Err(BuildError::NoCompiler {
                        format: format.clone(),
                        type_name: rule.type_name().to_owned(),
                        rule: rule.full_qualified_name().to_owned(),
                    });
                }
            }
        }
        let root = registry.root(format).ok_or_else(|| {
            BuildError::Config(format!("no root generator for format '{format}'"))
        })?;
        root.generate(ctx)?;
        info!(format = %format, rules = compiled, "generated output");
    }
    Ok(())
}
