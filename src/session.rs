//! Per-run configuration shared by every pipeline stage.
//!
//! A [`Session`] is assembled once from a [`BuildConfig`] and passed by
//! reference through loading, linking, preparation and compilation. It owns
//! the worker pool and the pluggable collaborators: the script front-end, the
//! pattern expander and the compiler registry.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compiler::CompilerRegistry;
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::expand::{GlobExpander, PatternExpander};
use crate::frontend::{ScriptFrontend, YamlFrontend};
use crate::id::normalize_package;
use crate::pool::{WorkerPool, default_concurrency};

/// Prefix marking packages loaded from the builtin rule tree.
pub const BUILTIN_PREFIX: &str = "##";

/// A named build configuration every rule is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BuildType {
    /// Unoptimised build with debug info.
    Debug,
    /// Optimised build without assertions.
    Release,
    /// Optimised build instrumented for `gprof`.
    Profiling,
}

impl BuildType {
    /// Every supported build type.
    pub const ALL: [Self; 3] = [Self::Debug, Self::Release, Self::Profiling];

    /// Upper-case name, used as the per-type output directory.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Release => "RELEASE",
            Self::Profiling => "PROFILING",
        }
    }

    /// Lower-case name, used as the aggregate make target.
    #[must_use]
    pub const fn target_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
            Self::Profiling => "profiling",
        }
    }

    /// Compiler flags implied by the build type.
    #[must_use]
    pub const fn flags(self) -> &'static [&'static str] {
        match self {
            Self::Debug => &["-g", "-O0"],
            Self::Release => &["-O2", "-DNDEBUG"],
            Self::Profiling => &["-O2", "-g", "-pg"],
        }
    }

    /// Parse a build type name, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                BuildError::Config(format!(
                    "unknown build type '{name}' (expected DEBUG, RELEASE or PROFILING)"
                ))
            })
    }
}

impl TryFrom<String> for BuildType {
    type Error = BuildError;

    fn try_from(name: String) -> Result<Self> {
        Self::parse(&name)
    }
}

impl FromStr for BuildType {
    type Err = BuildError;

    fn from_str(name: &str) -> Result<Self> {
        Self::parse(name)
    }
}

impl From<BuildType> for String {
    fn from(build_type: BuildType) -> Self {
        build_type.name().to_owned()
    }
}

impl Display for BuildType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// External tools invoked by generated recipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Toolchain {
    /// C compiler.
    pub cc: String,
    /// C++ compiler, also used as the linker.
    pub cxx: String,
    /// Static archiver.
    pub ar: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            cc: "cc".to_owned(),
            cxx: "c++".to_owned(),
            ar: "ar".to_owned(),
        }
    }
}

/// Where packages live on disk and where generated output goes.
///
/// Paths handed to generated scripts are relative to the project root;
/// paths used for reading files are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    project_root: Utf8PathBuf,
    build_root: Utf8PathBuf,
    build_file_name: String,
    builtin_root: Option<Utf8PathBuf>,
}

impl ProjectLayout {
    /// Describe a project tree.
    #[must_use]
    pub fn new(
        project_root: impl Into<Utf8PathBuf>,
        build_root: impl Into<Utf8PathBuf>,
        build_file_name: impl Into<String>,
        builtin_root: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            build_root: build_root.into(),
            build_file_name: build_file_name.into(),
            builtin_root,
        }
    }

    /// Absolute project root.
    #[must_use]
    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    /// Output directory, relative to the project root.
    #[must_use]
    pub fn build_root(&self) -> &Utf8Path {
        &self.build_root
    }

    /// File name of rule-declaration files.
    #[must_use]
    pub fn build_file_name(&self) -> &str {
        &self.build_file_name
    }

    /// Directory of a package, relative to the project root.
    ///
    /// Builtin packages live below the builtin root; without one configured
    /// the builtin key itself is returned.
    #[must_use]
    pub fn package_dir(&self, package: &str) -> Utf8PathBuf {
        match (package.strip_prefix(BUILTIN_PREFIX), &self.builtin_root) {
            (Some(rest), Some(root)) => root.join(rest),
            (Some(rest), None) => Utf8PathBuf::from(rest),
            (None, _) => Utf8PathBuf::from(package),
        }
    }

    /// Absolute directory of a package.
    #[must_use]
    pub fn absolute_package_dir(&self, package: &str) -> Utf8PathBuf {
        self.project_root.join(self.package_dir(package))
    }

    /// Absolute path of the declaration file for `package`, or `None` for a
    /// builtin package when no builtin root is configured.
    #[must_use]
    pub fn build_file_for(&self, package: &str) -> Option<Utf8PathBuf> {
        if package.starts_with(BUILTIN_PREFIX) && self.builtin_root.is_none() {
            return None;
        }
        Some(
            self.absolute_package_dir(package)
                .join(&self.build_file_name),
        )
    }

    /// Map a declaration file given on the command line to its package key
    /// and absolute path.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] if the file lies outside the project.
    pub fn package_for_file(&self, file: &Utf8Path) -> Result<(String, Utf8PathBuf)> {
        let absolute = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.project_root.join(file)
        };
        let relative = absolute.strip_prefix(&self.project_root).map_err(|_| {
            BuildError::Config(format!(
                "{file} is outside the project root {}",
                self.project_root
            ))
        })?;
        let package = relative
            .parent()
            .map(|dir| normalize_package(&dir.as_str().replace('\\', "/")))
            .unwrap_or_default();
        Ok((package, absolute))
    }

    /// `path` relative to the project root when it lies inside it.
    #[must_use]
    pub fn relativize<'a>(&self, path: &'a Utf8Path) -> &'a Utf8Path {
        path.strip_prefix(&self.project_root).unwrap_or(path)
    }
}

/// Configuration and collaborators for one generation run.
pub struct Session {
    layout: ProjectLayout,
    build_types: Vec<BuildType>,
    formats: Vec<String>,
    toolchain: Toolchain,
    pool: WorkerPool,
    frontend: Arc<dyn ScriptFrontend>,
    expander: Arc<dyn PatternExpander>,
    registry: CompilerRegistry,
}

impl Session {
    /// Build a session rooted at `project_root` and start its worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Config`] when no build type or format is
    /// requested, or a format has no root generator, and
    /// [`BuildError::WorkerPool`] if worker threads cannot be spawned.
    pub fn new(config: &BuildConfig, project_root: impl Into<Utf8PathBuf>) -> Result<Self> {
        if config.build_types.is_empty() {
            return Err(BuildError::Config(
                "at least one build type is required".to_owned(),
            ));
        }
        if config.formats.is_empty() {
            return Err(BuildError::Config(
                "at least one output format is required".to_owned(),
            ));
        }
        let registry = CompilerRegistry::with_defaults();
        if let Some(unknown) = config.formats.iter().find(|f| !registry.has_format(f)) {
            return Err(BuildError::Config(format!(
                "unknown output format '{unknown}' (known: {})",
                registry.formats().join(", ")
            )));
        }

        let mut build_types = config.build_types.clone();
        build_types.sort();
        build_types.dedup();
        let mut formats = Vec::new();
        for format in &config.formats {
            if !formats.contains(format) {
                formats.push(format.clone());
            }
        }

        let jobs = config.jobs.unwrap_or_else(default_concurrency);
        let pool = WorkerPool::new(jobs);
        pool.start()?;
        debug!(jobs = pool.size(), ?build_types, ?formats, "session created");

        Ok(Self {
            layout: ProjectLayout::new(
                project_root,
                config.build_root.clone(),
                config.build_file.clone(),
                config.builtin_root.clone(),
            ),
            build_types,
            formats,
            toolchain: config.toolchain.clone(),
            pool,
            frontend: Arc::new(YamlFrontend),
            expander: Arc::new(GlobExpander),
            registry,
        })
    }

    /// Replace the script front-end.
    #[must_use]
    pub fn with_frontend(mut self, frontend: Arc<dyn ScriptFrontend>) -> Self {
        self.frontend = frontend;
        self
    }

    /// Replace the pattern expander.
    #[must_use]
    pub fn with_expander(mut self, expander: Arc<dyn PatternExpander>) -> Self {
        self.expander = expander;
        self
    }

    /// Replace the compiler registry.
    #[must_use]
    pub fn with_registry(mut self, registry: CompilerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Project paths.
    #[must_use]
    pub const fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Absolute project root.
    #[must_use]
    pub fn project_root(&self) -> &Utf8Path {
        self.layout.project_root()
    }

    /// Output directory, relative to the project root.
    #[must_use]
    pub fn build_root(&self) -> &Utf8Path {
        self.layout.build_root()
    }

    /// Requested build types, sorted and deduplicated.
    #[must_use]
    pub fn build_types(&self) -> &[BuildType] {
        &self.build_types
    }

    /// Requested output formats, in request order.
    #[must_use]
    pub fn formats(&self) -> &[String] {
        &self.formats
    }

    /// Tools used by generated recipes.
    #[must_use]
    pub const fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// The shared worker pool.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The script front-end.
    #[must_use]
    pub fn frontend(&self) -> Arc<dyn ScriptFrontend> {
        Arc::clone(&self.frontend)
    }

    /// The pattern expander.
    #[must_use]
    pub fn expander(&self) -> Arc<dyn PatternExpander> {
        Arc::clone(&self.expander)
    }

    /// The compiler registry.
    #[must_use]
    pub const fn registry(&self) -> &CompilerRegistry {
        &self.registry
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("layout", &self.layout)
            .field("build_types", &self.build_types)
            .field("formats", &self.formats)
            .field("jobs", &self.pool.size())
            .finish_non_exhaustive()
    }
}
