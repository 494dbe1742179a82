//! Layered run configuration.
//!
//! Values come from four layers, later ones winning: built-in defaults, an
//! optional `jkbuild.yml` at the project root, `JK_`-prefixed environment
//! variables, and command-line overrides. The layers are composed with
//! `ortho_config`'s [`MergeComposer`].
//!
//! ```yaml
//! build_root: out
//! build_types: [DEBUG, PROFILING]
//! formats: [makefile, compile_commands]
//! toolchain:
//!   cxx: clang++
//! ```
//!
//! Nested keys are reachable from the environment with a double underscore,
//! for example `JK_TOOLCHAIN__CXX=clang++`.

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::figment::{Figment, providers::Env};
use ortho_config::{MergeComposer, OrthoConfig, sanitize_value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BuildError, Result};
use crate::session::{BuildType, Toolchain};

/// Name of the optional project configuration file.
pub const CONFIG_FILE_NAME: &str = "jkbuild.yml";

const ENV_PREFIX: &str = "JK_";

/// Resolved configuration used to build a [`crate::session::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "JK")]
pub struct BuildConfig {
    /// Output directory, relative to the project root.
    #[ortho_config(default = default_build_root())]
    pub build_root: Utf8PathBuf,
    /// Build types to generate.
    #[ortho_config(merge_strategy = "replace")]
    pub build_types: Vec<BuildType>,
    /// Output formats to generate.
    #[ortho_config(merge_strategy = "replace")]
    pub formats: Vec<String>,
    /// Worker threads; `None` uses the available parallelism.
    pub jobs: Option<usize>,
    /// File name of rule-declaration files.
    #[ortho_config(default = default_build_file())]
    pub build_file: String,
    /// Directory holding builtin (`##`) packages.
    pub builtin_root: Option<Utf8PathBuf>,
    /// Tools used in generated recipes.
    #[ortho_config(skip_cli)]
    pub toolchain: Toolchain,
}

fn default_build_root() -> Utf8PathBuf {
    Utf8PathBuf::from("build")
}

fn default_build_file() -> String {
    "BUILD".to_owned()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_root: default_build_root(),
            build_types: vec![BuildType::Debug, BuildType::Release],
            formats: vec!["makefile".to_owned()],
            jobs: None,
            build_file: default_build_file(),
            builtin_root: None,
            toolchain: Toolchain::default(),
        }
    }
}

/// Shape of `jkbuild.yml`. Every key is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    build_root: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_types: Option<Vec<BuildType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    formats: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    builtin_root: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    toolchain: Option<Toolchain>,
}

/// Values supplied on the command line. Unset values leave lower layers
/// alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigOverrides {
    /// `--build-root`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_root: Option<Utf8PathBuf>,
    /// `--build-type`, repeatable.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_types: Vec<String>,
    /// `--format`, repeatable.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<String>,
    /// `-j`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
}

impl BuildConfig {
    /// Compose every configuration layer for `project_root`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] if `jkbuild.yml` exists but cannot be read
    /// and [`BuildError::Config`] if any layer is malformed or the merged
    /// values are invalid.
    pub fn load(project_root: &Utf8Path, overrides: &ConfigOverrides) -> Result<Self> {
        let file = read_file(project_root)?;
        let environment = Figment::from(Env::prefixed(ENV_PREFIX).split("__"))
            .extract::<serde_json::Value>()
            .map_err(|e| BuildError::Config(format!("environment: {e}")))?;
        Self::compose(file, environment, overrides)
    }

    /// Merge the defaults with the given file, environment and CLI layers.
    fn compose(
        file: Option<FileConfig>,
        environment: serde_json::Value,
        overrides: &ConfigOverrides,
    ) -> Result<Self> {
        let mut composer = MergeComposer::with_capacity(4);
        composer.push_defaults(sanitize(&Self::default())?);
        if let Some(file) = file {
            composer.push_file(sanitize(&file)?, None);
        }
        if !is_empty_value(&environment) {
            composer.push_environment(environment);
        }
        let cli = sanitize(overrides)?;
        if !is_empty_value(&cli) {
            composer.push_cli(cli);
        }
        let config = Self::merge_from_layers(composer.layers())
            .map_err(|e| BuildError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.jobs == Some(0) {
            return Err(BuildError::Config("jobs must be at least 1".to_owned()));
        }
        if self.build_types.is_empty() {
            return Err(BuildError::Config(
                "at least one build type is required".to_owned(),
            ));
        }
        if self.build_file.is_empty() || self.build_file.contains('/') {
            return Err(BuildError::Config(format!(
                "build_file must be a plain file name, got '{}'",
                self.build_file
            )));
        }
        Ok(())
    }
}

/// Parse `jkbuild.yml` from `project_root`, if present.
fn read_file(project_root: &Utf8Path) -> Result<Option<FileConfig>> {
    let path = project_root.join(CONFIG_FILE_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let source = std::fs::read_to_string(&path).map_err(|source| BuildError::io(&path, source))?;
    let file = parse_file(&source, &path)?;
    debug!(%path, "loaded configuration file");
    Ok(Some(file))
}

fn parse_file(source: &str, path: &Utf8Path) -> Result<FileConfig> {
    if source.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_saphyr::from_str(source).map_err(|e| BuildError::Config(format!("{path}: {e}")))
}

fn sanitize<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    sanitize_value(value).map_err(|e| BuildError::Config(e.to_string()))
}

/// An empty object carries no overrides.
fn is_empty_value(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn from_yaml(source: &str) -> Result<BuildConfig> {
        let file = parse_file(source, Utf8Path::new("jkbuild.yml"))?;
        BuildConfig::compose(Some(file), json!({}), &ConfigOverrides::default())
    }

    #[rstest]
    fn empty_file_keeps_defaults() {
        assert_eq!(from_yaml("").expect("valid"), BuildConfig::default());
    }

    #[rstest]
    fn file_values_override_defaults() {
        let config = from_yaml(concat!(
            "build_root: out\n",
            "build_types: [profiling]\n",
            "formats: [makefile, compile_commands]\n",
            "jobs: 3\n",
            "toolchain:\n",
            "  cxx: clang++\n",
        ))
        .expect("valid");
        assert_eq!(config.build_root, Utf8PathBuf::from("out"));
        assert_eq!(config.build_types, vec![BuildType::Profiling]);
        assert_eq!(config.formats, vec!["makefile", "compile_commands"]);
        assert_eq!(config.jobs, Some(3));
        assert_eq!(config.toolchain.cxx, "clang++");
        assert_eq!(config.toolchain.cc, "cc");
    }

    #[rstest]
    #[case("bogus: 1\n")]
    #[case("build_types: [turbo]\n")]
    #[case("jobs: 0\n")]
    #[case("build_file: a/BUILD\n")]
    fn rejects_invalid_files(#[case] source: &str) {
        assert!(matches!(from_yaml(source), Err(BuildError::Config(_))));
    }

    #[rstest]
    fn later_layers_win() {
        let file = parse_file(
            "build_root: out\njobs: 2\nformats: [compile_commands]\n",
            Utf8Path::new("jkbuild.yml"),
        )
        .expect("valid file");
        let environment = json!({ "jobs": 5, "build_types": ["PROFILING"] });
        let config = BuildConfig::compose(
            Some(file),
            environment,
            &ConfigOverrides {
                build_root: Some(Utf8PathBuf::from("gen")),
                build_types: vec!["RELEASE".to_owned()],
                formats: Vec::new(),
                jobs: None,
            },
        )
        .expect("valid layers");
        assert_eq!(config.build_root, Utf8PathBuf::from("gen"));
        assert_eq!(config.build_types, vec![BuildType::Release]);
        assert_eq!(config.formats, vec!["compile_commands"]);
        assert_eq!(config.jobs, Some(5));
    }

    #[rstest]
    fn environment_reaches_nested_keys() {
        let config = BuildConfig::compose(
            None,
            json!({ "toolchain": { "cxx": "clang++" } }),
            &ConfigOverrides::default(),
        )
        .expect("valid environment");
        assert_eq!(config.toolchain.cxx, "clang++");
        assert_eq!(config.toolchain.ar, "ar");
    }

    #[rstest]
    fn unknown_override_build_type_is_rejected() {
        let result = BuildConfig::compose(
            None,
            json!({}),
            &ConfigOverrides {
                build_types: vec!["fast".to_owned()],
                ..ConfigOverrides::default()
            },
        );
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[rstest]
    fn missing_file_reads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf8 tempdir");
        assert!(read_file(root).expect("no file").is_none());
    }
}
