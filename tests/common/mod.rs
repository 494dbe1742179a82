//! Shared helpers for integration tests.
//!
//! Integration tests under `tests/` compile as independent crates. This module
//! is included via `mod common;` in individual test files to share fixtures.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use rstest::fixture;
use std::fs;

pub const LIB_BUILD: &str = "\
- cc_library:
    name: base
    srcs: ['*.cc']
    headers: ['*.h']
    include: [inc1]
    defines: [D1]
    ldflags: [-lm]
";

pub const APP_BUILD: &str = "\
- cc_binary:
    name: app
    srcs: [main.cc]
    include: [inc2]
    deps: ['//lib:base']
- cc_test:
    name: app_test
    srcs: [app_test.cc]
    deps: ['//lib:base']
    args: [--quick]
";

/// A project on disk with `lib/` and `app/` packages.
pub struct Project {
    _dir: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

impl Project {
    /// Write `contents` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {parent}"))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {path}"))
    }
}

/// Fixture: a two-package project with sources.
#[fixture]
pub fn project() -> Result<Project> {
    let dir = tempfile::tempdir().context("create temp project")?;
    let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize()?)
        .map_err(|p| anyhow::anyhow!("non UTF-8 temp dir {}", p.display()))?;
    let project = Project { _dir: dir, root };
    project.write("lib/BUILD", LIB_BUILD)?;
    project.write("lib/base.cc", "int base() { return 1; }\n")?;
    project.write("lib/base.h", "int base();\n")?;
    project.write("app/BUILD", APP_BUILD)?;
    project.write("app/main.cc", "int main() { return 0; }\n")?;
    project.write("app/app_test.cc", "int main() { return 0; }\n")?;
    Ok(project)
}
