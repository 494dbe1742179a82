//! CLI execution and command dispatch logic.
//!
//! This module keeps `main` minimal by providing a single entry point that
//! handles command execution. `gen` assembles a [`Session`] from the layered
//! configuration, runs the generation pipeline, and commits the result below
//! the project root.

use std::io::{self, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::cli::{Cli, Color, Commands, GenArgs};
use crate::config::{BuildConfig, ConfigOverrides};
use crate::pipeline;
use crate::session::Session;

/// Execute the parsed [`Cli`] commands.
///
/// # Errors
///
/// Returns an error if configuration, generation, or a helper command fails.
pub fn run(cli: &Cli) -> Result<()> {
    let base = base_directory(cli)?;
    let command = cli
        .command
        .clone()
        .unwrap_or_else(|| Commands::Gen(GenArgs::default()));
    match command {
        Commands::Gen(args) => generate(&base, cli.jobs, &args),
        Commands::Version => {
            writeln!(io::stdout().lock(), "jk {}", env!("CARGO_PKG_VERSION"))
                .context("writing version")?;
            Ok(())
        }
        Commands::DeleteFile { paths } => {
            for path in paths {
                delete(&base.join(path))?;
            }
            Ok(())
        }
        Commands::EchoColor { color, text } => {
            echo_color(color, &text.join(" ")).context("writing to stdout")?;
            Ok(())
        }
    }
}

/// The directory commands operate in: `-C DIR` or the working directory.
fn base_directory(cli: &Cli) -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir().context("reading the working directory")?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| anyhow::anyhow!("working directory {} is not UTF-8", p.display()))?;
    let base = match &cli.directory {
        Some(dir) => cwd.join(dir),
        None => cwd,
    };
    base.canonicalize_utf8()
        .with_context(|| format!("resolving project root {base}"))
}

fn generate(project_root: &Utf8Path, jobs: Option<usize>, args: &GenArgs) -> Result<()> {
    let overrides = ConfigOverrides {
        build_root: args.build_root.clone(),
        build_types: args.build_types.clone(),
        formats: args.formats.clone(),
        jobs,
    };
    let config = BuildConfig::load(project_root, &overrides)
        .with_context(|| format!("loading configuration in {project_root}"))?;
    let session = Session::new(&config, project_root).context("starting session")?;

    let roots = if args.files.is_empty() {
        vec![Utf8PathBuf::from(&config.build_file)]
    } else {
        args.files.clone()
    };
    debug!(?roots, "generating");
    let files = pipeline::generate(&session, &roots).context("generating build scripts")?;
    let summary = files
        .commit(project_root)
        .context("writing generated files")?;
    info!(
        written = summary.written,
        unchanged = summary.unchanged,
        "generation complete"
    );
    writeln!(
        io::stdout().lock(),
        "Generated {} files in {} ({} unchanged)",
        files.len(),
        session.build_root(),
        summary.unchanged
    )
    .context("writing summary")?;
    Ok(())
}

/// Remove a file or directory tree. Missing paths are not an error.
fn delete(path: &Utf8Path) -> Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(anyhow::Error::new(err).context(format!("deleting {path}")))
        }
        _ => {
            debug!(%path, "deleted");
            Ok(())
        }
    }
}

fn echo_color(color: Color, text: &str) -> io::Result<()> {
    writeln!(
        io::stdout().lock(),
        "\x1b[{}m{text}\x1b[0m",
        color.ansi_code()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn delete_removes_trees_and_ignores_missing_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let tree = root.join("build/pkg@@a@DEFAULT/DEBUG");
        std::fs::create_dir_all(&tree).expect("mkdir");
        std::fs::write(tree.join("liba.a"), "x").expect("write");
        delete(&root.join("build/pkg@@a@DEFAULT")).expect("delete tree");
        assert!(!root.join("build/pkg@@a@DEFAULT").exists());
        delete(&root.join("missing")).expect("missing is fine");
    }
}
