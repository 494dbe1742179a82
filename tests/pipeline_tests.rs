//! End-to-end generation over projects on disk.

mod common;

use anyhow::{Context, Result, ensure};
use camino::Utf8PathBuf;
use common::{Project, project};
use jkbuild::config::BuildConfig;
use jkbuild::error::BuildError;
use jkbuild::pipeline::generate;
use jkbuild::session::Session;
use jkbuild::writer::GeneratedFiles;
use rstest::rstest;
use serde_json::Value as JsonValue;

fn run(project: &Project, formats: &[&str], jobs: usize) -> Result<GeneratedFiles> {
    let config = BuildConfig {
        formats: formats.iter().map(|f| (*f).to_owned()).collect(),
        jobs: Some(jobs),
        ..BuildConfig::default()
    };
    let session = Session::new(&config, project.root.clone())?;
    Ok(generate(&session, &[Utf8PathBuf::from("app/BUILD")])?)
}

fn arguments_for(database: &str, file: &str) -> Result<Vec<String>> {
    let entries: Vec<JsonValue> = serde_json::from_str(database).context("parse database")?;
    let entry = entries
        .iter()
        .find(|e| e.get("file").and_then(JsonValue::as_str) == Some(file))
        .with_context(|| format!("no entry for {file}"))?;
    let args = entry
        .get("arguments")
        .and_then(JsonValue::as_array)
        .context("arguments array")?;
    Ok(args
        .iter()
        .filter_map(|a| a.as_str().map(str::to_owned))
        .collect())
}

#[rstest]
fn dependency_flags_precede_own_flags(project: Result<Project>) -> Result<()> {
    let project = project?;
    let files = run(&project, &["compile_commands"], 4)?;
    let database = files
        .get("build/compile_commands.json")
        .context("root database")?;
    let args = arguments_for(&database, "app/main.cc")?;
    let includes: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| a.starts_with("-I"))
        .collect();
    ensure!(includes == ["-Iinc1", "-Iinc2"], "includes were {includes:?}");
    ensure!(args.iter().any(|a| a == "-DD1"), "define missing: {args:?}");
    Ok(())
}

#[rstest]
fn makefile_targets_link_dependency_archives(project: Result<Project>) -> Result<()> {
    let project = project?;
    let files = run(&project, &["makefile"], 2)?;
    let fragment = files
        .get("build/app@@app@DEFAULT.mk")
        .context("app fragment")?;
    let link = fragment
        .lines()
        .find(|l| l.contains("-o build/app@@app@DEFAULT/DEBUG/app "))
        .context("link line")?;
    ensure!(
        link.contains("build/lib@@base@DEFAULT/DEBUG/libbase.a") && link.ends_with("-lm"),
        "unexpected link line: {link}"
    );

    let root = files.get("build/Makefile").context("root makefile")?;
    ensure!(
        root.contains("\tbuild/app@@app_test@DEFAULT/DEBUG/app_test --quick\n"),
        "test target missing:\n{root}"
    );
    ensure!(
        root.contains("build/Makefile: app/BUILD lib/BUILD\n"),
        "regeneration rule missing:\n{root}"
    );
    Ok(())
}

#[rstest]
fn output_is_identical_across_runs(project: Result<Project>) -> Result<()> {
    let project = project?;
    let formats = ["makefile", "compile_commands"];
    let first = run(&project, &formats, 1)?;
    let second = run(&project, &formats, 8)?;
    ensure!(first.paths() == second.paths(), "file sets differ");
    for path in first.paths() {
        ensure!(first.get(&path) == second.get(&path), "{path} differs");
    }
    Ok(())
}

#[rstest]
fn commit_skips_files_that_did_not_change(project: Result<Project>) -> Result<()> {
    let project = project?;
    let first = run(&project, &["makefile"], 2)?.commit(&project.root)?;
    ensure!(first.written > 0 && first.unchanged == 0, "{first:?}");
    ensure!(project.root.join("build/Makefile").is_file(), "Makefile not written");
    let second = run(&project, &["makefile"], 2)?.commit(&project.root)?;
    ensure!(second.written == 0, "{second:?}");
    Ok(())
}

#[rstest]
fn missing_dependency_names_the_rule(project: Result<Project>) -> Result<()> {
    let project = project?;
    project.write(
        "app/BUILD",
        "- cc_binary: {name: app, deps: ['//lib:nope']}\n",
    )?;
    let err = run(&project, &["makefile"], 2).expect_err("missing dependency");
    let Some(BuildError::DependencyNotFound { rule, target }) = err.downcast_ref::<BuildError>()
    else {
        anyhow::bail!("unexpected error: {err:#}");
    };
    ensure!(rule == "app/app@DEFAULT", "rule was {rule}");
    ensure!(target == "//lib:nope", "target was {target}");
    ensure!(
        !project.root.join("build").exists(),
        "nothing may be written on failure"
    );
    Ok(())
}

#[rstest]
fn missing_package_names_the_rule(project: Result<Project>) -> Result<()> {
    let project = project?;
    project.write(
        "app/BUILD",
        "- cc_binary: {name: app, deps: ['//nowhere:x']}\n",
    )?;
    let err = run(&project, &["makefile"], 2).expect_err("missing package");
    let Some(BuildError::DependencyNotFound { rule, target }) = err.downcast_ref::<BuildError>()
    else {
        anyhow::bail!("unexpected error: {err:#}");
    };
    ensure!(rule == "app/app@DEFAULT", "rule was {rule}");
    ensure!(target == "//nowhere:x", "target was {target}");
    Ok(())
}

#[rstest]
fn shared_sources_are_rejected(project: Result<Project>) -> Result<()> {
    let project = project?;
    project.write(
        "lib/BUILD",
        "- cc_library: {name: base, srcs: ['*.cc']}\n- cc_library: {name: copy, srcs: [base.cc]}\n",
    )?;
    let err = run(&project, &["makefile"], 2).expect_err("duplicate source");
    ensure!(
        matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::DuplicateSource { .. })
        ),
        "unexpected error: {err:#}"
    );
    Ok(())
}

#[rstest]
fn sources_reached_through_parent_directories_keep_one_owner(
    project: Result<Project>,
) -> Result<()> {
    let project = project?;
    project.write(
        "app/BUILD",
        "- cc_library: {name: thief, srcs: ['../lib/base.cc'], deps: ['//lib:base']}\n",
    )?;
    let err = run(&project, &["makefile"], 2).expect_err("shared source");
    let Some(BuildError::DuplicateSource {
        path,
        first,
        second,
    }) = err.downcast_ref::<BuildError>()
    else {
        anyhow::bail!("unexpected error: {err:#}");
    };
    ensure!(path.as_str() == "lib/base.cc", "path was {path}");
    ensure!(
        first == "app/thief@DEFAULT" && second == "lib/base@DEFAULT",
        "owners were {first} and {second}"
    );
    Ok(())
}

#[rstest]
fn sources_outside_the_project_are_rejected(project: Result<Project>) -> Result<()> {
    let project = project?;
    let outside = tempfile::tempdir().context("create outside dir")?;
    let outside_root = Utf8PathBuf::from_path_buf(outside.path().canonicalize()?)
        .map_err(|p| anyhow::anyhow!("non UTF-8 temp dir {}", p.display()))?;
    std::fs::write(outside_root.join("stray.cc"), "").context("write outside source")?;
    let name = outside_root.file_name().context("outside dir name")?;
    project.write(
        "app/BUILD",
        &format!("- cc_library: {{name: app, srcs: ['../../{name}/stray.cc']}}\n"),
    )?;
    let err = run(&project, &["makefile"], 2).expect_err("escaping source");
    ensure!(
        matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::SourceOutsideProject { .. })
        ),
        "unexpected error: {err:#}"
    );
    Ok(())
}
