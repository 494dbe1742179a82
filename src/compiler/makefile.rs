//! Makefile generation.
//!
//! Each rule compiles to a fragment `<build_root>/<quoted name>.mk`; the
//! root `<build_root>/Makefile` includes every fragment and adds the
//! aggregate targets. All paths are relative to the project root, so the
//! result is meant to be run from there with `make -f <build_root>/Makefile`.
//!
//! Text is produced through small [`Display`] wrappers so each construct is
//! rendered in one place.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;

use super::{CompileContext, Compiler, Dispatch, MAKEFILE_FORMAT, RootGenerator};
use crate::error::Result;
use crate::model::{BuildRule, RuleId, RuleKind, RuleType};
use crate::prepare::{DONE_STAMP, INSTALLED_STAMP};
use crate::session::{BUILTIN_PREFIX, BuildType};
use crate::writer::Writer;

/// Name of the generated root file inside the build root.
pub const ROOT_MAKEFILE: &str = "Makefile";

const HEADER: &str = "# Generated by jk. Do not edit.";

/// Escape `text` for use in a make target or prerequisite list.
fn make_path(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '$' => out.push_str("$$"),
            ' ' | ':' | '#' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Quote one shell word and escape it for a make recipe.
fn shell_word(word: &str) -> String {
    let quoted = shlex::try_quote(word).unwrap_or(Cow::Borrowed(word));
    quoted.replace('$', "$$")
}

fn shell_line<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words.into_iter().map(|w| shell_word(w.as_ref())).join(" ")
}

/// Turn a multi-line script into one recipe line.
fn script_line(script: &str) -> String {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .join(" && ")
        .replace('$', "$$")
}

fn paths<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a Utf8PathBuf>,
{
    items.into_iter().map(|p| make_path(p.as_str())).join(" ")
}

fn mkdir(dir: &Utf8Path) -> String {
    format!("@mkdir -p {}", shell_word(dir.as_str()))
}

/// One make rule.
struct Target<'a> {
    outputs: &'a str,
    prerequisites: &'a str,
    order_only: &'a str,
    recipe: &'a [String],
}

impl Display for Target<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.outputs)?;
        if !self.prerequisites.is_empty() {
            write!(f, " {}", self.prerequisites)?;
        }
        if !self.order_only.is_empty() {
            write!(f, " | {}", self.order_only)?;
        }
        writeln!(f)?;
        for line in self.recipe {
            writeln!(f, "\t{line}")?;
        }
        writeln!(f)
    }
}

fn target<'a>(outputs: &'a str, prerequisites: &'a str, recipe: &'a [String]) -> Target<'a> {
    Target {
        outputs,
        prerequisites,
        order_only: "",
        recipe,
    }
}

/// Phony targets naming a rule: `<quoted>` and `<quoted>.<build type>`.
struct PhonyTargets<'a> {
    rule: &'a BuildRule,
    build_types: &'a [BuildType],
}

impl PhonyTargets<'_> {
    fn per_type(&self, build_type: BuildType) -> String {
        per_type_target(self.rule, build_type)
    }
}

impl Display for PhonyTargets<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = make_path(self.rule.quoted_full_qualified_name());
        let per_type = self
            .build_types
            .iter()
            .map(|&bt| self.per_type(bt))
            .join(" ");
        writeln!(f, ".PHONY: {name} {per_type}")?;
        write!(f, "{}", target(&name, &per_type, &[]))
    }
}

fn per_type_target(rule: &BuildRule, build_type: BuildType) -> String {
    make_path(&format!(
        "{}.{}",
        rule.quoted_full_qualified_name(),
        build_type.target_name()
    ))
}

fn fragment_path(ctx: &CompileContext<'_>, rule: &BuildRule) -> Utf8PathBuf {
    ctx.session
        .build_root()
        .join(format!("{}.mk", rule.quoted_full_qualified_name()))
}

fn write_header(out: &mut impl Writer, rule: &BuildRule) -> Result<()> {
    out.write_line(HEADER)?;
    writeln!(out, "# {rule} ({})", rule.type_name())?;
    out.write_line("")
}

/// Compiles `cc_library`, `cc_binary` and `cc_test` rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcCompiler;

impl Compiler for CcCompiler {
    fn compile(&self, ctx: &CompileContext<'_>, id: RuleId) -> Result<()> {
        let (rule, resolved) = ctx.rule(id);
        let build_types = ctx.session.build_types();
        let mut out = ctx.files.create(fragment_path(ctx, rule));
        write_header(&mut out, rule)?;
        let phony = PhonyTargets { rule, build_types };
        write!(out, "{phony}")?;

        for &build_type in build_types {
            let deps = ctx.dependency_artifacts(id, build_type);
            let order_only = paths(
                deps.iter()
                    .filter(|d| !d.as_str().ends_with(".a") && !d.as_str().ends_with(".so")),
            );
            let mut objects = Vec::with_capacity(resolved.sources.len());
            for source in &resolved.sources {
                let command = ctx.compile_command(id, source, build_type);
                let object_dir = command
                    .object
                    .parent()
                    .unwrap_or_else(|| Utf8Path::new("."));
                let recipe = [mkdir(object_dir), shell_line(&command.arguments)];
                let outputs = make_path(command.object.as_str());
                let prerequisites =
                    paths(std::iter::once(&command.source).chain(&resolved.headers));
                write!(
                    out,
                    "{}",
                    Target {
                        outputs: &outputs,
                        prerequisites: &prerequisites,
                        order_only: &order_only,
                        recipe: &recipe,
                    }
                )?;
                objects.push(command.object);
            }

            let artifacts = resolved.artifacts_for(build_type);
            let per_type = phony.per_type(build_type);
            if let Some(artifact) = artifacts.first() {
                let recipe = link_recipe(ctx, id, build_type, artifact, &objects);
                let outputs = make_path(artifact.as_str());
                let prerequisites = paths(objects.iter().chain(&deps));
                write!(out, "{}", target(&outputs, &prerequisites, &recipe))?;
                write!(out, "{}", target(&per_type, &outputs, &[]))?;
            } else {
                write!(out, "{}", target(&per_type, &paths(&deps), &[]))?;
            }
        }
        out.flush()
    }
}

/// Recipe producing a library archive or a linked executable.
fn link_recipe(
    ctx: &CompileContext<'_>,
    id: RuleId,
    build_type: BuildType,
    artifact: &Utf8Path,
    objects: &[Utf8PathBuf],
) -> Vec<String> {
    let (rule, resolved) = ctx.rule(id);
    let toolchain = ctx.session.toolchain();
    let dir = artifact.parent().unwrap_or_else(|| Utf8Path::new("."));
    if rule.rule_type().contains(RuleType::LIBRARY) {
        let mut args = vec![toolchain.ar.clone(), "rcs".to_owned(), artifact.to_string()];
        args.extend(objects.iter().map(ToString::to_string));
        return vec![
            mkdir(dir),
            format!("@rm -f {}", shell_word(artifact.as_str())),
            shell_line(&args),
        ];
    }

    // Dependents precede their dependencies on the link line.
    let libraries = resolved
        .dependency_order
        .iter()
        .rev()
        .flat_map(|&dep| ctx.graph.resolved(dep).artifacts_for(build_type))
        .filter(|file| file.as_str().ends_with(".a") || file.as_str().ends_with(".so"))
        .map(ToString::to_string)
        .unique();
    let mut args = vec![toolchain.cxx.clone()];
    args.extend(build_type.flags().iter().map(|f| (*f).to_owned()));
    args.extend(["-o".to_owned(), artifact.to_string()]);
    args.extend(objects.iter().map(ToString::to_string));
    args.extend(libraries);
    if let Some(attrs) = rule.cc() {
        args.extend(attrs.ldflags.iter().cloned());
    }
    args.extend(resolved.inherent_flags.iter().cloned());
    vec![mkdir(dir), shell_line(&args)]
}

/// Union of every build type's dependency artifacts.
fn all_dependency_artifacts(ctx: &CompileContext<'_>, id: RuleId) -> Vec<Utf8PathBuf> {
    ctx.session
        .build_types()
        .iter()
        .flat_map(|&bt| ctx.dependency_artifacts(id, bt))
        .unique()
        .collect()
}

/// Writes the stamp rule and per-type aliases shared by script-driven rules.
fn write_scripted(
    ctx: &CompileContext<'_>,
    id: RuleId,
    stamp: &Utf8Path,
    command: String,
    products: &[Utf8PathBuf],
) -> Result<()> {
    let rule = ctx.graph.rule(id);
    let build_types = ctx.session.build_types();
    let mut out = ctx.files.create(fragment_path(ctx, rule));
    write_header(&mut out, rule)?;
    let phony = PhonyTargets { rule, build_types };
    write!(out, "{phony}")?;

    let stamp_dir = stamp.parent().unwrap_or_else(|| Utf8Path::new("."));
    let recipe = [
        mkdir(stamp_dir),
        command,
        format!("@touch {}", shell_word(stamp.as_str())),
    ];
    let stamp_target = make_path(stamp.as_str());
    let deps = paths(&all_dependency_artifacts(ctx, id));
    write!(out, "{}", target(&stamp_target, &deps, &recipe))?;
    if !products.is_empty() {
        let outputs = paths(products);
        write!(out, "{}", target(&outputs, &stamp_target, &[]))?;
    }
    let mut everything = vec![stamp.to_path_buf()];
    everything.extend(products.iter().cloned());
    let everything = paths(&everything);
    for &build_type in build_types {
        write!(
            out,
            "{}",
            target(&phony.per_type(build_type), &everything, &[])
        )?;
    }
    out.flush()
}

/// Compiles `external_project` rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalProjectCompiler;

impl Compiler for ExternalProjectCompiler {
    fn compile(&self, ctx: &CompileContext<'_>, id: RuleId) -> Result<()> {
        let rule = ctx.graph.rule(id);
        let RuleKind::External(attrs) = rule.kind() else {
            return Ok(());
        };
        let working_folder = rule.working_folder(ctx.session.build_root());
        let stamp = working_folder.join(INSTALLED_STAMP);
        let command = format!(
            "cd {} && {}",
            shell_word(working_folder.as_str()),
            script_line(&attrs.install_script)
        );
        let exports: Vec<Utf8PathBuf> = attrs
            .exports
            .iter()
            .map(|file| working_folder.join(file))
            .collect();
        write_scripted(ctx, id, &stamp, command, &exports)
    }
}

/// Compiles `shell_script` rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellScriptCompiler;

impl Compiler for ShellScriptCompiler {
    fn compile(&self, ctx: &CompileContext<'_>, id: RuleId) -> Result<()> {
        let rule = ctx.graph.rule(id);
        let RuleKind::ShellScript(attrs) = rule.kind() else {
            return Ok(());
        };
        let layout = ctx.session.layout();
        let package_dir = layout.package_dir(rule.package());
        let stamp = rule
            .working_folder(ctx.session.build_root())
            .join(DONE_STAMP);
        let dir = if package_dir.as_str().is_empty() {
            ".".to_owned()
        } else {
            shell_word(package_dir.as_str())
        };
        let command = format!("cd {dir} && {}", script_line(&attrs.script));
        let outputs: Vec<Utf8PathBuf> = attrs
            .outputs
            .iter()
            .map(|file| package_dir.join(file))
            .collect();
        write_scripted(ctx, id, &stamp, command, &outputs)
    }
}

/// Writes `<build_root>/Makefile`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootMakefile;

impl RootMakefile {
    fn test_build_type(ctx: &CompileContext<'_>) -> BuildType {
        let types = ctx.session.build_types();
        if types.contains(&BuildType::Debug) {
            BuildType::Debug
        } else {
            types.first().copied().unwrap_or(BuildType::Debug)
        }
    }

    /// `jk gen` invocation reproducing this run from every non-builtin
    /// package's BUILD file.
    fn regenerate_command(ctx: &CompileContext<'_>) -> String {
        let mut args = vec![
            "$(JK)".to_owned(),
            "gen".to_owned(),
            "--build-root".to_owned(),
            shell_word(ctx.session.build_root().as_str()),
        ];
        for bt in ctx.session.build_types() {
            args.extend(["--build-type".to_owned(), bt.name().to_owned()]);
        }
        for format in ctx.session.formats() {
            args.extend(["--format".to_owned(), shell_word(format)]);
        }
        let layout = ctx.session.layout();
        args.extend(
            ctx.graph
                .graph()
                .packages()
                .filter(|(name, _)| !name.starts_with(BUILTIN_PREFIX))
                .map(|(_, package)| shell_word(layout.relativize(&package.build_file).as_str())),
        );
        args.join(" ")
    }
}

impl RootGenerator for RootMakefile {
    fn generate(&self, ctx: &CompileContext<'_>) -> Result<()> {
        let session = ctx.session;
        let build_root = session.build_root();
        let build_types = session.build_types();
        let registry = session.registry();
        let compiled: Vec<&BuildRule> = ctx
            .order
            .iter()
            .map(|&id| ctx.graph.rule(id))
            .filter(|rule| {
                matches!(
                    registry.find(MAKEFILE_FORMAT, rule.type_name()),
                    Dispatch::Found(_)
                )
            })
            .collect();

        let mut out = ctx.files.create(build_root.join(ROOT_MAKEFILE));
        out.write_line(HEADER)?;
        out.write_line("")?;
        out.write_line("JK ?= jk")?;
        out.write_line(".DEFAULT_GOAL := all")?;
        let type_targets = build_types.iter().map(|bt| bt.target_name()).join(" ");
        writeln!(out, ".PHONY: all {type_targets} test clean")?;
        out.write_line("")?;
        write!(out, "{}", target("all", &type_targets, &[]))?;

        for rule in &compiled {
            writeln!(out, "include {}", make_path(fragment_path(ctx, rule).as_str()))?;
        }
        out.write_line("")?;

        for &build_type in build_types {
            let rules = compiled
                .iter()
                .map(|rule| per_type_target(rule, build_type))
                .join(" ");
            write!(out, "{}", target(build_type.target_name(), &rules, &[]))?;
        }

        let test_type = Self::test_build_type(ctx);
        let mut binaries = Vec::new();
        let mut recipe = Vec::new();
        for &id in ctx.order {
            let (rule, resolved) = ctx.rule(id);
            if !rule.rule_type().contains(RuleType::TEST) {
                continue;
            }
            let Some(binary) = resolved.artifacts_for(test_type).first() else {
                continue;
            };
            recipe.push(format!(
                "@$(JK) echo-color green {}",
                shell_word(&format!("Running {rule}"))
            ));
            let args = rule.cc().map(|attrs| attrs.args.as_slice()).unwrap_or(&[]);
            recipe.push(shell_line(
                std::iter::once(binary.as_str()).chain(args.iter().map(String::as_str)),
            ));
            binaries.push(binary.clone());
        }
        write!(out, "{}", target("test", &paths(&binaries), &recipe))?;

        let folders = ctx
            .graph
            .graph()
            .ids_by_name()
            .into_iter()
            .map(|id| ctx.graph.rule(id).working_folder(build_root))
            .collect::<Vec<_>>();
        let clean = if folders.is_empty() {
            Vec::new()
        } else {
            vec![format!(
                "$(JK) delete-file {}",
                shell_line(&folders)
            )]
        };
        write!(out, "{}", target("clean", "", &clean))?;

        let layout = session.layout();
        let build_files: Vec<Utf8PathBuf> = ctx
            .graph
            .graph()
            .build_files()
            .into_iter()
            .map(|file| layout.relativize(file).to_path_buf())
            .sorted()
            .collect();
        let regenerate = [Self::regenerate_command(ctx)];
        let root = make_path(build_root.join(ROOT_MAKEFILE).as_str());
        write!(out, "{}", target(&root, &paths(&build_files), &regenerate))?;
        out.flush()
    }
}
