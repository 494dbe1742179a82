//! JSON compilation database output.
//!
//! Every CC rule gets `<working folder>/compile_commands.json` and the root
//! generator merges all entries into `<build_root>/compile_commands.json`,
//! which is what editors and `clangd` look for. Entries describe the first
//! requested build type.

use serde::Serialize;

use super::{CompileContext, Compiler, RootGenerator};
use crate::error::{BuildError, Result};
use crate::model::RuleId;
use crate::writer::Writer;

/// File name of a compilation database.
pub const COMPILE_COMMANDS_FILE: &str = "compile_commands.json";

#[derive(Debug, Serialize)]
struct Entry {
    directory: String,
    file: String,
    output: String,
    arguments: Vec<String>,
}

fn entries(ctx: &CompileContext<'_>, id: RuleId) -> Vec<Entry> {
    let Some(&build_type) = ctx.session.build_types().first() else {
        return Vec::new();
    };
    let directory = ctx.session.project_root().to_string();
    ctx.graph
        .resolved(id)
        .sources
        .iter()
        .map(|source| {
            let command = ctx.compile_command(id, source, build_type);
            Entry {
                directory: directory.clone(),
                file: command.source.into_string(),
                output: command.object.into_string(),
                arguments: command.arguments,
            }
        })
        .collect()
}

fn render(entries: &[Entry]) -> Result<String> {
    let mut text = serde_json::to_string_pretty(entries)
        .map_err(|e| BuildError::Internal(format!("compilation database: {e}")))?;
    text.push('\n');
    Ok(text)
}

/// Writes the per-rule compilation database.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcCompileDb;

impl Compiler for CcCompileDb {
    fn compile(&self, ctx: &CompileContext<'_>, id: RuleId) -> Result<()> {
        let rule = ctx.graph.rule(id);
        let path = rule
            .working_folder(ctx.session.build_root())
            .join(COMPILE_COMMANDS_FILE);
        let mut out = ctx.files.create(path);
        out.write(&render(&entries(ctx, id))?)?;
        out.flush()
    }
}

/// Writes `<build_root>/compile_commands.json` covering every CC rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootCompileDb;

impl RootGenerator for RootCompileDb {
    fn generate(&self, ctx: &CompileContext<'_>) -> Result<()> {
        let all: Vec<Entry> = ctx
            .order
            .iter()
            .filter(|&&id| ctx.graph.rule(id).cc().is_some())
            .flat_map(|&id| entries(ctx, id))
            .collect();
        let mut out = ctx
            .files
            .create(ctx.session.build_root().join(COMPILE_COMMANDS_FILE));
        out.write(&render(&all)?)?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{tarjan, topological_sort};
    use crate::prepare::prepare;
    use crate::test_support::{GraphBuilder, MemoryExpander, test_session};
    use crate::writer::GeneratedFiles;
    use rstest::rstest;
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    #[rstest]
    fn database_lists_every_source() {
        let builder = GraphBuilder::new()
            .cc_rule("app", &["base"], |a| a.srcs = vec!["app.cc".into()])
            .cc_rule("base", &[], |a| {
                a.srcs = vec!["base.c".into()];
                a.defines = vec!["BASE".into()];
            });
        let expander = MemoryExpander::new().files(&["/proj/pkg/app.cc", "/proj/pkg/base.c"]);
        let session = test_session().with_expander(Arc::new(expander));
        let prepared =
            prepare(&session, Arc::new(builder.link().into_linked())).expect("prepare");
        let sccs = tarjan(prepared.linked());
        let order = sccs.rules_in_order(&topological_sort(&sccs));
        let files = GeneratedFiles::new();
        let ctx = CompileContext {
            session: &session,
            graph: &prepared,
            sccs: &sccs,
            order: &order,
            files: &files,
        };
        for &id in &order {
            CcCompileDb.compile(&ctx, id).expect("compile");
        }
        RootCompileDb.generate(&ctx).expect("root");

        let root: JsonValue = serde_json::from_str(
            &files.get("build/compile_commands.json").expect("root db"),
        )
        .expect("json");
        let entries = root.as_array().expect("array");
        assert_eq!(entries.len(), 2);
        let first = entries.first().expect("first entry");
        assert_eq!(first["file"], "pkg/base.c");
        assert_eq!(first["directory"], "/proj");
        assert_eq!(first["arguments"][0], "cc");
        let app = entries.get(1).expect("second entry");
        assert_eq!(app["output"], "build/pkg@@app@DEFAULT/DEBUG/app.cc.o");
        assert!(
            app["arguments"]
                .as_array()
                .expect("arguments")
                .contains(&JsonValue::from("-DBASE"))
        );
        assert!(files.get("build/pkg@@base@DEFAULT/compile_commands.json").is_some());
    }
}
