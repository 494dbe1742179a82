//! End-to-end generation.
//!
//! Runs the stages in order: load, seal, link, prepare, analyse, compile.
//! Each stage hands the next an immutable result, so nothing computed
//! earlier can change once a later stage has started. Output stays in
//! memory; the caller decides whether to [`GeneratedFiles::commit`] it.

use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::info;

use crate::analyzer::{tarjan, topological_sort};
use crate::compiler::{CompileContext, compile_all};
use crate::error::{BuildError, Result};
use crate::linker::link;
use crate::loader::load_build_files;
use crate::model::{BuildPackageFactory, RuleArena, RuleGraph};
use crate::prepare::prepare;
use crate::session::Session;
use crate::writer::GeneratedFiles;

/// Generate every requested format for the packages reachable from
/// `root_files`.
///
/// # Errors
///
/// Returns the first error of the first failing stage. Nothing is written
/// to disk in that case.
pub fn generate(session: &Session, root_files: &[Utf8PathBuf]) -> Result<GeneratedFiles> {
    if root_files.is_empty() {
        return Err(BuildError::Config("no BUILD files given".to_owned()));
    }
    let packages = Arc::new(BuildPackageFactory::new());
    let arena = Arc::new(RuleArena::new());
    load_build_files(session, &packages, &arena, root_files)?;

    let graph = Arc::new(RuleGraph::seal(&packages, &arena)?);
    let linked = Arc::new(link(session, graph)?);

    let prepared = prepare(session, linked)?;

    let sccs = tarjan(prepared.linked());
    let order = sccs.rules_in_order(&topological_sort(&sccs));
    let files = GeneratedFiles::new();
    let ctx = CompileContext {
        session,
        graph: &prepared,
        sccs: &sccs,
        order: &order,
        files: &files,
    };
    compile_all(&ctx)?;
    info!(files = files.len(), "generation finished");
    Ok(files)
}
