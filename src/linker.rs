//! Dependency linking.
//!
//! Turns every rule's raw dependency strings into [`RuleId`] edges. Rules are
//! linked in parallel, one pool task each, and the stage only completes once
//! every task has finished.

use std::sync::Arc;

use indexmap::IndexSet;
use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::id;
use crate::model::{BuildRule, LinkedGraph, RuleGraph, RuleId};
use crate::pool::join_all;
use crate::session::Session;

/// Resolve every rule's dependencies against the sealed `graph`.
///
/// # Errors
///
/// Returns the first failure in qualified-name order:
/// [`BuildError::DependencyNotFound`] for unknown rules or unmet version
/// requirements, [`BuildError::PackageNotLoaded`] if the loader skipped a
/// referenced package, or [`BuildError::WorkerPool`] if a task did not run.
pub fn link(session: &Session, graph: Arc<RuleGraph>) -> Result<LinkedGraph> {
    let order = graph.ids_by_name();
    let handles: Vec<_> = order
        .iter()
        .map(|&rule| {
            let graph = Arc::clone(&graph);
            session
                .pool()
                .push(move || (rule, resolve_dependencies(&graph, graph.rule(rule))))
        })
        .collect();

    let mut deps = vec![Vec::new(); graph.len()];
    let mut first_error = None;
    for (rule, resolved) in join_all(handles)? {
        match resolved {
            Ok(list) => {
                if let Some(slot) = deps.get_mut(rule.index()) {
                    *slot = list;
                }
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let linked = LinkedGraph::new(graph, deps)?;
    info!(edges = linked.edges().count(), "linked dependencies");
    Ok(linked)
}

/// Resolve one rule's declared dependencies, deduplicated in declaration
/// order.
///
/// # Errors
///
/// See [`link`].
pub fn resolve_dependencies(graph: &RuleGraph, rule: &BuildRule) -> Result<Vec<RuleId>> {
    let mut resolved = IndexSet::new();
    for raw in rule.raw_dependencies() {
        let reference = id::parse(raw)?;
        let package = reference.resolve_package(rule.package());
        let not_found = || BuildError::DependencyNotFound {
            rule: rule.full_qualified_name().to_owned(),
            target: raw.clone(),
        };
        let Some(rules) = graph.package(&package) else {
            return Err(BuildError::PackageNotLoaded {
                rule: rule.full_qualified_name().to_owned(),
                package,
            });
        };
        let target = rules
            .rules
            .get(&reference.rule_name)
            .copied()
            .ok_or_else(not_found)?;
        if let Some(required) = &reference.version_requirement {
            if graph.rule(target).version() != required {
                return Err(not_found());
            }
        }
        resolved.insert(target);
    }
    debug!(rule = %rule, deps = resolved.len(), "resolved dependencies");
    Ok(resolved.into_iter().collect())
}
