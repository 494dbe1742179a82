//! Per-rule preparation.
//!
//! Preparation expands source patterns and computes the flags a rule
//! inherits from its transitive dependencies. Every rule is prepared by its
//! own pool task; the results are sealed into a [`PreparedGraph`] that later
//! stages can only read.
//!
//! Flags are collected dependencies first, then the rule's own, keeping the
//! first occurrence of each. Dependencies are walked in
//! [`LinkedGraph::dependencies_in_order`] order, which follows declaration
//! order, so regenerating from the same tree reproduces the same flag lists.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use itertools::Itertools;
use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::expand::PatternExpander;
use crate::model::{BuildRule, CcAttrs, LinkedGraph, RuleGraph, RuleId, RuleKind, RuleType};
use crate::pool::join_all;
use crate::session::{BUILTIN_PREFIX, BuildType, ProjectLayout, Session};

/// Stamp file touched once an external project has been installed.
pub const INSTALLED_STAMP: &str = ".installed";
/// Stamp file touched once a shell script without outputs has run.
pub const DONE_STAMP: &str = ".done";

/// One expanded source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path inside the declaring package, or the project path for files
    /// matched outside it. Names the object file.
    pub relative: String,
    /// Path relative to the project root.
    pub path: Utf8PathBuf,
}

impl SourceFile {
    /// Whether the file is compiled as C rather than C++.
    #[must_use]
    pub fn is_c(&self) -> bool {
        self.path.extension() == Some("c")
    }
}

/// Everything derived for one rule during preparation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRule {
    /// `-I` flags, dependencies first.
    pub includes: Vec<String>,
    /// `-D` flags, dependencies first.
    pub defines: Vec<String>,
    /// Linker flags inherited from transitive dependencies.
    pub inherent_flags: Vec<String>,
    /// Expanded sources, after excludes.
    pub sources: Vec<SourceFile>,
    /// Expanded headers, after excludes, relative to the project root.
    pub headers: Vec<Utf8PathBuf>,
    /// Files dependents reference, per build type.
    pub artifacts: BTreeMap<BuildType, Vec<Utf8PathBuf>>,
    /// Transitive dependencies, each after its own dependencies.
    pub dependency_order: Vec<RuleId>,
}

impl ResolvedRule {
    /// Exported files for `build_type`.
    #[must_use]
    pub fn artifacts_for(&self, build_type: BuildType) -> &[Utf8PathBuf] {
        self.artifacts
            .get(&build_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A linked graph whose rules have all been prepared. Read-only.
#[derive(Debug)]
pub struct PreparedGraph {
    linked: Arc<LinkedGraph>,
    resolved: Vec<ResolvedRule>,
}

impl PreparedGraph {
    /// The linked graph.
    #[must_use]
    pub fn linked(&self) -> &LinkedGraph {
        &self.linked
    }

    /// The sealed rule graph.
    #[must_use]
    pub fn graph(&self) -> &RuleGraph {
        self.linked.graph()
    }

    /// Shorthand for [`RuleGraph::rule`].
    #[must_use]
    pub fn rule(&self, id: RuleId) -> &BuildRule {
        self.linked.rule(id)
    }

    /// Preparation result for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    #[must_use]
    #[expect(
        clippy::indexing_slicing,
        reason = "one resolved entry exists per rule id"
    )]
    pub fn resolved(&self, id: RuleId) -> &ResolvedRule {
        &self.resolved[id.index()]
    }
}

/// Prepare every rule of `linked` in parallel, then check source ownership.
///
/// # Errors
///
/// Returns the first failure in qualified-name order:
/// [`BuildError::Cycle`] if a rule reaches a cycle, [`BuildError::Pattern`]
/// for unexpandable patterns, then [`BuildError::DuplicateSource`] if two
/// rules expand to the same source file.
pub fn prepare(session: &Session, linked: Arc<LinkedGraph>) -> Result<PreparedGraph> {
    let order = linked.graph().ids_by_name();
    let handles: Vec<_> = order
        .iter()
        .map(|&id| {
            let linked = Arc::clone(&linked);
            let preparer = Preparer {
                layout: session.layout().clone(),
                expander: session.expander(),
                build_types: session.build_types().to_vec(),
            };
            session
                .pool()
                .push(move || (id, preparer.prepare_rule(&linked, id)))
        })
        .collect();

    let mut resolved = vec![ResolvedRule::default(); linked.graph().len()];
    let mut first_error = None;
    for (id, result) in join_all(handles)? {
        match result {
            Ok(rule) => {
                if let Some(slot) = resolved.get_mut(id.index()) {
                    *slot = rule;
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

    check_source_ownership(&linked, &resolved, &order)?;
    let sources: usize = resolved.iter().map(|r| r.sources.len()).sum();
    info!(rules = resolved.len(), sources, "prepared rules");
    Ok(PreparedGraph { linked, resolved })
}

/// First registration wins; a second claim on the same path is fatal.
fn check_source_ownership(
    linked: &LinkedGraph,
    resolved: &[ResolvedRule],
    order: &[RuleId],
) -> Result<()> {
    let mut owners: HashMap<&Utf8Path, RuleId> = HashMap::new();
    for &id in order {
        let Some(rule) = resolved.get(id.index()) else {
            continue;
        };
        for source in &rule.sources {
            if let Some(first) = owners.insert(&source.path, id) {
                if first != id {
                    return Err(BuildError::DuplicateSource {
                        path: source.path.clone(),
                        first: linked.rule(first).full_qualified_name().to_owned(),
                        second: linked.rule(id).full_qualified_name().to_owned(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Lexically collapse `.` and `..` components.
///
/// The flag is set when a `..` had nothing left to cancel, meaning the
/// path climbs above where it started.
fn normalize_path(path: &Utf8Path) -> (Utf8PathBuf, bool) {
    let mut parts: Vec<Utf8Component<'_>> = Vec::new();
    let mut escapes = false;
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match parts.last().copied() {
                Some(Utf8Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => escapes = true,
                _ => {
                    escapes = true;
                    parts.push(component);
                }
            },
            other => parts.push(other),
        }
    }
    (parts.iter().collect(), escapes)
}

/// Where a source's object lands below the per-build-type folder: its path
/// inside the package, or its project path when it lives elsewhere.
fn object_stem(path: &Utf8Path, package_dir: &Utf8Path) -> String {
    path.strip_prefix(package_dir).map_or_else(
        |_| {
            path.components()
                .filter_map(|c| match c {
                    Utf8Component::Normal(name) => Some(name),
                    _ => None,
                })
                .join("/")
        },
        |inside| inside.as_str().to_owned(),
    )
}

/// What a preparation task needs from the session.
struct Preparer {
    layout: ProjectLayout,
    expander: Arc<dyn PatternExpander>,
    build_types: Vec<BuildType>,
}

impl Preparer {
    fn prepare_rule(&self, linked: &LinkedGraph, id: RuleId) -> Result<ResolvedRule> {
        let rule = linked.rule(id);
        let dependency_order = linked.dependencies_in_order(id)?;
        let mut resolved = ResolvedRule {
            dependency_order,
            ..ResolvedRule::default()
        };

        match rule.kind() {
            RuleKind::Cc(attrs) => {
                resolve_flags(linked, attrs, &mut resolved);
                self.expand_files(rule, attrs, &mut resolved)?;
            }
            RuleKind::External(_) | RuleKind::ShellScript(_) => {}
        }
        resolved.artifacts = self.artifacts(rule, &resolved);
        debug!(
            rule = %rule,
            sources = resolved.sources.len(),
            deps = resolved.dependency_order.len(),
            "prepared rule"
        );
        Ok(resolved)
    }

    fn expand_files(
        &self,
        rule: &BuildRule,
        attrs: &CcAttrs,
        resolved: &mut ResolvedRule,
    ) -> Result<()> {
        let package_dir = normalize_path(&self.layout.package_dir(rule.package())).0;
        let base = self.layout.absolute_package_dir(rule.package());
        let excluded: IndexSet<String> = self.expand_all(rule, &attrs.excludes, &base)?;
        let sources = self.expand_all(rule, &attrs.srcs, &base)?;
        let headers = self.expand_all(rule, &attrs.headers, &base)?;

        resolved.sources = sources
            .into_iter()
            .filter(|s| !excluded.contains(s))
            .map(|matched| {
                let path = self.project_path(rule, &package_dir, &matched)?;
                let relative = object_stem(&path, &package_dir);
                Ok(SourceFile { relative, path })
            })
            .collect::<Result<_>>()?;
        resolved.headers = headers
            .into_iter()
            .filter(|h| !excluded.contains(h))
            .map(|h| self.project_path(rule, &package_dir, &h))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// The project-relative form of a file matched in `package_dir`.
    ///
    /// Files in ordinary packages may not climb above the project root.
    /// Builtin packages may live anywhere.
    fn project_path(
        &self,
        rule: &BuildRule,
        package_dir: &Utf8Path,
        matched: &str,
    ) -> Result<Utf8PathBuf> {
        let (path, escapes) = normalize_path(&package_dir.join(matched));
        if escapes && !rule.package().starts_with(BUILTIN_PREFIX) {
            return Err(BuildError::SourceOutsideProject {
                rule: rule.full_qualified_name().to_owned(),
                path,
            });
        }
        Ok(path)
    }

    fn expand_all(
        &self,
        rule: &BuildRule,
        patterns: &[String],
        base: &Utf8Path,
    ) -> Result<IndexSet<String>> {
        let mut files = IndexSet::new();
        for pattern in patterns {
            let matches =
                self.expander
                    .expand(pattern, base)
                    .map_err(|e| BuildError::Pattern {
                        rule: rule.full_qualified_name().to_owned(),
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
            files.extend(matches);
        }
        Ok(files)
    }

    fn artifacts(
        &self,
        rule: &BuildRule,
        resolved: &ResolvedRule,
    ) -> BTreeMap<BuildType, Vec<Utf8PathBuf>> {
        let working_folder = rule.working_folder(self.layout.build_root());
        let package_dir = self.layout.package_dir(rule.package());
        self.build_types
            .iter()
            .map(|&build_type| {
                let files = match rule.kind() {
                    RuleKind::Cc(_) if rule.rule_type().contains(RuleType::LIBRARY) => {
                        if resolved.sources.is_empty() {
                            Vec::new()
                        } else {
                            vec![
                                working_folder
                                    .join(build_type.name())
                                    .join(format!("lib{}.a", rule.name())),
                            ]
                        }
                    }
                    RuleKind::Cc(_) => {
                        vec![working_folder.join(build_type.name()).join(rule.name())]
                    }
                    RuleKind::External(attrs) => std::iter::once(INSTALLED_STAMP)
                        .chain(attrs.exports.iter().map(String::as_str))
                        .map(|file| working_folder.join(file))
                        .collect(),
                    RuleKind::ShellScript(attrs) if attrs.outputs.is_empty() => {
                        vec![working_folder.join(DONE_STAMP)]
                    }
                    RuleKind::ShellScript(attrs) => attrs
                        .outputs
                        .iter()
                        .map(|output| package_dir.join(output))
                        .collect(),
                };
                (build_type, files)
            })
            .collect()
    }
}

fn resolve_flags(linked: &LinkedGraph, own: &CcAttrs, resolved: &mut ResolvedRule) {
    let mut includes = IndexSet::new();
    let mut defines = IndexSet::new();
    let mut inherent = IndexSet::new();
    for dep in &resolved.dependency_order {
        let Some(attrs) = linked.rule(*dep).cc() else {
            continue;
        };
        includes.extend(attrs.include.iter().map(|i| format!("-I{i}")));
        defines.extend(attrs.defines.iter().map(|d| format!("-D{d}")));
        inherent.extend(attrs.ldflags.iter().cloned());
    }
    includes.extend(own.include.iter().map(|i| format!("-I{i}")));
    defines.extend(own.defines.iter().map(|d| format!("-D{d}")));
    resolved.includes = includes.into_iter().collect();
    resolved.defines = defines.into_iter().collect();
    resolved.inherent_flags = inherent.into_iter().collect();
}

/// Object file produced from `source` for `build_type`.
#[must_use]
pub fn object_path(
    rule: &BuildRule,
    build_root: &Utf8Path,
    build_type: BuildType,
    source: &SourceFile,
) -> Utf8PathBuf {
    rule.working_folder(build_root)
        .join(build_type.name())
        .join(format!("{}.o", source.relative))
}
