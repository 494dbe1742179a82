//! Rule storage across the pipeline phases.
//!
//! Rules are created concurrently by loader tasks into a [`RuleArena`]. Once
//! loading converges the arena is sealed into a read-only [`RuleGraph`], and
//! the linker attaches dependency edges to produce a [`LinkedGraph`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;

use super::package::{BuildPackageFactory, InitState};
use super::rule::{BuildRule, RuleDecl, RuleId};
use crate::error::{BuildError, Result};

/// Append-only rule storage shared by loader tasks.
#[derive(Debug, Default)]
pub struct RuleArena {
    rules: RwLock<Vec<Arc<BuildRule>>>,
}

impl RuleArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a rule for `package`, returning its new id.
    pub(crate) fn insert(&self, package: String, decl: RuleDecl) -> RuleId {
        let mut rules = self.rules.write();
        let id = RuleId::new(rules.len());
        rules.push(Arc::new(BuildRule::new(id, package, decl)));
        id
    }

    /// Fetch a rule by id.
    #[must_use]
    pub fn get(&self, id: RuleId) -> Option<Arc<BuildRule>> {
        self.rules.read().get(id.index()).cloned()
    }

    /// Number of rules created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rule has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

/// Rules of one package inside a sealed graph.
#[derive(Debug, Clone)]
pub struct PackageRules {
    /// The BUILD file the package was read from.
    pub build_file: Utf8PathBuf,
    /// Rule name to id, in declaration order.
    pub rules: IndexMap<String, RuleId>,
}

/// Read-only view of every loaded rule and package.
#[derive(Debug)]
pub struct RuleGraph {
    rules: Vec<Arc<BuildRule>>,
    packages: BTreeMap<String, PackageRules>,
}

impl RuleGraph {
    /// Freeze the loader's output.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Internal`] if a package never finished
    /// evaluating.
    pub fn seal(factory: &BuildPackageFactory, arena: &RuleArena) -> Result<Self> {
        let mut packages = BTreeMap::new();
        for package in factory.packages() {
            if package.state() != InitState::Done {
                return Err(BuildError::Internal(format!(
                    "package '{}' is still {:?} after loading",
                    package.name(),
                    package.state()
                )));
            }
            let build_file = package
                .build_file()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_default();
            packages.insert(
                package.name().to_owned(),
                PackageRules {
                    build_file,
                    rules: package.rules(),
                },
            );
        }
        let rules = arena.rules.read().clone();
        Ok(Self { rules, packages })
    }

    /// The rule with the given id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by the arena this graph was sealed from.
    #[must_use]
    #[expect(
        clippy::indexing_slicing,
        reason = "ids are only issued by the arena backing this graph"
    )]
    pub fn rule(&self, id: RuleId) -> &BuildRule {
        &self.rules[id.index()]
    }

    /// Number of rules, which is also the id space size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the graph holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every rule in id order.
    pub fn rules(&self) -> impl Iterator<Item = &BuildRule> {
        self.rules.iter().map(|rule| &**rule)
    }

    /// Rule ids ordered by fully qualified name, for deterministic traversal.
    #[must_use]
    pub fn ids_by_name(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.rules.iter().map(|r| r.object_id()).collect();
        ids.sort_by(|a, b| {
            self.rule(*a)
                .full_qualified_name()
                .cmp(self.rule(*b).full_qualified_name())
        });
        ids
    }

    /// A loaded package by key.
    #[must_use]
    pub fn package(&self, name: &str) -> Option<&PackageRules> {
        self.packages.get(name)
    }

    /// Resolve `package:rule`.
    #[must_use]
    pub fn lookup(&self, package: &str, rule: &str) -> Option<RuleId> {
        self.packages
            .get(package)
            .and_then(|p| p.rules.get(rule).copied())
    }

    /// Every loaded package, ordered by key.
    pub fn packages(&self) -> impl Iterator<Item = (&str, &PackageRules)> {
        self.packages.iter().map(|(name, rules)| (name.as_str(), rules))
    }

    /// BUILD files of every loaded package, ordered by package key.
    #[must_use]
    pub fn build_files(&self) -> Vec<&Utf8Path> {
        self.packages
            .values()
            .map(|p| p.build_file.as_path())
            .collect()
    }
}

/// Tracks the visitation state of a node during ordered traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum VisitState {
    Visiting,
    Visited,
}

/// A [`RuleGraph`] with resolved dependency edges.
#[derive(Debug)]
pub struct LinkedGraph {
    graph: Arc<RuleGraph>,
    deps: Vec<Vec<RuleId>>,
}

impl LinkedGraph {
    /// Attach per-rule dependency lists, indexed by rule id.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Internal`] when the edge table does not cover the
    /// id space exactly.
    pub fn new(graph: Arc<RuleGraph>, deps: Vec<Vec<RuleId>>) -> Result<Self> {
        if deps.len() != graph.len() {
            return Err(BuildError::Internal(format!(
                "{} dependency lists for {} rules",
                deps.len(),
                graph.len()
            )));
        }
        Ok(Self { graph, deps })
    }

    /// The underlying rule graph.
    #[must_use]
    pub fn graph(&self) -> &RuleGraph {
        &self.graph
    }

    /// Shorthand for [`RuleGraph::rule`].
    #[must_use]
    pub fn rule(&self, id: RuleId) -> &BuildRule {
        self.graph.rule(id)
    }

    /// Direct dependencies of `id`, in declaration order.
    #[must_use]
    pub fn dependencies(&self, id: RuleId) -> &[RuleId] {
        self.deps.get(id.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every direct edge as `(dependent, dependency)`.
    pub fn edges(&self) -> impl Iterator<Item = (RuleId, RuleId)> + '_ {
        self.deps
            .iter()
            .enumerate()
            .flat_map(|(from, to)| to.iter().map(move |dep| (RuleId::new(from), *dep)))
    }

    /// All transitive dependencies of `root`, each exactly once, ordered so
    /// every rule follows its own dependencies. `root` itself is excluded.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Cycle`] when `root` reaches a cycle.
    pub fn dependencies_in_order(&self, root: RuleId) -> Result<Vec<RuleId>> {
        let mut walk = OrderedWalk {
            linked: self,
            states: HashMap::new(),
            stack: Vec::new(),
            order: IndexSet::new(),
        };
        walk.visit(root)?;
        walk.order.shift_remove(&root);
        Ok(walk.order.into_iter().collect())
    }
}

struct OrderedWalk<'a> {
    linked: &'a LinkedGraph,
    states: HashMap<RuleId, VisitState>,
    stack: Vec<RuleId>,
    order: IndexSet<RuleId>,
}

impl OrderedWalk<'_> {
    fn visit(&mut self, node: RuleId) -> Result<()> {
        match self.states.get(&node) {
            Some(VisitState::Visited) => return Ok(()),
            Some(VisitState::Visiting) => {
                let idx = self.stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<RuleId> = self.stack.iter().skip(idx).copied().collect();
                cycle.push(node);
                let names = self.cycle_names(&canonicalize_cycle(cycle));
                return Err(BuildError::Cycle { rules: names });
            }
            None => {
                self.states.insert(node, VisitState::Visiting);
            }
        }

        self.stack.push(node);
        for dep in self.linked.dependencies(node) {
            self.visit(*dep)?;
        }
        self.stack.pop();
        self.states.insert(node, VisitState::Visited);
        self.order.insert(node);
        Ok(())
    }

    fn cycle_names(&self, cycle: &[RuleId]) -> Vec<String> {
        cycle
            .iter()
            .map(|id| self.linked.rule(*id).full_qualified_name().to_owned())
            .collect()
    }
}

/// Rotate a closed cycle so it starts at its smallest id.
fn canonicalize_cycle(mut cycle: Vec<RuleId>) -> Vec<RuleId> {
    if cycle.len() < 2 {
        return cycle;
    }
    let len = cycle.len() - 1;
    let start = cycle
        .iter()
        .take(len)
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map_or(0, |(idx, _)| idx);
    let (prefix, suffix) = cycle.split_at_mut(len);
    prefix.rotate_left(start);
    if let (Some(first), Some(slot)) = (prefix.first().copied(), suffix.first_mut()) {
        *slot = first;
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::GraphBuilder;
    use rstest::rstest;

    #[rstest]
    fn diamond_lists_shared_dependency_once() {
        let linked = GraphBuilder::new()
            .rule("a", &["b", "c"])
            .rule("b", &["d"])
            .rule("c", &["d"])
            .rule("d", &[])
            .link();
        let a = linked.id("a");
        let order: Vec<&str> = linked
            .dependencies_in_order(a)
            .expect("acyclic")
            .into_iter()
            .map(|id| linked.rule(id).name())
            .collect();
        assert_eq!(order.iter().filter(|n| **n == "d").count(), 1);
        let pos = |name: &str| order.iter().position(|n| *n == name).expect("present");
        assert!(pos("d") < pos("b"));
        assert!(pos("d") < pos("c"));
        assert!(!order.contains(&"a"));
    }

    #[rstest]
    fn leaf_has_no_dependencies() {
        let linked = GraphBuilder::new().rule("solo", &[]).link();
        let order = linked
            .dependencies_in_order(linked.id("solo"))
            .expect("acyclic");
        assert!(order.is_empty());
    }

    #[rstest]
    fn cycle_is_reported_with_names() {
        let linked = GraphBuilder::new()
            .rule("a", &["b"])
            .rule("b", &["a"])
            .link();
        let err = linked
            .dependencies_in_order(linked.id("a"))
            .expect_err("cycle");
        match err {
            BuildError::Cycle { rules } => {
                assert_eq!(
                    rules,
                    vec!["pkg/a@DEFAULT", "pkg/b@DEFAULT", "pkg/a@DEFAULT"]
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[rstest]
    fn self_dependency_is_a_cycle() {
        let linked = GraphBuilder::new().rule("a", &["a"]).link();
        let err = linked
            .dependencies_in_order(linked.id("a"))
            .expect_err("cycle");
        assert!(matches!(err, BuildError::Cycle { .. }));
    }

    #[rstest]
    fn canonicalize_cycle_rotates_smallest_node() {
        let ids = |raw: &[usize]| raw.iter().map(|i| RuleId::new(*i)).collect::<Vec<_>>();
        assert_eq!(canonicalize_cycle(ids(&[2, 0, 1, 2])), ids(&[0, 1, 2, 0]));
        assert_eq!(canonicalize_cycle(ids(&[2, 1, 0, 2])), ids(&[0, 2, 1, 0]));
    }

    #[rstest]
    fn edges_enumerate_every_dependency() {
        let linked = GraphBuilder::new()
            .rule("a", &["b", "c"])
            .rule("b", &[])
            .rule("c", &[])
            .link();
        let edges: Vec<_> = linked.edges().collect();
        assert_eq!(
            edges,
            vec![
                (linked.id("a"), linked.id("b")),
                (linked.id("a"), linked.id("c")),
            ]
        );
    }
}
