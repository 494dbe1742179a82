//! Strongly connected components and emission order.
//!
//! [`tarjan`] groups the linked rule graph into SCCs and records the edges
//! between them. [`topological_sort`] orders the SCCs so that every
//! component follows everything it depends on. A component with more than
//! one rule, or a rule depending on itself, is a cycle and fails
//! [`SccTable::ensure_acyclic`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::fmt::{self, Display, Formatter};

use tracing::debug;

use crate::error::{BuildError, Result};
use crate::model::{LinkedGraph, RuleGraph, RuleId};

/// Index of a component in its [`SccTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SccId(usize);

impl SccId {
    /// Position in [`SccTable::components`].
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl Display for SccId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "scc{}", self.0)
    }
}

/// A maximal set of mutually reachable rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StronglyConnectedComponent {
    /// This component's id.
    pub id: SccId,
    /// Member rules.
    pub rules: Vec<RuleId>,
    /// Components this one has edges into.
    pub depends_on: BTreeSet<SccId>,
    /// Whether a member depends on itself.
    pub self_loop: bool,
}

impl StronglyConnectedComponent {
    /// Whether the component describes a dependency cycle.
    #[must_use]
    pub fn is_cycle(&self) -> bool {
        self.rules.len() > 1 || self.self_loop
    }
}

/// Result of [`tarjan`]: every component plus a rule-to-component index.
#[derive(Debug, Clone, Default)]
pub struct SccTable {
    components: Vec<StronglyConnectedComponent>,
    rule_to_scc: Vec<Option<SccId>>,
}

impl SccTable {
    /// Components in discovery order; dependencies are discovered first.
    #[must_use]
    pub fn components(&self) -> &[StronglyConnectedComponent] {
        &self.components
    }

    /// A component by id.
    #[must_use]
    pub fn component(&self, id: SccId) -> Option<&StronglyConnectedComponent> {
        self.components.get(id.0)
    }

    /// The component a rule belongs to.
    #[must_use]
    pub fn scc_of(&self, rule: RuleId) -> Option<SccId> {
        self.rule_to_scc.get(rule.index()).copied().flatten()
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Fail on the first cyclic component.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Cycle`] naming every member of the first cyclic
    /// component, sorted by qualified name.
    pub fn ensure_acyclic(&self, graph: &RuleGraph) -> Result<()> {
        match self.components.iter().find(|c| c.is_cycle()) {
            Some(cycle) => {
                let mut rules: Vec<String> = cycle
                    .rules
                    .iter()
                    .map(|id| graph.rule(*id).full_qualified_name().to_owned())
                    .collect();
                rules.sort();
                Err(BuildError::Cycle { rules })
            }
            None => Ok(()),
        }
    }

    /// Flatten an SCC order into the rules it contains.
    #[must_use]
    pub fn rules_in_order(&self, order: &[SccId]) -> Vec<RuleId> {
        order
            .iter()
            .filter_map(|id| self.component(*id))
            .flat_map(|c| c.rules.iter().copied())
            .collect()
    }
}

/// Per-rule bookkeeping for Tarjan's algorithm.
#[derive(Debug, Clone, Copy, Default)]
struct NodeState {
    index: Option<usize>,
    low: usize,
    on_stack: bool,
}

struct Tarjan<'a> {
    linked: &'a LinkedGraph,
    nodes: Vec<NodeState>,
    stack: Vec<RuleId>,
    next_index: usize,
    components: Vec<StronglyConnectedComponent>,
    rule_to_scc: Vec<Option<SccId>>,
}

impl Tarjan<'_> {
    #[expect(
        clippy::indexing_slicing,
        reason = "node arrays are sized to the graph the ids come from"
    )]
    fn node(&mut self, id: RuleId) -> &mut NodeState {
        &mut self.nodes[id.index()]
    }

    fn discover(&mut self, id: RuleId) {
        let index = self.next_index;
        self.next_index += 1;
        *self.node(id) = NodeState {
            index: Some(index),
            low: index,
            on_stack: true,
        };
        self.stack.push(id);
    }

    /// Iterative depth-first search from `root`.
    fn visit(&mut self, root: RuleId) {
        let linked = self.linked;
        self.discover(root);
        let mut frames: Vec<(RuleId, usize)> = vec![(root, 0)];
        while let Some(frame) = frames.last_mut() {
            let (node, next_child) = *frame;
            if let Some(&dep) = linked.dependencies(node).get(next_child) {
                frame.1 += 1;
                let state = *self.node(dep);
                match state.index {
                    None => {
                        self.discover(dep);
                        frames.push((dep, 0));
                    }
                    Some(dep_index) if state.on_stack => {
                        let entry = self.node(node);
                        entry.low = entry.low.min(dep_index);
                    }
                    Some(_) => {}
                }
                continue;
            }

            frames.pop();
            let low = self.node(node).low;
            if let Some(&(parent, _)) = frames.last() {
                let entry = self.node(parent);
                entry.low = entry.low.min(low);
            }
            if Some(low) == self.node(node).index {
                self.close_component(node);
            }
        }
    }

    fn close_component(&mut self, root: RuleId) {
        let id = SccId(self.components.len());
        let mut rules = Vec::new();
        while let Some(member) = self.stack.pop() {
            self.node(member).on_stack = false;
            if let Some(slot) = self.rule_to_scc.get_mut(member.index()) {
                *slot = Some(id);
            }
            rules.push(member);
            if member == root {
                break;
            }
        }
        rules.reverse();
        self.components.push(StronglyConnectedComponent {
            id,
            rules,
            depends_on: BTreeSet::new(),
            self_loop: false,
        });
    }
}

/// Compute the strongly connected components of `linked`.
///
/// Roots are visited in qualified-name order so the component ids do not
/// depend on the order rules were loaded in.
#[must_use]
pub fn tarjan(linked: &LinkedGraph) -> SccTable {
    let len = linked.graph().len();
    let mut state = Tarjan {
        linked,
        nodes: vec![NodeState::default(); len],
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
        rule_to_scc: vec![None; len],
    };
    for root in linked.graph().ids_by_name() {
        if state.node(root).index.is_none() {
            state.visit(root);
        }
    }

    let Tarjan {
        mut components,
        rule_to_scc,
        ..
    } = state;
    for (from, to) in linked.edges() {
        let lookup = |rule: RuleId| rule_to_scc.get(rule.index()).copied().flatten();
        let (Some(from_scc), Some(to_scc)) = (lookup(from), lookup(to)) else {
            continue;
        };
        let Some(component) = components.get_mut(from_scc.0) else {
            continue;
        };
        if from == to {
            component.self_loop = true;
        } else if from_scc != to_scc {
            component.depends_on.insert(to_scc);
        }
    }
    debug!(components = components.len(), "computed strongly connected components");
    SccTable {
        components,
        rule_to_scc,
    }
}

/// Order components so each follows every component it depends on.
///
/// Kahn's algorithm over the component graph; among ready components the
/// smallest id goes first.
#[must_use]
pub fn topological_sort(table: &SccTable) -> Vec<SccId> {
    let len = table.len();
    let mut remaining: Vec<usize> = table
        .components
        .iter()
        .map(|c| c.depends_on.len())
        .collect();
    let mut dependents: Vec<Vec<SccId>> = vec![Vec::new(); len];
    for component in &table.components {
        for dep in &component.depends_on {
            if let Some(list) = dependents.get_mut(dep.0) {
                list.push(component.id);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<SccId>> = table
        .components
        .iter()
        .filter(|c| c.depends_on.is_empty())
        .map(|c| Reverse(c.id))
        .collect();
    let mut order = Vec::with_capacity(len);
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for dependent in dependents.get(id.0).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent.0) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::GraphBuilder;
    use rstest::rstest;

    fn position(order: &[SccId], id: SccId) -> usize {
        order.iter().position(|s| *s == id).expect("scc in order")
    }

    #[rstest]
    fn dag_order_puts_dependencies_first() {
        let linked = GraphBuilder::new()
            .rule("app", &["net", "log"])
            .rule("net", &["base", "log"])
            .rule("log", &["base"])
            .rule("base", &[])
            .rule("tool", &["base"])
            .link();
        let table = tarjan(&linked);
        assert_eq!(table.len(), 5);
        table.ensure_acyclic(linked.graph()).expect("acyclic");
        let order = topological_sort(&table);
        assert_eq!(order.len(), 5);
        for (from, to) in linked.edges() {
            let from_scc = table.scc_of(from).expect("from scc");
            let to_scc = table.scc_of(to).expect("to scc");
            assert!(position(&order, to_scc) < position(&order, from_scc));
        }
    }

    #[rstest]
    fn mutual_dependency_forms_one_component() {
        let linked = GraphBuilder::new()
            .rule("a", &["b"])
            .rule("b", &["a"])
            .rule("c", &["a"])
            .link();
        let table = tarjan(&linked);
        let a = table.scc_of(linked.id("a")).expect("a");
        assert_eq!(table.scc_of(linked.id("b")), Some(a));
        assert_ne!(table.scc_of(linked.id("c")), Some(a));
        let component = table.component(a).expect("component");
        assert_eq!(component.rules.len(), 2);
        assert!(component.is_cycle());
        let c = table.scc_of(linked.id("c")).expect("c");
        assert!(table.component(c).expect("c").depends_on.contains(&a));
    }

    #[rstest]
    fn cycle_error_names_every_member() {
        let linked = GraphBuilder::new()
            .rule("b", &["a"])
            .rule("a", &["b"])
            .link();
        let err = tarjan(&linked)
            .ensure_acyclic(linked.graph())
            .expect_err("cycle");
        match err {
            BuildError::Cycle { rules } => {
                assert_eq!(rules, vec!["pkg/a@DEFAULT", "pkg/b@DEFAULT"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[rstest]
    fn self_dependency_is_a_cycle() {
        let linked = GraphBuilder::new().rule("a", &["a"]).link();
        let table = tarjan(&linked);
        assert_eq!(table.len(), 1);
        assert!(table.ensure_acyclic(linked.graph()).is_err());
    }

    #[rstest]
    fn order_ignores_load_order() {
        let forward = GraphBuilder::new()
            .rule("x", &["y"])
            .rule("y", &[])
            .rule("z", &[])
            .link();
        let backward = GraphBuilder::new()
            .rule("z", &[])
            .rule("y", &[])
            .rule("x", &["y"])
            .link();
        let names = |linked: &LinkedGraph| {
            let table = tarjan(linked);
            table
                .rules_in_order(&topological_sort(&table))
                .into_iter()
                .map(|id| linked.rule(id).name().to_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&*forward), names(&*backward));
        assert_eq!(names(&*forward), vec!["y", "x", "z"]);
    }

    #[rstest]
    fn empty_graph_has_no_components() {
        let linked = GraphBuilder::new().link();
        let table = tarjan(&linked);
        assert!(table.is_empty());
        assert!(topological_sort(&table).is_empty());
    }
}
