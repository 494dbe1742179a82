//! Helpers shared by unit tests.

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::expand::{ExpandError, PatternExpander};
use crate::frontend::{RuleCall, ScriptFrontend, YamlFrontend};
use crate::linker::resolve_dependencies;
use crate::model::{
    BuildPackageFactory, CcAttrs, DEFAULT_VERSION, LinkedGraph, RuleArena, RuleDecl, RuleGraph,
    RuleId, RuleKind, RuleType,
};
use crate::session::Session;

/// Package every [`GraphBuilder`] rule is declared in.
pub const TEST_PACKAGE: &str = "pkg";

/// A two-worker session rooted at `/proj`.
pub fn test_session() -> Session {
    let config = BuildConfig {
        jobs: Some(2),
        ..BuildConfig::default()
    };
    Session::new(&config, "/proj").expect("test session")
}

/// Declares rules in a single package and links them without a loader.
#[derive(Default)]
pub struct GraphBuilder {
    decls: Vec<RuleDecl>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `cc_library` whose dependencies are names in the same package,
    /// or full references when they contain a `:`.
    pub fn rule(self, name: &str, deps: &[&str]) -> Self {
        self.cc_rule(name, deps, |_| {})
    }

    /// Like [`Self::rule`] with attributes set by `configure`.
    pub fn cc_rule(
        mut self,
        name: &str,
        deps: &[&str],
        configure: impl FnOnce(&mut CcAttrs),
    ) -> Self {
        let mut attrs = CcAttrs::default();
        configure(&mut attrs);
        self.decls.push(RuleDecl {
            rule_type: RuleType::CC | RuleType::LIBRARY,
            type_name: "cc_library".to_owned(),
            name: name.to_owned(),
            version: DEFAULT_VERSION.to_owned(),
            raw_deps: deps.iter().map(|d| reference(d)).collect(),
            kind: RuleKind::Cc(attrs),
        });
        self
    }

    /// Add an arbitrary declaration.
    pub fn decl(mut self, decl: RuleDecl) -> Self {
        self.decls.push(decl);
        self
    }

    /// Seal the declared rules into a graph. Ids follow declaration order.
    pub fn seal(self) -> Arc<RuleGraph> {
        let packages = BuildPackageFactory::new();
        let arena = RuleArena::new();
        let (package, _) = packages.get_or_create(TEST_PACKAGE);
        assert!(package.begin(Utf8PathBuf::from("/proj/pkg/BUILD")));
        for decl in self.decls {
            package.add_rule(&arena, decl).expect("unique rule names");
        }
        package.finish();
        Arc::new(RuleGraph::seal(&packages, &arena).expect("sealed graph"))
    }

    /// Seal and resolve every dependency.
    pub fn link(self) -> TestGraph {
        let graph = self.seal();
        let deps = graph
            .rules()
            .map(|rule| resolve_dependencies(&graph, rule).expect("resolvable dependencies"))
            .collect();
        TestGraph {
            linked: LinkedGraph::new(graph, deps).expect("linked graph"),
        }
    }
}

fn reference(dep: &str) -> String {
    if dep.contains(':') {
        dep.to_owned()
    } else {
        format!(":{dep}")
    }
}

/// A linked graph with name lookup.
pub struct TestGraph {
    linked: LinkedGraph,
}

impl TestGraph {
    /// Id of the rule called `name` in [`TEST_PACKAGE`].
    pub fn id(&self, name: &str) -> RuleId {
        self.linked
            .graph()
            .lookup(TEST_PACKAGE, name)
            .unwrap_or_else(|| panic!("no rule named {name}"))
    }

    pub fn into_linked(self) -> LinkedGraph {
        self.linked
    }
}

impl Deref for TestGraph {
    type Target = LinkedGraph;

    fn deref(&self) -> &LinkedGraph {
        &self.linked
    }
}

/// Front-end serving YAML BUILD files from memory.
#[derive(Default)]
pub struct MemoryFrontend {
    files: HashMap<Utf8PathBuf, String>,
    evaluations: Arc<AtomicUsize>,
}

impl MemoryFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, source: &str) -> Self {
        self.files.insert(Utf8PathBuf::from(path), source.to_owned());
        self
    }

    /// Counter of `evaluate_file` calls.
    pub fn evaluations(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.evaluations)
    }
}

impl ScriptFrontend for MemoryFrontend {
    fn evaluate_file(&self, path: &Utf8Path) -> Result<Vec<RuleCall>> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let source = self.files.get(path).ok_or_else(|| {
            BuildError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
        })?;
        YamlFrontend::parse_str(source, path)
    }
}

/// Expander matching patterns against a fixed set of absolute paths.
#[derive(Default)]
pub struct MemoryExpander {
    files: BTreeSet<Utf8PathBuf>,
}

impl MemoryExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(mut self, paths: &[&str]) -> Self {
        self.files.extend(paths.iter().map(Utf8PathBuf::from));
        self
    }
}

impl PatternExpander for MemoryExpander {
    fn expand(&self, pattern: &str, base_dir: &Utf8Path) -> Result<Vec<String>, ExpandError> {
        let compiled =
            Pattern::new(pattern).map_err(|e| ExpandError::InvalidPattern(e.to_string()))?;
        let opts = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        Ok(self
            .files
            .iter()
            .filter_map(|path| path.strip_prefix(base_dir).ok())
            .filter(|relative| compiled.matches_with(relative.as_str(), opts))
            .map(|relative| relative.as_str().to_owned())
            .collect())
    }
}
