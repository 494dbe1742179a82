//! Packages and the process-wide package cache.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::graph::RuleArena;
use super::rule::{RuleDecl, RuleId};
use crate::error::{BuildError, Result};

/// Evaluation state of a package's BUILD file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Created by a lookup, not yet evaluated.
    NotStarted,
    /// A loader task is evaluating the file.
    InProgress,
    /// All rules have been added.
    Done,
}

/// The rules declared by one BUILD file.
#[derive(Debug)]
pub struct BuildPackage {
    name: String,
    build_file: OnceLock<Utf8PathBuf>,
    state: Mutex<InitState>,
    rules: Mutex<IndexMap<String, RuleId>>,
}

impl BuildPackage {
    fn new(name: String) -> Self {
        Self {
            name,
            build_file: OnceLock::new(),
            state: Mutex::new(InitState::NotStarted),
            rules: Mutex::new(IndexMap::new()),
        }
    }

    /// Package key: the directory path relative to the project root.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current evaluation state.
    #[must_use]
    pub fn state(&self) -> InitState {
        *self.state.lock()
    }

    /// The BUILD file this package was evaluated from, once known.
    #[must_use]
    pub fn build_file(&self) -> Option<&Utf8Path> {
        self.build_file.get().map(Utf8PathBuf::as_path)
    }

    /// Claim the package for evaluation.
    ///
    /// Returns `false` when another task already started (or finished)
    /// evaluating it.
    pub fn begin(&self, build_file: Utf8PathBuf) -> bool {
        let mut state = self.state.lock();
        if *state != InitState::NotStarted {
            return false;
        }
        *state = InitState::InProgress;
        let _already_set = self.build_file.set(build_file);
        true
    }

    /// Mark evaluation as complete.
    pub fn finish(&self) {
        *self.state.lock() = InitState::Done;
    }

    /// Insert a rule, assigning it an arena id.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::DuplicateRule`] when the package already holds a
    /// rule of the same name. The existing rule is left untouched.
    pub fn add_rule(&self, arena: &RuleArena, decl: RuleDecl) -> Result<RuleId> {
        let mut rules = self.rules.lock();
        if rules.contains_key(&decl.name) {
            return Err(BuildError::DuplicateRule {
                package: self.name.clone(),
                name: decl.name,
            });
        }
        let name = decl.name.clone();
        let id = arena.insert(self.name.clone(), decl);
        rules.insert(name, id);
        Ok(id)
    }

    /// Look up a rule by name.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<RuleId> {
        self.rules.lock().get(name).copied()
    }

    /// Snapshot of the rules in declaration order.
    #[must_use]
    pub fn rules(&self) -> IndexMap<String, RuleId> {
        self.rules.lock().clone()
    }
}

/// Thread-safe `name -> package` cache with get-or-create semantics.
#[derive(Debug, Default)]
pub struct BuildPackageFactory {
    packages: Mutex<BTreeMap<String, Arc<BuildPackage>>>,
}

impl BuildPackageFactory {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the package called `name`, creating it on first use.
    ///
    /// The boolean is `true` only for the caller that created the entry, so
    /// concurrent lookups of one name collapse to a single initialiser.
    pub fn get_or_create(&self, name: &str) -> (Arc<BuildPackage>, bool) {
        let mut packages = self.packages.lock();
        if let Some(existing) = packages.get(name) {
            return (Arc::clone(existing), false);
        }
        let package = Arc::new(BuildPackage::new(name.to_owned()));
        packages.insert(name.to_owned(), Arc::clone(&package));
        (package, true)
    }

    /// Fetch an existing package.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<BuildPackage>> {
        self.packages.lock().get(name).cloned()
    }

    /// Whether `name` has been seen.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.packages.lock().contains_key(name)
    }

    /// All packages, ordered by name.
    #[must_use]
    pub fn packages(&self) -> Vec<Arc<BuildPackage>> {
        self.packages.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rule::{CcAttrs, DEFAULT_VERSION, RuleKind, RuleType};
    use rstest::rstest;
    use std::thread;

    fn decl(name: &str) -> RuleDecl {
        RuleDecl {
            rule_type: RuleType::CC | RuleType::LIBRARY,
            type_name: "cc_library".into(),
            name: name.into(),
            version: DEFAULT_VERSION.into(),
            raw_deps: Vec::new(),
            kind: RuleKind::Cc(CcAttrs::default()),
        }
    }

    #[rstest]
    fn get_or_create_is_idempotent() {
        let factory = BuildPackageFactory::new();
        let (first, first_new) = factory.get_or_create("app");
        let (second, second_new) = factory.get_or_create("app");
        assert!(first_new);
        assert!(!second_new);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[rstest]
    fn concurrent_creation_has_one_winner() {
        let factory = Arc::new(BuildPackageFactory::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let factory = Arc::clone(&factory);
                thread::spawn(move || factory.get_or_create("shared").1)
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|is_new| *is_new)
            .count();
        assert_eq!(winners, 1);
    }

    #[rstest]
    fn begin_only_succeeds_once() {
        let factory = BuildPackageFactory::new();
        let (package, _) = factory.get_or_create("lib");
        assert_eq!(package.state(), InitState::NotStarted);
        assert!(package.begin("lib/BUILD".into()));
        assert!(!package.begin("lib/BUILD".into()));
        assert_eq!(package.state(), InitState::InProgress);
        package.finish();
        assert_eq!(package.state(), InitState::Done);
        assert_eq!(package.build_file(), Some(Utf8Path::new("lib/BUILD")));
    }

    #[rstest]
    fn duplicate_rule_names_are_rejected() {
        let arena = RuleArena::new();
        let factory = BuildPackageFactory::new();
        let (package, _) = factory.get_or_create("lib");
        let id = package.add_rule(&arena, decl("base")).expect("first insert");
        let err = package
            .add_rule(&arena, decl("base"))
            .expect_err("duplicate");
        assert!(matches!(err, BuildError::DuplicateRule { ref name, .. } if name == "base"));
        assert_eq!(package.rule("base"), Some(id));
        assert_eq!(arena.len(), 1);
    }
}
