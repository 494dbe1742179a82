//! Rule and package data model.
//!
//! Packages own their rules by id; rules themselves live in an arena so that
//! dependency edges and per-rule algorithm state can be plain indices.
//!
//! ```
//! use jkbuild::model::{BuildPackageFactory, RuleArena};
//!
//! let factory = BuildPackageFactory::new();
//! let (package, is_new) = factory.get_or_create("lib/base");
//! assert!(is_new);
//! assert_eq!(package.name(), "lib/base");
//! assert!(RuleArena::new().is_empty());
//! ```

pub mod factory;
mod graph;
mod package;
mod rule;

pub use graph::{LinkedGraph, PackageRules, RuleArena, RuleGraph};
pub use package::{BuildPackage, BuildPackageFactory, InitState};
pub use rule::{
    BuildRule, CcAttrs, DEFAULT_VERSION, ExternalAttrs, RuleDecl, RuleId, RuleKind, RuleType,
    ShellScriptAttrs,
};
