//! jkbuild core library.
//!
//! Turns trees of BUILD files into generated build scripts. Packages are
//! loaded in parallel, their rules linked into a dependency graph, checked
//! for cycles, prepared, and finally compiled into Makefiles or a JSON
//! compilation database. See [`pipeline::generate`] for the whole flow.

pub mod analyzer;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod error;
pub mod expand;
pub mod frontend;
pub mod id;
pub mod linker;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod prepare;
pub mod runner;
pub mod session;
pub mod value;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use error::{BuildError, Result};
