//! Source pattern expansion.
//!
//! Rule preparation asks a [`PatternExpander`] to turn `srcs`, `headers` and
//! `excludes` patterns into concrete files. [`GlobExpander`] walks the real
//! filesystem; tests substitute fixed listings.

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern, glob_with};
use thiserror::Error;

/// Failure expanding one pattern.
#[derive(Debug, Error)]
pub enum ExpandError {
    /// The pattern is not valid glob syntax.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// Reading a directory during the walk failed.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Underlying error text.
        message: String,
    },
    /// A match is not valid UTF-8.
    #[error("glob matched a non-UTF-8 path")]
    NonUtf8,
}

/// Expands glob-style patterns rooted at a directory.
pub trait PatternExpander: Send + Sync {
    /// Return the files under `base_dir` matching `pattern`, relative to
    /// `base_dir`, `/`-separated and sorted.
    ///
    /// # Errors
    ///
    /// Returns an [`ExpandError`] if the pattern is malformed or the walk
    /// fails.
    fn expand(&self, pattern: &str, base_dir: &Utf8Path) -> Result<Vec<String>, ExpandError>;
}

/// Filesystem expander built on the `glob` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobExpander;

impl PatternExpander for GlobExpander {
    fn expand(&self, pattern: &str, base_dir: &Utf8Path) -> Result<Vec<String>, ExpandError> {
        let opts = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let normalized = pattern.replace('\\', "/");
        let full = format!("{}/{normalized}", Pattern::escape(base_dir.as_str()));
        let entries =
            glob_with(&full, opts).map_err(|e| ExpandError::InvalidPattern(e.to_string()))?;

        let mut matches = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| ExpandError::Io {
                path: e.path().display().to_string(),
                message: e.error().to_string(),
            })?;
            let path = Utf8PathBuf::try_from(path).map_err(|_| ExpandError::NonUtf8)?;
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(base_dir).unwrap_or(&path);
            matches.push(relative.as_str().replace('\\', "/"));
        }
        matches.sort();
        matches.dedup();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::fs;
    use tempfile::TempDir;

    #[fixture]
    fn tree() -> (TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
        for file in ["a.cc", "b.cc", "main.h", "sub/c.cc", "sub/deep/d.cc"] {
            let path = root.join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(&path, "").expect("write");
        }
        (dir, root)
    }

    #[rstest]
    #[case("*.cc", &["a.cc", "b.cc"])]
    #[case("sub/*.cc", &["sub/c.cc"])]
    #[case("**/*.cc", &["a.cc", "b.cc", "sub/c.cc", "sub/deep/d.cc"])]
    #[case("main.h", &["main.h"])]
    #[case("missing.cc", &[])]
    fn expands_relative_to_base(
        tree: (TempDir, Utf8PathBuf),
        #[case] pattern: &str,
        #[case] expected: &[&str],
    ) {
        let (_guard, root) = tree;
        let found = GlobExpander.expand(pattern, &root).expect("expand");
        assert_eq!(found, expected);
    }

    #[rstest]
    fn directories_are_skipped(tree: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = tree;
        let found = GlobExpander.expand("*", &root).expect("expand");
        assert!(!found.iter().any(|p| p == "sub"));
    }

    #[rstest]
    fn invalid_pattern_is_reported(tree: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = tree;
        let err = GlobExpander.expand("[", &root).expect_err("invalid");
        assert!(matches!(err, ExpandError::InvalidPattern(_)));
    }
}
