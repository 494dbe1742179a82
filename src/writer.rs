//! Output abstraction for generated scripts.
//!
//! Compilers never touch the filesystem. They stream text through a
//! [`Writer`] obtained from [`GeneratedFiles`], which buffers every file in
//! memory. Only after the whole run succeeds does [`GeneratedFiles::commit`]
//! write them out, skipping files whose content is unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// Line-oriented sink for one generated file.
pub trait Writer: fmt::Write {
    /// Append `text` verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the text.
    fn write(&mut self, text: &str) -> Result<()>;

    /// Append `text` followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects the text.
    fn write_line(&mut self, text: &str) -> Result<()> {
        self.write(text)?;
        self.write("\n")
    }

    /// Hand the finished content to the sink's owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be stored.
    fn flush(&mut self) -> Result<()>;
}

/// In-memory set of generated files keyed by project-relative path.
#[derive(Debug, Default)]
pub struct GeneratedFiles {
    files: Mutex<BTreeMap<Utf8PathBuf, String>>,
}

/// Outcome of [`GeneratedFiles::commit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Files created or replaced.
    pub written: usize,
    /// Files left alone because their content did not change.
    pub unchanged: usize,
}

impl GeneratedFiles {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a file at `path`. Content is stored when the writer is flushed.
    pub fn create(&self, path: impl Into<Utf8PathBuf>) -> FileWriter<'_> {
        FileWriter {
            files: self,
            path: path.into(),
            buffer: String::new(),
        }
    }

    /// Content generated for `path`, if any.
    #[must_use]
    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<String> {
        self.files.lock().get(path.as_ref()).cloned()
    }

    /// Every generated path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<Utf8PathBuf> {
        self.files.lock().keys().cloned().collect()
    }

    /// Number of generated files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    /// Whether nothing was generated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }

    fn store(&self, path: &Utf8Path, content: String) -> Result<()> {
        let mut files = self.files.lock();
        if files.contains_key(path) {
            return Err(BuildError::Internal(format!(
                "{path} was generated more than once"
            )));
        }
        files.insert(path.to_path_buf(), content);
        Ok(())
    }

    /// Write every file below `root`, in path order.
    ///
    /// A file whose on-disk digest matches the generated content is left
    /// untouched so `make` does not see a spurious timestamp change. Others
    /// are written to a temporary file in the target directory and renamed
    /// into place.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] if a directory or file cannot be written.
    pub fn commit(&self, root: &Utf8Path) -> Result<CommitSummary> {
        let files = self.files.lock();
        let mut summary = CommitSummary::default();
        for (path, content) in files.iter() {
            let target = root.join(path);
            if is_unchanged(&target, content) {
                debug!(%target, "unchanged");
                summary.unchanged += 1;
                continue;
            }
            write_atomic(&target, content)?;
            debug!(%target, "written");
            summary.written += 1;
        }
        info!(
            written = summary.written,
            unchanged = summary.unchanged,
            "committed generated files"
        );
        Ok(summary)
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn is_unchanged(target: &Utf8Path, content: &str) -> bool {
    std::fs::read(target).is_ok_and(|existing| digest(&existing) == digest(content.as_bytes()))
}

fn write_atomic(target: &Utf8Path, content: &str) -> Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| BuildError::io(dir, source))?;
    let mut temp = NamedTempFile::new_in(dir).map_err(|source| BuildError::io(dir, source))?;
    temp.write_all(content.as_bytes())
        .map_err(|source| BuildError::io(target, source))?;
    temp.persist(target)
        .map_err(|e| BuildError::io(target, e.error))?;
    Ok(())
}

/// [`Writer`] buffering one file for [`GeneratedFiles`].
#[derive(Debug)]
pub struct FileWriter<'a> {
    files: &'a GeneratedFiles,
    path: Utf8PathBuf,
    buffer: String,
}

impl FileWriter<'_> {
    /// Destination path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl fmt::Write for FileWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buffer.push_str(s);
        Ok(())
    }
}

impl Writer for FileWriter<'_> {
    fn write(&mut self, text: &str) -> Result<()> {
        self.buffer.push_str(text);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let content = std::mem::take(&mut self.buffer);
        self.files.store(&self.path, content)
    }
}
