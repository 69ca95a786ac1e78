//! Atomic publication of stage outputs
//!
//! Every artifact is written to a sibling `<name>.partial` path and renamed
//! into place only once complete. A crash mid-write therefore never leaves a
//! file that [`is_materialized`] would accept, and reruns start over.

use crate::error::{EbdError, Result};
use std::path::{Path, PathBuf};

/// Sibling path used while `target` is being written
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

/// True when `path` exists as a non-empty regular file
pub fn is_materialized(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Rename `from` over `to`
pub fn publish(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to).map_err(|source| EbdError::Publish {
        path: to.to_path_buf(),
        source,
    })
}

/// An output under construction
///
/// Creating one ensures the parent directory exists and clears any stale
/// partial left by an earlier crash. Dropping it without calling
/// [`PartialFile::publish`] removes the partial file.
#[derive(Debug)]
pub struct PartialFile {
    target: PathBuf,
    partial: PathBuf,
    published: bool,
}

impl PartialFile {
    pub fn create(target: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let partial = partial_path(&target);
        if partial.exists() {
            std::fs::remove_file(&partial)?;
        }

        Ok(Self {
            target,
            partial,
            published: false,
        })
    }

    /// Where the caller should write
    pub fn path(&self) -> &Path {
        &self.partial
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Move the finished partial into place
    pub fn publish(mut self) -> Result<PathBuf> {
        publish(&self.partial, &self.target)?;
        self.published = true;
        Ok(self.target.clone())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}
