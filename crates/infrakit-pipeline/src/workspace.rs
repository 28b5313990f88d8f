//! Run workspaces: artifacts stored as sub-directories.

use infrakit_core::artifact::{Artifact, ArtifactStore};
use infrakit_core::asset::{copy_files, list_visible_files};
use infrakit_core::{Error, ResourceId, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores each artifact in `<root>/<name>`.
pub struct DirectoryArtifactStore {
    root: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// A fresh workspace for one pipeline run under `base`.
    pub fn for_run(base: &Path, run_id: &ResourceId) -> Result<Self> {
        Self::new(base.join(format!("run-{}", run_id)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, artifact: &Artifact) -> Result<PathBuf> {
        let name = artifact.name();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidInput(format!(
                "artifact name '{}' must be a simple identifier",
                name
            )));
        }
        Ok(self.root.join(name))
    }
}

impl ArtifactStore for DirectoryArtifactStore {
    fn prepare(&self, artifact: &Artifact) -> Result<PathBuf> {
        let dir = self.dir(artifact)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn put_dir(&self, artifact: &Artifact, source: &Path) -> Result<PathBuf> {
        let dir = self.prepare(artifact)?;
        let copied = copy_visible(source, &dir)?;
        debug!(artifact = %artifact, files = copied, "Stored artifact");
        Ok(dir)
    }

    fn path(&self, artifact: &Artifact) -> Result<PathBuf> {
        let dir = self.dir(artifact)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("artifact '{}'", artifact)));
        }
        Ok(dir)
    }

    fn exists(&self, artifact: &Artifact) -> bool {
        self.dir(artifact).map(|d| d.is_dir()).unwrap_or(false)
    }

    fn list(&self) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                artifacts.push(Artifact::new(entry.file_name().to_string_lossy()));
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }
}

/// Copy `src` into `dst`, skipping hidden files and directories (`.git`,
/// `.infrakit`, ...).
pub fn copy_visible(src: &Path, dst: &Path) -> Result<u64> {
    if !src.is_dir() {
        return Err(Error::NotFound(format!("directory '{}'", src.display())));
    }
    copy_files(src, dst, &list_visible_files(src)?)
}
