//! Pipeline artifacts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;

/// Named handle for an opaque payload passed between pipeline actions
/// (fetched source, synthesized cloud assembly, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(String);

impl Artifact {
    /// Conventional name of the fetched source artifact.
    pub const SOURCE: &'static str = "source";
    /// Conventional name of the synthesized cloud assembly artifact.
    pub const CLOUD_ASSEMBLY: &'static str = "cloud_assembly";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn source() -> Self {
        Self::new(Self::SOURCE)
    }

    pub fn cloud_assembly() -> Self {
        Self::new(Self::CLOUD_ASSEMBLY)
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage for artifact payloads during a pipeline run.
pub trait ArtifactStore: Send + Sync {
    /// Directory an action should write the artifact into. Creates it empty.
    fn prepare(&self, artifact: &Artifact) -> Result<PathBuf>;

    /// Import an existing directory as the artifact's payload.
    fn put_dir(&self, artifact: &Artifact, source: &Path) -> Result<PathBuf>;

    /// Location of a stored artifact. Fails if it was never produced.
    fn path(&self, artifact: &Artifact) -> Result<PathBuf>;

    fn exists(&self, artifact: &Artifact) -> bool;

    /// Names of all stored artifacts, sorted.
    fn list(&self) -> Result<Vec<Artifact>>;
}
