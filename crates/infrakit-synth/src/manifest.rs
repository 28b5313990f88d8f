//! On-disk cloud assembly manifest.

use serde::{Deserialize, Serialize};

/// Version written into every manifest.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// File name of the assembly manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// `manifest.json` of one (possibly nested) assembly. Artifacts are listed
/// in deployment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyManifest {
    pub version: String,
    pub artifacts: Vec<ManifestArtifact>,
}

impl AssemblyManifest {
    pub fn stacks(&self) -> impl Iterator<Item = &StackManifest> {
        self.artifacts.iter().filter_map(|a| match a {
            ManifestArtifact::Stack(stack) => Some(stack),
            ManifestArtifact::NestedAssembly(_) => None,
        })
    }

    pub fn nested_assemblies(&self) -> impl Iterator<Item = &NestedAssemblyManifest> {
        self.artifacts.iter().filter_map(|a| match a {
            ManifestArtifact::NestedAssembly(nested) => Some(nested),
            ManifestArtifact::Stack(_) => None,
        })
    }

    pub fn stack(&self, construct_path: &str) -> Option<&StackManifest> {
        self.stacks().find(|s| s.construct_path == construct_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ManifestArtifact {
    Stack(StackManifest),
    NestedAssembly(NestedAssemblyManifest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackManifest {
    /// Stack name (construct path joined with `-`).
    pub id: String,
    pub construct_path: String,
    pub template_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_file: Option<String>,
    /// Ids of stacks in the same assembly that must be deployed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedAssemblyManifest {
    pub id: String,
    /// Directory relative to the parent assembly.
    pub directory: String,
    /// Construct path of the stage.
    pub display_name: String,
}
