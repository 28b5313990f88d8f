//! Resource graph building and cloud assembly synthesis for infrakit.
//!
//! - [`graph`] resolves references between resources, rejects cycles and
//!   computes a deterministic deployment order.
//! - [`synthesizer`] turns a construct tree into an in-memory cloud assembly
//!   (templates, asset manifests, assembly manifest) without any I/O.
//! - [`assembly`] writes an assembly to disk, staging (and bundling) assets,
//!   and reads it back.

pub mod assembly;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod synthesizer;

pub use assembly::{AssemblyWriter, load_template, read_manifest};
pub use error::{SynthError, SynthResult};
pub use graph::ResourceGraph;
pub use manifest::{AssemblyManifest, ManifestArtifact, NestedAssemblyManifest, StackManifest};
pub use synthesizer::{AssetEntry, CloudAssembly, StackArtifact, Synthesizer, member_logical_id, stack_id};
