//! Deployment pipelines for infrakit.
//!
//! A pipeline declared in an app is built into ordered stages of actions
//! ([`builder`]), run stage by stage ([`orchestrator`]) with each action
//! implemented in [`actions`], and artifacts kept in a per-run
//! [`workspace`].

pub mod actions;
pub mod builder;
pub mod orchestrator;
pub mod workspace;

pub use actions::ActionRunner;
pub use builder::PipelineBuilder;
pub use orchestrator::PipelineOrchestrator;
pub use workspace::DirectoryArtifactStore;
