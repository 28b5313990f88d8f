//! Deployment backends for infrakit.
//!
//! Provides deployer implementations:
//! - Local state files (development and pipeline dry runs)

pub mod local;

pub use infrakit_core::deployer::{
    ChangeSummary, DeployResult, DeployedStack, Deployer, StackDeployment, ValidationWarning,
};
pub use local::{LocalDeployer, diff_templates};
