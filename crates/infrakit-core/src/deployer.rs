//! Deployer trait and deployment types.
//!
//! Deployers take a synthesized stack template and make a target match it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{ResourceId, Result};

/// A request to deploy one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDeployment {
    /// Unique identifier for this deployment.
    pub id: ResourceId,
    /// Construct path of the stack.
    pub stack: String,
    /// Synthesized template.
    pub template: serde_json::Value,
    /// Assembly directory the template came from (assets are staged there).
    pub assembly_dir: PathBuf,
    /// Stacks that must already be deployed.
    pub dependencies: Vec<String>,
}

/// Resource-level changes between the deployed and the new template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ChangeSummary {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to remove",
            self.added.len(),
            self.modified.len(),
            self.removed.len()
        )
    }
}

/// Outcome of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    pub id: ResourceId,
    pub stack: String,
    pub changes: ChangeSummary,
    pub deployed_at: DateTime<Utc>,
}

/// A stack as currently deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedStack {
    pub stack: String,
    pub deployment_id: ResourceId,
    pub template: serde_json::Value,
    pub deployed_at: DateTime<Utc>,
}

/// Warning from deployment validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

/// Trait for deploy targets.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Validate a deployment before deploying.
    async fn validate(&self, deployment: &StackDeployment) -> Result<Vec<ValidationWarning>>;

    /// Deploy a stack.
    async fn deploy(&self, deployment: StackDeployment) -> Result<DeployResult>;

    /// Currently deployed state of a stack, if any.
    async fn state(&self, stack: &str) -> Result<Option<DeployedStack>>;

    /// Remove a deployed stack.
    async fn destroy(&self, stack: &str) -> Result<()>;
}
