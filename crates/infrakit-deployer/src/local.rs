//! Local state-file deployer.
//!
//! Records each deployed stack as `<state_dir>/<stack>.json`. Deploying
//! diffs the new template against the recorded one by logical id, checks
//! that dependencies (and the exports the template imports) are already
//! deployed, and that referenced assets were staged.

use async_trait::async_trait;
use chrono::Utc;
use infrakit_core::deployer::*;
use infrakit_core::{Error, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct LocalDeployer {
    state_dir: PathBuf,
}

impl LocalDeployer {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_file(&self, stack: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.json", stack.trim_matches('/').replace('/', "-")))
    }

    /// Every deployed stack.
    pub async fn list(&self) -> Result<Vec<DeployedStack>> {
        let mut stacks = Vec::new();
        if !self.state_dir.exists() {
            return Ok(stacks);
        }

        let mut entries = tokio::fs::read_dir(&self.state_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            stacks.push(serde_json::from_str(&contents)?);
        }
        stacks.sort_by(|a: &DeployedStack, b| a.stack.cmp(&b.stack));
        Ok(stacks)
    }
}

fn resources(template: &Value) -> Option<&serde_json::Map<String, Value>> {
    template.get("Resources").and_then(Value::as_object)
}

/// Compare two templates resource by resource.
pub fn diff_templates(previous: Option<&Value>, next: &Value) -> ChangeSummary {
    let empty = serde_json::Map::new();
    let old = previous.and_then(resources).unwrap_or(&empty);
    let new = resources(next).unwrap_or(&empty);

    let mut summary = ChangeSummary::default();
    for (id, resource) in new {
        match old.get(id) {
            None => summary.added.push(id.clone()),
            Some(existing) if existing != resource => summary.modified.push(id.clone()),
            Some(_) => summary.unchanged.push(id.clone()),
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            summary.removed.push(id.clone());
        }
    }
    summary
}

/// Values of every `key` object member anywhere in `value`.
fn collect_strings<'a>(value: &'a Value, key: &str, out: &mut BTreeSet<&'a str>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                match (k == key, v.as_str()) {
                    (true, Some(s)) => {
                        out.insert(s);
                    }
                    _ => collect_strings(v, key, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, key, out);
            }
        }
        _ => {}
    }
}

fn export_names(template: &Value) -> BTreeSet<&str> {
    template
        .get("Outputs")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|outputs| outputs.values())
        .filter_map(|output| output.get("Export")?.get("Name")?.as_str())
        .collect()
}

#[async_trait]
impl Deployer for LocalDeployer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn validate(&self, deployment: &StackDeployment) -> Result<Vec<ValidationWarning>> {
        let Some(resources) = resources(&deployment.template) else {
            return Err(Error::InvalidInput(format!(
                "template of stack '{}' has no Resources",
                deployment.stack
            )));
        };

        let mut warnings = Vec::new();
        if resources.is_empty() {
            warnings.push(ValidationWarning {
                field: "Resources".to_string(),
                message: "stack has no resources".to_string(),
            });
        }
        for (id, resource) in resources {
            if resource.get("Type").and_then(Value::as_str).is_none() {
                warnings.push(ValidationWarning {
                    field: format!("Resources.{}", id),
                    message: "resource has no Type".to_string(),
                });
            }
        }
        Ok(warnings)
    }

    async fn deploy(&self, deployment: StackDeployment) -> Result<DeployResult> {
        for warning in self.validate(&deployment).await? {
            warn!(stack = %deployment.stack, field = %warning.field, "{}", warning.message);
        }

        let mut dependency_templates = Vec::new();
        for dependency in &deployment.dependencies {
            match self.state(dependency).await? {
                Some(deployed) => dependency_templates.push(deployed.template),
                None => {
                    return Err(Error::DeploymentFailed(format!(
                        "stack '{}' depends on '{}', which is not deployed",
                        deployment.stack, dependency
                    )));
                }
            }
        }
        let mut available_exports = BTreeSet::new();
        for template in &dependency_templates {
            available_exports.extend(export_names(template));
        }

        let mut imports = BTreeSet::new();
        collect_strings(&deployment.template, "Fn::ImportValue", &mut imports);
        if let Some(missing) = imports.iter().find(|i| !available_exports.contains(*i)) {
            return Err(Error::DeploymentFailed(format!(
                "stack '{}' imports '{}', which no deployed dependency exports",
                deployment.stack, missing
            )));
        }

        let mut assets = BTreeSet::new();
        collect_strings(&deployment.template, "AssetHash", &mut assets);
        for hash in assets {
            let staged = deployment.assembly_dir.join(format!("asset.{}", hash));
            if !staged.exists() {
                return Err(Error::DeploymentFailed(format!(
                    "asset {} of stack '{}' was not staged in {}",
                    hash,
                    deployment.stack,
                    deployment.assembly_dir.display()
                )));
            }
        }

        let previous = self.state(&deployment.stack).await?;
        let changes = diff_templates(previous.as_ref().map(|p| &p.template), &deployment.template);
        debug!(stack = %deployment.stack, changes = %changes, "Computed changes");

        let deployed_at = Utc::now();
        let record = DeployedStack {
            stack: deployment.stack.clone(),
            deployment_id: deployment.id,
            template: deployment.template,
            deployed_at,
        };

        tokio::fs::create_dir_all(&self.state_dir).await?;
        let path = self.state_file(&deployment.stack);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(
            stack = %deployment.stack,
            deployment = %deployment.id,
            changes = %changes,
            "Deployed stack"
        );

        Ok(DeployResult {
            id: deployment.id,
            stack: deployment.stack,
            changes,
            deployed_at,
        })
    }

    async fn state(&self, stack: &str) -> Result<Option<DeployedStack>> {
        let path = self.state_file(stack);
        if !path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let record: DeployedStack = serde_json::from_str(&contents)?;
        if record.stack.trim_matches('/') != stack.trim_matches('/') {
            return Err(Error::DeploymentFailed(format!(
                "state file {} belongs to stack '{}', not '{}'",
                path.display(),
                record.stack,
                stack
            )));
        }
        Ok(Some(record))
    }

    async fn destroy(&self, stack: &str) -> Result<()> {
        if self.state(stack).await?.is_none() {
            return Err(Error::NotFound(format!("deployed stack '{}'", stack)));
        }
        let path = self.state_file(stack);
        tokio::fs::remove_file(&path).await?;
        info!(stack = %stack, "Destroyed stack");
        Ok(())
    }
}
