//! Pipeline definitions and run state.
//!
//! A [`PipelineDefinition`] is what an app declares inside a stack: where the
//! source comes from, how to synthesize it, and which application stages to
//! deploy. It is turned into an executable [`Pipeline`] (ordered stages of
//! actions passing [`Artifact`]s) once the app has been synthesized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::artifact::Artifact;
use crate::executor::LogLine;
use crate::secret::SecretRef;
use crate::{Error, Result};

/// A pipeline as declared in the construct tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub source: SourceSpec,
    pub synth: SynthSpec,
    /// Paths (from the app root) of the application stages to deploy, in order.
    pub stages: Vec<String>,
    /// Whether the pipeline redeploys its own stack before anything else.
    pub self_mutating: bool,
}

/// Where the pipeline fetches its source from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSpec {
    GitHub {
        owner: String,
        repo: String,
        branch: String,
        oauth_token: SecretRef,
    },
    Local {
        path: String,
    },
}

impl SourceSpec {
    pub fn describe(&self) -> String {
        match self {
            SourceSpec::GitHub {
                owner,
                repo,
                branch,
                ..
            } => format!("github.com/{}/{}@{}", owner, repo, branch),
            SourceSpec::Local { path } => format!("local:{}", path),
        }
    }
}

/// How the pipeline synthesizes the cloud assembly from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthSpec {
    /// Commands run before the synth command.
    pub install_commands: Vec<String>,
    /// Shell command producing `output_dir`. When absent, `app_file` is
    /// synthesized in-process.
    pub synth_command: Option<String>,
    /// App definition file, relative to the source root.
    pub app_file: String,
    /// Cloud assembly directory, relative to the source root.
    pub output_dir: String,
    /// Container image for the build environment (host process when absent).
    pub image: Option<String>,
    /// Run the build container privileged (needed for nested containers).
    pub privileged: bool,
    pub env: BTreeMap<String, String>,
    /// Permissions granted to the build environment.
    pub policies: Vec<PolicyStatement>,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            install_commands: Vec::new(),
            synth_command: None,
            app_file: "infrakit.kdl".to_string(),
            output_dir: "infrakit.out".to_string(),
            image: None,
            privileged: false,
            env: BTreeMap::new(),
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

impl std::str::FromStr for PolicyEffect {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(PolicyEffect::Allow),
            "deny" => Ok(PolicyEffect::Deny),
            _ => Err(format!("unknown policy effect: {}", s)),
        }
    }
}

/// A permission statement attached to the build environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub effect: PolicyEffect,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

/// An executable pipeline: stages run strictly in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<PipelineStage>,
}

/// A named stage: actions grouped by ascending run order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl PipelineStage {
    /// Actions grouped by run order, ascending. Declaration order is kept
    /// inside a group.
    pub fn run_groups(&self) -> Vec<Vec<&Action>> {
        let mut groups: BTreeMap<u32, Vec<&Action>> = BTreeMap::new();
        for action in &self.actions {
            groups.entry(action.run_order).or_default().push(action);
        }
        groups.into_values().collect()
    }
}

/// A unit of work in a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub run_order: u32,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
    pub kind: ActionKind,
}

/// What an action does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionKind {
    /// Fetch the source into the output artifact.
    Source(SourceSpec),
    /// Turn the source into a cloud assembly.
    Synth(SynthSpec),
    /// Redeploy the pipeline's own stack.
    SelfMutate(StackTarget),
    /// Check that staged assets are present in the assembly.
    PublishAssets { assets: Vec<String> },
    /// Deploy one stack from the cloud assembly.
    Deploy(StackTarget),
    /// Run shell commands in the first input artifact.
    Command { commands: Vec<String> },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Source(_) => "source",
            ActionKind::Synth(_) => "synth",
            ActionKind::SelfMutate(_) => "self-mutate",
            ActionKind::PublishAssets { .. } => "publish-assets",
            ActionKind::Deploy(_) => "deploy",
            ActionKind::Command { .. } => "command",
        }
    }
}

/// A stack inside the cloud assembly artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTarget {
    /// Construct path of the stack.
    pub stack: String,
    /// Directory of the (possibly nested) assembly, relative to the artifact root.
    pub assembly_path: String,
    pub template_file: String,
    /// Construct paths of stacks that must be deployed first.
    pub dependencies: Vec<String>,
}

impl Pipeline {
    /// Check the structural invariants of the pipeline:
    /// unique stage names, unique action names per stage, every consumed
    /// artifact produced earlier, no artifact produced twice.
    pub fn validate(&self) -> Result<()> {
        let mut stage_names = HashSet::new();
        let mut produced: HashSet<&str> = HashSet::new();

        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate pipeline stage '{}'",
                    stage.name
                )));
            }
            if stage.actions.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "pipeline stage '{}' has no actions",
                    stage.name
                )));
            }

            let mut action_names = HashSet::new();
            for action in &stage.actions {
                if !action_names.insert(action.name.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "duplicate action '{}' in stage '{}'",
                        action.name, stage.name
                    )));
                }
            }

            for group in stage.run_groups() {
                for action in &group {
                    for input in &action.inputs {
                        if !produced.contains(input.name()) {
                            return Err(Error::InvalidInput(format!(
                                "action '{}/{}' consumes artifact '{}' which no earlier action produces",
                                stage.name, action.name, input
                            )));
                        }
                    }
                }
                for action in &group {
                    for output in &action.outputs {
                        if !produced.insert(output.name()) {
                            return Err(Error::InvalidInput(format!(
                                "artifact '{}' is produced more than once",
                                output
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// State of a stage during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageState {
    Pending,
    Running { started_at: DateTime<Utc> },
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded | StageState::Failed { .. } | StageState::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageState::Succeeded)
    }
}

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { stage: String },
    ActionStarted { stage: String, action: String },
    ActionLog { stage: String, action: String, line: LogLine },
    ActionCompleted { stage: String, action: String, success: bool },
    StageCompleted { stage: String, success: bool },
    StageSkipped { stage: String, reason: String },
    PipelineCompleted { success: bool },
}

/// Result of a pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    /// Per-stage final state, in execution order.
    pub stage_states: Vec<(String, StageState)>,
}

impl PipelineResult {
    pub fn state(&self, stage: &str) -> Option<&StageState> {
        self.stage_states
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, state)| state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str, order: u32, inputs: &[&str], outputs: &[&str]) -> Action {
        Action {
            name: name.to_string(),
            run_order: order,
            inputs: inputs.iter().map(|a| Artifact::new(*a)).collect(),
            outputs: outputs.iter().map(|a| Artifact::new(*a)).collect(),
            kind: ActionKind::Command {
                commands: vec!["true".to_string()],
            },
        }
    }

    fn stage(name: &str, actions: Vec<Action>) -> PipelineStage {
        PipelineStage {
            name: name.to_string(),
            actions,
        }
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![
                stage("Source", vec![action("fetch", 1, &[], &["source"])]),
                stage(
                    "Build",
                    vec![
                        action("synth", 1, &["source"], &["cloud_assembly"]),
                        action("lint", 2, &["cloud_assembly"], &[]),
                    ],
                ),
            ],
        };
        pipeline.validate().unwrap();
    }

    #[test]
    fn test_artifact_must_be_produced_earlier() {
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![stage(
                "Build",
                vec![
                    action("synth", 1, &["source"], &["cloud_assembly"]),
                    action("fetch", 1, &[], &["source"]),
                ],
            )],
        };
        assert!(matches!(pipeline.validate(), Err(Error::InvalidInput(_))));

        // Same run order does not count as "earlier" either.
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![stage(
                "Build",
                vec![
                    action("fetch", 1, &[], &["source"]),
                    action("synth", 1, &["source"], &[]),
                ],
            )],
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![
                stage("Source", vec![action("fetch", 1, &[], &["source"])]),
                stage("Source", vec![action("other", 1, &[], &[])]),
            ],
        };
        assert!(pipeline.validate().is_err());

        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![
                stage("Source", vec![action("fetch", 1, &[], &["source"])]),
                stage("Again", vec![action("fetch", 1, &[], &["source"])]),
            ],
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_run_groups_order() {
        let s = stage(
            "Deploy",
            vec![
                action("b", 2, &[], &[]),
                action("a", 1, &[], &[]),
                action("c", 2, &[], &[]),
            ],
        );
        let groups: Vec<Vec<&str>> = s
            .run_groups()
            .iter()
            .map(|g| g.iter().map(|a| a.name.as_str()).collect())
            .collect();
        assert_eq!(groups, vec![vec!["a"], vec!["b", "c"]]);
    }
}
