//! Pipeline orchestrator - executes pipeline stages in order.

use crate::actions::ActionRunner;
use chrono::Utc;
use infrakit_core::executor::LogLine;
use infrakit_core::pipeline::{
    Action, Pipeline, PipelineEvent, PipelineResult, PipelineStage, StageState,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    runner: Arc<ActionRunner>,
}

impl PipelineOrchestrator {
    pub fn new(runner: Arc<ActionRunner>) -> Self {
        Self { runner }
    }

    /// Execute a pipeline, returning a channel of events and a handle to get the final result.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let runner = self.runner.clone();
        let pipeline = pipeline.clone();

        let handle = tokio::spawn(async move { Self::execute_inner(runner, pipeline, tx).await });

        (rx, handle)
    }

    /// Internal execution logic
    async fn execute_inner(
        runner: Arc<ActionRunner>,
        pipeline: Pipeline,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let mut stage_states: Vec<(String, StageState)> = pipeline
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageState::Pending))
            .collect();

        if let Err(e) = pipeline.validate() {
            error!(pipeline = %pipeline.name, error = %e, "Invalid pipeline");
            for (stage, state) in stage_states.iter_mut() {
                let reason = format!("pipeline is invalid: {}", e);
                *state = StageState::Skipped {
                    reason: reason.clone(),
                };
                let _ = tx
                    .send(PipelineEvent::StageSkipped {
                        stage: stage.clone(),
                        reason,
                    })
                    .await;
            }
            let _ = tx
                .send(PipelineEvent::PipelineCompleted { success: false })
                .await;
            return PipelineResult {
                success: false,
                stage_states,
            };
        }

        info!(pipeline = %pipeline.name, stages = pipeline.stages.len(), "Starting pipeline");
        let mut failed_stage: Option<String> = None;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            if let Some(failed) = &failed_stage {
                let reason = format!("stage '{}' failed", failed);
                info!(stage = %stage.name, %reason, "Skipping stage");
                stage_states[index].1 = StageState::Skipped {
                    reason: reason.clone(),
                };
                let _ = tx
                    .send(PipelineEvent::StageSkipped {
                        stage: stage.name.clone(),
                        reason,
                    })
                    .await;
                continue;
            }

            stage_states[index].1 = StageState::Running {
                started_at: Utc::now(),
            };
            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                })
                .await;

            match Self::execute_stage(&runner, stage, &tx).await {
                Ok(()) => {
                    info!(stage = %stage.name, "Stage completed successfully");
                    stage_states[index].1 = StageState::Succeeded;
                    let _ = tx
                        .send(PipelineEvent::StageCompleted {
                            stage: stage.name.clone(),
                            success: true,
                        })
                        .await;
                }
                Err(message) => {
                    error!(stage = %stage.name, error = %message, "Stage failed");
                    stage_states[index].1 = StageState::Failed { message };
                    failed_stage = Some(stage.name.clone());
                    let _ = tx
                        .send(PipelineEvent::StageCompleted {
                            stage: stage.name.clone(),
                            success: false,
                        })
                        .await;
                }
            }
        }

        let success = stage_states.iter().all(|(_, s)| s.is_success());
        let _ = tx.send(PipelineEvent::PipelineCompleted { success }).await;

        PipelineResult {
            success,
            stage_states,
        }
    }

    /// Execute a single stage: run groups in order, the first failed action
    /// stops the stage.
    async fn execute_stage(
        runner: &Arc<ActionRunner>,
        stage: &PipelineStage,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<(), String> {
        for group in stage.run_groups() {
            for action in group {
                Self::execute_action(runner, stage, action, tx).await?;
            }
        }
        Ok(())
    }

    async fn execute_action(
        runner: &Arc<ActionRunner>,
        stage: &PipelineStage,
        action: &Action,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<(), String> {
        let _ = tx
            .send(PipelineEvent::ActionStarted {
                stage: stage.name.clone(),
                action: action.name.clone(),
            })
            .await;
        info!(stage = %stage.name, action = %action.name, kind = action.kind.label(), "Running action");

        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(100);
        let stage_name = stage.name.clone();
        let action_name = action.name.clone();
        let tx_clone = tx.clone();

        // Spawn a task to stream logs
        let log_handle = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let _ = tx_clone
                    .send(PipelineEvent::ActionLog {
                        stage: stage_name.clone(),
                        action: action_name.clone(),
                        line,
                    })
                    .await;
            }
        });

        let result = runner.run(action, &log_tx).await;
        drop(log_tx);
        if let Err(e) = log_handle.await {
            warn!(error = %e, "Log forwarding task failed");
        }

        let success = result.is_ok();
        let _ = tx
            .send(PipelineEvent::ActionCompleted {
                stage: stage.name.clone(),
                action: action.name.clone(),
                success,
            })
            .await;

        result.map_err(|e| format!("action '{}' failed: {}", action.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::DirectoryArtifactStore;
    use async_trait::async_trait;
    use infrakit_core::artifact::Artifact;
    use infrakit_core::executor::{Executor, JobResult, JobSpec, JobStatus};
    use infrakit_core::pipeline::ActionKind;
    use infrakit_core::secret::StaticSecretStore;
    use infrakit_deployer::LocalDeployer;
    use infrakit_core::Result;

    /// Fails any script containing `fail`, echoes the rest.
    struct MockExecutor;

    #[async_trait]
    impl Executor for MockExecutor {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run(&self, spec: JobSpec, logs: mpsc::Sender<LogLine>) -> Result<JobResult> {
            let script = spec.command.last().cloned().unwrap_or_default();
            let _ = logs.send(LogLine::system(format!("ran {}", script))).await;
            let now = Utc::now();
            let status = if script.contains("fail") {
                JobStatus::Failed {
                    started_at: now,
                    finished_at: now,
                    exit_code: Some(1),
                    message: "exited with code 1".to_string(),
                }
            } else {
                JobStatus::Succeeded {
                    started_at: now,
                    finished_at: now,
                }
            };
            Ok(JobResult {
                exit_code: Some(if status.is_success() { 0 } else { 1 }),
                status,
            })
        }
    }

    fn command(name: &str, order: u32, script: &str) -> Action {
        Action {
            name: name.to_string(),
            run_order: order,
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind: ActionKind::Command {
                commands: vec![script.to_string()],
            },
        }
    }

    fn stage(name: &str, actions: Vec<Action>) -> PipelineStage {
        PipelineStage {
            name: name.to_string(),
            actions,
        }
    }

    async fn run(pipeline: Pipeline) -> (Vec<PipelineEvent>, PipelineResult) {
        let work = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let runner = ActionRunner::new(
            Arc::new(MockExecutor),
            Arc::new(LocalDeployer::new(state.path())),
            Arc::new(StaticSecretStore::new()),
            Arc::new(DirectoryArtifactStore::new(work.path()).unwrap()),
        );
        let orchestrator = PipelineOrchestrator::new(Arc::new(runner));

        let (mut rx, handle) = orchestrator.execute(&pipeline);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, handle.await.unwrap())
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![
                stage("Build", vec![command("compile", 1, "echo build")]),
                stage(
                    "Deploy",
                    vec![
                        command("api", 2, "echo api"),
                        command("data", 1, "echo data"),
                    ],
                ),
            ],
        };
        let (events, result) = run(pipeline).await;

        assert!(result.success);
        let names: Vec<&str> = result.stage_states.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Build", "Deploy"]);

        // data runs before api because of its lower run order.
        let started: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::ActionStarted { action, .. } => Some(action.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["compile", "data", "api"]);

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::ActionLog { action, line, .. } if action == "data" && line.content == "ran echo data"
        )));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: true })
        ));
    }

    #[tokio::test]
    async fn test_failure_skips_downstream_stages() {
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![
                stage("Build", vec![command("compile", 1, "echo build")]),
                stage(
                    "Test",
                    vec![
                        command("unit", 1, "fail now"),
                        command("lint", 2, "echo lint"),
                    ],
                ),
                stage("Deploy", vec![command("ship", 1, "echo ship")]),
            ],
        };
        let (events, result) = run(pipeline).await;

        assert!(!result.success);
        assert_eq!(result.state("Build"), Some(&StageState::Succeeded));
        assert!(matches!(
            result.state("Test"),
            Some(StageState::Failed { message }) if message.contains("unit")
        ));
        assert_eq!(
            result.state("Deploy"),
            Some(&StageState::Skipped {
                reason: "stage 'Test' failed".to_string()
            })
        );

        // The failing action stops its stage.
        assert!(!events.iter().any(|e| matches!(
            e,
            PipelineEvent::ActionStarted { action, .. } if action == "lint"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::ActionCompleted { action, success: false, .. } if action == "unit"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageSkipped { stage, .. } if stage == "Deploy"
        )));
    }

    #[tokio::test]
    async fn test_invalid_pipeline_fails_fast() {
        let mut consumer = command("deploy", 1, "echo deploy");
        consumer.inputs = vec![Artifact::cloud_assembly()];
        let pipeline = Pipeline {
            name: "p".to_string(),
            stages: vec![stage("Deploy", vec![consumer])],
        };
        let (events, result) = run(pipeline).await;

        assert!(!result.success);
        assert!(matches!(
            result.state("Deploy"),
            Some(StageState::Skipped { reason }) if reason.contains("cloud_assembly")
        ));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, PipelineEvent::ActionStarted { .. }))
        );
    }
}
