//! `infrakit pipeline`: run an app's pipeline locally.

use super::{Project, stream_marker};
use anyhow::{Context, Result, bail};
use infrakit_core::ResourceId;
use infrakit_core::pipeline::{PipelineEvent, StageState};
use infrakit_pipeline::{
    ActionRunner, DirectoryArtifactStore, PipelineBuilder, PipelineOrchestrator,
};
use infrakit_synth::Synthesizer;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn run(project: &Project, source: Option<PathBuf>, name: Option<String>) -> Result<()> {
    let tree = project.load()?;
    let assembly = Synthesizer::new(&project.dir)
        .synthesize(&tree)
        .context("Synthesis failed")?;
    let mut pipelines = PipelineBuilder::new(&tree, &assembly)
        .build_all()
        .context("Failed to build pipeline")?;

    let pipeline = match name {
        Some(name) => pipelines
            .into_iter()
            .find(|p| p.name == name)
            .with_context(|| format!("No pipeline named {}", name))?,
        None if pipelines.len() == 1 => pipelines.remove(0),
        None if pipelines.is_empty() => bail!("{} declares no pipeline", tree.app_id()),
        None => {
            let names: Vec<String> = pipelines.into_iter().map(|p| p.name).collect();
            bail!("Several pipelines declared, pick one with --name: {}", names.join(", "));
        }
    };

    let run_id = ResourceId::new();
    let workspace = DirectoryArtifactStore::for_run(
        &project.resolve(&project.settings.workspace_dir),
        &run_id,
    )
    .context("Failed to create run workspace")?;
    println!("Running pipeline: {}", pipeline.name);
    println!("Workspace: {}", workspace.root().display());

    let mut runner = ActionRunner::new(
        project.executor()?,
        project.deployer(),
        project.secrets(),
        Arc::new(workspace),
    )
    .with_variables(project.vars.clone())
    .with_source_root(project.dir.clone());
    if let Some(dir) = source {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to find source directory: {}", dir.display()))?;
        runner = runner.with_source_override(dir);
    }

    let orchestrator = PipelineOrchestrator::new(Arc::new(runner));
    println!("\n--- Starting pipeline execution ---\n");
    let (mut rx, result_handle) = orchestrator.execute(&pipeline);

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::StageStarted { stage } => {
                println!("▶ Stage '{}' started", stage);
            }
            PipelineEvent::ActionStarted { stage, action } => {
                println!("  ▶ {}/{}", stage, action);
            }
            PipelineEvent::ActionLog {
                stage,
                action,
                line,
            } => {
                println!(
                    "    [{}/{}]{} {}",
                    stage,
                    action,
                    stream_marker(line.stream),
                    line.content
                );
            }
            PipelineEvent::ActionCompleted {
                stage,
                action,
                success,
            } => {
                let marker = if success { "✓" } else { "✗" };
                println!("  {} {}/{}", marker, stage, action);
            }
            PipelineEvent::StageCompleted { stage, success } => {
                if success {
                    println!("✓ Stage '{}' completed successfully\n", stage);
                } else {
                    println!("✗ Stage '{}' failed\n", stage);
                }
            }
            PipelineEvent::StageSkipped { stage, reason } => {
                println!("⊘ Stage '{}' skipped: {}\n", stage, reason);
            }
            PipelineEvent::PipelineCompleted { success } => {
                if success {
                    println!("--- Pipeline completed successfully ---");
                } else {
                    println!("--- Pipeline failed ---");
                }
            }
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    println!("\n--- Stage Summary ---");
    for (stage_name, state) in &result.stage_states {
        let status = match state {
            StageState::Succeeded => "✓ succeeded".to_string(),
            StageState::Failed { message } => format!("✗ failed: {}", message),
            StageState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageState::Pending => "○ pending".to_string(),
            StageState::Running { .. } => "▶ running".to_string(),
        };
        println!("  {} - {}", stage_name, status);
    }

    if result.success {
        println!("\n✓ Pipeline succeeded!");
        Ok(())
    } else {
        bail!("Pipeline failed");
    }
}
