//! `infrakit synth`.

use super::Project;
use anyhow::{Context, Result};
use infrakit_synth::{AssemblyWriter, CloudAssembly, Synthesizer};
use std::path::{Path, PathBuf};
use tracing::info;

pub async fn synth(project: &Project, out: Option<PathBuf>) -> Result<()> {
    let out_dir = out.unwrap_or_else(|| project.resolve(&project.settings.output_dir));
    let assembly = write_assembly(project, &out_dir).await?;

    for stack in assembly.all_stacks() {
        println!("✓ {} ({})", stack.construct_path, stack.template_file);
    }
    println!("Cloud assembly written to {}", out_dir.display());
    Ok(())
}

/// Synthesize the project and write its assembly to `out_dir`.
pub async fn write_assembly(project: &Project, out_dir: &Path) -> Result<CloudAssembly> {
    let tree = project.load()?;
    let assembly = Synthesizer::new(&project.dir)
        .synthesize(&tree)
        .context("Synthesis failed")?;

    AssemblyWriter::new(&project.dir)
        .with_executor(project.executor()?)
        .write(&assembly, out_dir)
        .await
        .with_context(|| format!("Failed to write cloud assembly to {}", out_dir.display()))?;

    info!(app = %tree.app_id(), stacks = assembly.all_stacks().len(), "Synthesized app");
    Ok(assembly)
}
