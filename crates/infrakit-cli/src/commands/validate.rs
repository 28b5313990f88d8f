//! `infrakit validate`.

use super::Project;
use anyhow::{Result, bail};
use infrakit_core::ConstructKind;
use infrakit_pipeline::PipelineBuilder;
use infrakit_synth::Synthesizer;

/// Parse the app, resolve its references and build its pipelines without
/// writing anything.
pub fn validate(project: &Project) -> Result<()> {
    let tree = project.load()?;

    let assembly = match Synthesizer::new(&project.dir).synthesize(&tree) {
        Ok(assembly) => assembly,
        Err(e) => {
            println!("✗ {}: {}", project.app_file.display(), e);
            bail!("Validation failed");
        }
    };
    let pipelines = match PipelineBuilder::new(&tree, &assembly).build_all() {
        Ok(pipelines) => pipelines,
        Err(e) => {
            println!("✗ {}: {}", project.app_file.display(), e);
            bail!("Validation failed");
        }
    };

    let resources = tree
        .walk()
        .into_iter()
        .filter(|id| matches!(tree.node(*id).kind, ConstructKind::Resource(_)))
        .count();
    println!(
        "✓ {} is valid: {} stack(s), {} resource(s), {} pipeline(s)",
        tree.app_id(),
        assembly.all_stacks().len(),
        resources,
        pipelines.len()
    );
    Ok(())
}
