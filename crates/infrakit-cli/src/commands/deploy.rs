//! `infrakit deploy`: synthesize, then deploy stacks directly without a
//! pipeline.

use super::Project;
use super::synth::write_assembly;
use anyhow::{Context, Result, bail};
use infrakit_core::ResourceId;
use infrakit_core::deployer::StackDeployment;
use infrakit_synth::load_template;

pub async fn deploy(project: &Project, only: Option<String>) -> Result<()> {
    let out_dir = project.resolve(&project.settings.output_dir);
    let assembly = write_assembly(project, &out_dir).await?;
    let deployer = project.deployer();

    let stacks: Vec<String> = assembly
        .all_stacks()
        .iter()
        .map(|s| s.construct_path.clone())
        .filter(|path| only.as_deref().is_none_or(|only| only == path))
        .collect();
    if stacks.is_empty() {
        bail!("No stack matches {:?}", only.unwrap_or_default());
    }

    for construct_path in stacks {
        let Some((dir, stack)) = assembly.locate(&construct_path) else {
            bail!("Stack {} missing from the assembly", construct_path);
        };
        let assembly_dir = if dir.is_empty() {
            out_dir.clone()
        } else {
            out_dir.join(&dir)
        };
        let template = load_template(&assembly_dir, &stack.template_file)
            .with_context(|| format!("Failed to load template of {}", construct_path))?;

        let deployment = StackDeployment {
            id: ResourceId::new(),
            stack: construct_path.clone(),
            template,
            assembly_dir,
            dependencies: stack.dependency_paths.clone(),
        };
        for warning in deployer.validate(&deployment).await? {
            println!("  ! {}: {}", warning.field, warning.message);
        }

        match deployer.deploy(deployment).await {
            Ok(result) => println!("✓ {}: {}", result.stack, result.changes),
            Err(e) => {
                println!("✗ {}: {}", construct_path, e);
                bail!("Deployment failed");
            }
        }
    }
    Ok(())
}
