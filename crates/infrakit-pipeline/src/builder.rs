//! Turns a pipeline declaration into an executable [`Pipeline`].

use infrakit_core::artifact::Artifact;
use infrakit_core::pipeline::{
    Action, ActionKind, Pipeline, PipelineDefinition, PipelineStage, SourceSpec, StackTarget,
};
use infrakit_core::{ConstructKind, ConstructPath, ConstructTree, Error, NodeId, Result};
use infrakit_synth::{CloudAssembly, StackArtifact};
use std::collections::HashMap;
use tracing::debug;

pub const SOURCE_STAGE: &str = "Source";
pub const BUILD_STAGE: &str = "Build";
pub const UPDATE_STAGE: &str = "UpdatePipeline";
pub const ASSETS_STAGE: &str = "Assets";

/// Builds pipelines against a synthesized assembly.
pub struct PipelineBuilder<'a> {
    tree: &'a ConstructTree,
    assembly: &'a CloudAssembly,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(tree: &'a ConstructTree, assembly: &'a CloudAssembly) -> Self {
        Self { tree, assembly }
    }

    /// Build the pipeline declared by `node`:
    /// Source, Build, UpdatePipeline (self-mutating only), Assets (when any
    /// deployed stack has assets), then one stage per application stage.
    pub fn build(&self, node: NodeId) -> Result<Pipeline> {
        let definition = self.tree.node(node).pipeline().ok_or_else(|| {
            Error::InvalidInput(format!(
                "'{}' is not a pipeline",
                self.tree.display_path(node)
            ))
        })?;
        let name = self.tree.path(node).to_dashed();

        let mut stages = vec![
            source_stage(definition),
            PipelineStage {
                name: BUILD_STAGE.to_string(),
                actions: vec![Action {
                    name: "Synth".to_string(),
                    run_order: 1,
                    inputs: vec![Artifact::source()],
                    outputs: vec![Artifact::cloud_assembly()],
                    kind: ActionKind::Synth(definition.synth.clone()),
                }],
            },
        ];

        if definition.self_mutating {
            let own_stack = self.tree.enclosing_stack(node).ok_or_else(|| {
                Error::InvalidInput(format!("pipeline '{}' is not inside a stack", name))
            })?;
            let target = self.target(&self.tree.path(own_stack).to_string())?;
            stages.push(PipelineStage {
                name: UPDATE_STAGE.to_string(),
                actions: vec![Action {
                    name: "SelfMutate".to_string(),
                    run_order: 1,
                    inputs: vec![Artifact::cloud_assembly()],
                    outputs: Vec::new(),
                    kind: ActionKind::SelfMutate(target),
                }],
            });
        }

        let mut app_stages = Vec::new();
        let mut assets = Vec::new();
        for stage_path in &definition.stages {
            let nested = self.application_stage(stage_path)?;
            let stage_id = ConstructPath::parse(stage_path)
                .last()
                .unwrap_or(stage_path.as_str())
                .to_string();

            let mut run_orders: HashMap<&str, u32> = HashMap::new();
            let mut actions = Vec::new();
            for stack in nested.all_stacks() {
                let target = self.target(&stack.construct_path)?;
                for entry in &stack.assets {
                    assets.push(format!("{}/{}", target.assembly_path, entry.staged_dir()));
                }

                let run_order = 1 + stack
                    .dependency_paths
                    .iter()
                    .filter_map(|dep| run_orders.get(dep.as_str()))
                    .max()
                    .copied()
                    .unwrap_or(0);
                run_orders.insert(stack.construct_path.as_str(), run_order);

                actions.push(Action {
                    name: stack.id.clone(),
                    run_order,
                    inputs: vec![Artifact::cloud_assembly()],
                    outputs: Vec::new(),
                    kind: ActionKind::Deploy(target),
                });
            }

            if actions.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' has no stacks to deploy",
                    stage_path
                )));
            }
            app_stages.push(PipelineStage {
                name: stage_id,
                actions,
            });
        }

        if !assets.is_empty() {
            assets.sort();
            assets.dedup();
            stages.push(PipelineStage {
                name: ASSETS_STAGE.to_string(),
                actions: vec![Action {
                    name: "FileAssets".to_string(),
                    run_order: 1,
                    inputs: vec![Artifact::cloud_assembly()],
                    outputs: Vec::new(),
                    kind: ActionKind::PublishAssets { assets },
                }],
            });
        }
        stages.extend(app_stages);

        let pipeline = Pipeline { name, stages };
        pipeline.validate()?;
        debug!(
            pipeline = %pipeline.name,
            stages = pipeline.stages.len(),
            "Built pipeline"
        );
        Ok(pipeline)
    }

    /// Build every pipeline declared in the tree.
    pub fn build_all(&self) -> Result<Vec<Pipeline>> {
        self.tree
            .pipelines()
            .into_iter()
            .map(|node| self.build(node))
            .collect()
    }

    fn application_stage(&self, stage_path: &str) -> Result<&'a CloudAssembly> {
        let node = self
            .tree
            .find(&ConstructPath::parse(stage_path))
            .ok_or_else(|| Error::InvalidReference(format!("stage '{}' not found", stage_path)))?;
        if !matches!(self.tree.node(node).kind, ConstructKind::Stage) {
            return Err(Error::InvalidReference(format!(
                "'{}' is a {}, not a stage",
                stage_path,
                self.tree.node(node).kind.label()
            )));
        }
        self.assembly.nested_assembly(stage_path).ok_or_else(|| {
            Error::NotFound(format!("assembly for stage '{}'", stage_path))
        })
    }

    fn target(&self, construct_path: &str) -> Result<StackTarget> {
        let (assembly_path, stack) = self
            .assembly
            .locate(construct_path)
            .ok_or_else(|| Error::NotFound(format!("stack '{}' in assembly", construct_path)))?;
        Ok(stack_target(assembly_path, stack))
    }
}

fn stack_target(assembly_path: String, stack: &StackArtifact) -> StackTarget {
    StackTarget {
        stack: stack.construct_path.clone(),
        assembly_path,
        template_file: stack.template_file.clone(),
        dependencies: stack.dependency_paths.clone(),
    }
}

fn source_stage(definition: &PipelineDefinition) -> PipelineStage {
    let name = match &definition.source {
        SourceSpec::GitHub { .. } => "GitHub",
        SourceSpec::Local { .. } => "Local",
    };
    PipelineStage {
        name: SOURCE_STAGE.to_string(),
        actions: vec![Action {
            name: name.to_string(),
            run_order: 1,
            inputs: Vec::new(),
            outputs: vec![Artifact::source()],
            kind: ActionKind::Source(definition.source.clone()),
        }],
    }
}
