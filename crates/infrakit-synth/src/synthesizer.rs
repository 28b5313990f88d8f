//! Synthesizer: construct tree → in-memory cloud assembly.
//!
//! Synthesis performs no I/O besides fingerprinting asset sources. The App's
//! top-level stacks form the root assembly; every Stage becomes a nested
//! assembly in `assembly-<stage path>`. Stacks are listed in dependency
//! order and resources inside a template in reference order.

use infrakit_core::asset::Asset;
use infrakit_core::pipeline::{PipelineDefinition, SourceSpec};
use infrakit_core::{
    ConstructKind, ConstructTree, Error, NodeId, PropertyValue, Resource, logical_id,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::graph::ResourceGraph;
use crate::manifest::{
    AssemblyManifest, MANIFEST_VERSION, ManifestArtifact, NestedAssemblyManifest, StackManifest,
};
use crate::SynthResult;

/// Metadata key recording the construct path of each resource.
pub const PATH_METADATA_KEY: &str = "infrakit:path";

/// An asset used by a stack, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEntry {
    pub hash: String,
    pub asset: Asset,
}

impl AssetEntry {
    /// Directory (relative to the assembly) the asset is staged into.
    pub fn staged_dir(&self) -> String {
        format!("asset.{}", self.hash)
    }

    pub fn object_key(&self) -> String {
        format!("{}.zip", self.hash)
    }
}

/// A synthesized stack.
#[derive(Debug, Clone)]
pub struct StackArtifact {
    /// Stack name: construct path joined with `-`.
    pub id: String,
    pub construct_path: String,
    pub template_file: String,
    pub template: Value,
    pub assets: Vec<AssetEntry>,
    /// Ids of stacks that must be deployed first.
    pub dependencies: Vec<String>,
    /// Construct paths of the same stacks.
    pub dependency_paths: Vec<String>,
}

impl StackArtifact {
    pub fn assets_file(&self) -> Option<String> {
        if self.assets.is_empty() {
            None
        } else {
            Some(format!("{}.assets.json", self.id))
        }
    }

    /// Asset manifest listing where each asset is staged and uploaded.
    pub fn asset_manifest(&self) -> Value {
        let mut files = Map::new();
        for entry in &self.assets {
            files.insert(
                entry.hash.clone(),
                json!({
                    "source": {
                        "path": entry.staged_dir(),
                        "packaging": "zip",
                    },
                    "destinations": {
                        "default": {
                            "objectKey": entry.object_key(),
                        }
                    }
                }),
            );
        }
        json!({
            "version": MANIFEST_VERSION,
            "files": files,
        })
    }

    /// Logical ids of the template's resources, in template order.
    pub fn logical_ids(&self) -> Vec<String> {
        self.template
            .get("Resources")
            .and_then(Value::as_object)
            .map(|resources| resources.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Value> {
        self.template.get("Resources")?.get(logical_id)
    }
}

/// A synthesized (possibly nested) assembly.
#[derive(Debug, Clone)]
pub struct CloudAssembly {
    /// Construct path of the stage, or the app id for the root assembly.
    pub display_name: String,
    /// Directory relative to the parent assembly (`None` for the root).
    pub directory: Option<String>,
    /// Stacks in deployment order.
    pub stacks: Vec<StackArtifact>,
    pub nested: Vec<CloudAssembly>,
}

impl CloudAssembly {
    pub fn manifest(&self) -> AssemblyManifest {
        let mut artifacts: Vec<ManifestArtifact> = self
            .stacks
            .iter()
            .map(|stack| {
                ManifestArtifact::Stack(StackManifest {
                    id: stack.id.clone(),
                    construct_path: stack.construct_path.clone(),
                    template_file: stack.template_file.clone(),
                    assets_file: stack.assets_file(),
                    dependencies: stack.dependencies.clone(),
                })
            })
            .collect();

        for nested in &self.nested {
            let directory = nested.directory.clone().unwrap_or_default();
            artifacts.push(ManifestArtifact::NestedAssembly(NestedAssemblyManifest {
                id: directory.clone(),
                directory,
                display_name: nested.display_name.clone(),
            }));
        }

        AssemblyManifest {
            version: MANIFEST_VERSION.to_string(),
            artifacts,
        }
    }

    /// Find a stack anywhere in the assembly, with the path of its assembly
    /// directory relative to the root (`""` for the root assembly).
    pub fn locate(&self, construct_path: &str) -> Option<(String, &StackArtifact)> {
        if let Some(stack) = self.stacks.iter().find(|s| s.construct_path == construct_path) {
            return Some((String::new(), stack));
        }
        for nested in &self.nested {
            if let Some((dir, stack)) = nested.locate(construct_path) {
                let prefix = nested.directory.clone().unwrap_or_default();
                let full = if dir.is_empty() {
                    prefix
                } else {
                    format!("{}/{}", prefix, dir)
                };
                return Some((full, stack));
            }
        }
        None
    }

    pub fn stack(&self, construct_path: &str) -> Option<&StackArtifact> {
        self.locate(construct_path).map(|(_, stack)| stack)
    }

    /// Every stack, depth first.
    pub fn all_stacks(&self) -> Vec<&StackArtifact> {
        let mut stacks: Vec<&StackArtifact> = self.stacks.iter().collect();
        for nested in &self.nested {
            stacks.extend(nested.all_stacks());
        }
        stacks
    }

    /// The nested assembly for a stage path.
    pub fn nested_assembly(&self, stage_path: &str) -> Option<&CloudAssembly> {
        for nested in &self.nested {
            if nested.display_name == stage_path {
                return Some(nested);
            }
            if let Some(found) = nested.nested_assembly(stage_path) {
                return Some(found);
            }
        }
        None
    }
}

/// Output name and export name of a cross-stack reference.
#[derive(Debug, Clone)]
struct Export {
    producer_stack: NodeId,
    output_id: String,
    export_name: String,
    value: Value,
}

type ExportKey = (NodeId, Option<String>);

/// Turns a construct tree into a [`CloudAssembly`].
pub struct Synthesizer {
    base_dir: PathBuf,
}

impl Synthesizer {
    /// `base_dir` is the directory asset paths are relative to.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn synthesize(&self, tree: &ConstructTree) -> SynthResult<CloudAssembly> {
        check_unique_names(tree, &tree.stacks(), "stack")?;
        check_unique_names(tree, &tree.stages(), "stage")?;
        let graph = ResourceGraph::build(tree)?;
        let exports = collect_exports(tree, &graph)?;
        let assembly = self.assembly(tree, &graph, &exports, None)?;

        info!(
            app = %tree.app_id(),
            stacks = assembly.all_stacks().len(),
            "Synthesized cloud assembly"
        );
        Ok(assembly)
    }

    fn assembly(
        &self,
        tree: &ConstructTree,
        graph: &ResourceGraph,
        exports: &BTreeMap<ExportKey, Export>,
        stage: Option<NodeId>,
    ) -> SynthResult<CloudAssembly> {
        let stacks = graph.stack_order(tree, &tree.assembly_stacks(stage))?;

        let mut artifacts = Vec::with_capacity(stacks.len());
        for stack in stacks {
            artifacts.push(self.stack_artifact(tree, graph, exports, stack)?);
        }

        let mut nested = Vec::new();
        for child in tree.stages() {
            if tree.enclosing_stage(child) == stage {
                nested.push(self.assembly(tree, graph, exports, Some(child))?);
            }
        }

        let (display_name, directory) = match stage {
            Some(stage) => {
                let path = tree.path(stage);
                (path.to_string(), Some(format!("assembly-{}", path.to_dashed())))
            }
            None => (tree.app_id().to_string(), None),
        };

        Ok(CloudAssembly {
            display_name,
            directory,
            stacks: artifacts,
            nested,
        })
    }

    fn stack_artifact(
        &self,
        tree: &ConstructTree,
        graph: &ResourceGraph,
        exports: &BTreeMap<ExportKey, Export>,
        stack: NodeId,
    ) -> SynthResult<StackArtifact> {
        let id = stack_id(tree, stack);
        let mut ctx = RenderContext {
            tree,
            stack,
            exports,
            base_dir: &self.base_dir,
            assets: Vec::new(),
        };

        let mut resources = Map::new();
        let mut owners: HashMap<String, NodeId> = HashMap::new();

        for member in graph.resource_order(tree, stack)? {
            let lid = member_logical_id(tree, member);
            if let Some(existing) = owners.insert(lid.clone(), member) {
                return Err(Error::InvalidInput(format!(
                    "'{}' and '{}' map to the same logical id '{}'",
                    tree.path(existing),
                    tree.path(member),
                    lid
                ))
                .into());
            }

            let node = tree.node(member);
            let entry = match &node.kind {
                ConstructKind::Resource(resource) => ctx.render_resource(member, resource)?,
                ConstructKind::Pipeline(definition) => render_pipeline(tree, member, definition),
                _ => continue,
            };
            debug!(stack = %id, logical_id = %lid, "Rendered resource");
            resources.insert(lid, entry);
        }

        let mut template = Map::new();
        template.insert("Resources".to_string(), Value::Object(resources));

        let outputs: Map<String, Value> = exports
            .values()
            .filter(|e| e.producer_stack == stack)
            .map(|e| {
                (
                    e.output_id.clone(),
                    json!({
                        "Value": e.value,
                        "Export": { "Name": e.export_name },
                    }),
                )
            })
            .collect();
        if !outputs.is_empty() {
            template.insert("Outputs".to_string(), Value::Object(outputs));
        }

        let dependency_nodes = graph.stack_order(tree, &graph.stack_dependencies(stack))?;

        Ok(StackArtifact {
            template_file: format!("{}.template.json", id),
            construct_path: tree.path(stack).to_string(),
            template: Value::Object(template),
            assets: ctx.assets,
            dependencies: dependency_nodes.iter().map(|d| stack_id(tree, *d)).collect(),
            dependency_paths: dependency_nodes
                .iter()
                .map(|d| tree.path(*d).to_string())
                .collect(),
            id,
        })
    }
}

struct RenderContext<'a> {
    tree: &'a ConstructTree,
    stack: NodeId,
    exports: &'a BTreeMap<ExportKey, Export>,
    base_dir: &'a Path,
    assets: Vec<AssetEntry>,
}

impl RenderContext<'_> {
    fn render_resource(&mut self, member: NodeId, resource: &Resource) -> SynthResult<Value> {
        let mut properties = Map::new();
        for (key, value) in &resource.properties {
            properties.insert(key.clone(), self.render_value(value)?);
        }

        let mut entry = Map::new();
        entry.insert("Type".to_string(), json!(resource.kind.as_str()));
        entry.insert("Properties".to_string(), Value::Object(properties));

        let depends_on: Vec<Value> = resource
            .depends_on
            .iter()
            .filter_map(|target| self.tree.resolve_target(self.stack, target))
            .filter(|target| self.tree.parent(*target) == Some(self.stack))
            .map(|target| json!(member_logical_id(self.tree, target)))
            .collect();
        if !depends_on.is_empty() {
            entry.insert("DependsOn".to_string(), Value::Array(depends_on));
        }

        entry.insert(
            "Metadata".to_string(),
            json!({ PATH_METADATA_KEY: self.tree.path(member).to_string() }),
        );
        Ok(Value::Object(entry))
    }

    fn render_value(&mut self, value: &PropertyValue) -> SynthResult<Value> {
        Ok(match value {
            PropertyValue::String(s) => json!(s),
            PropertyValue::Number(n) => json!(n),
            PropertyValue::Bool(b) => json!(b),
            PropertyValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item))
                    .collect::<SynthResult<Vec<_>>>()?,
            ),
            PropertyValue::Map(map) => {
                let mut object = Map::new();
                for (key, item) in map {
                    object.insert(key.clone(), self.render_value(item)?);
                }
                Value::Object(object)
            }
            PropertyValue::Ref { target, attribute } => self.render_ref(target, attribute.as_deref())?,
            PropertyValue::Secret(secret) => json!(secret.dynamic_reference()),
            PropertyValue::Asset(asset) => {
                let hash = asset.fingerprint(self.base_dir)?;
                let entry = AssetEntry {
                    hash,
                    asset: asset.clone(),
                };
                let rendered = json!({
                    "AssetHash": entry.hash,
                    "ObjectKey": entry.object_key(),
                });
                if !self.assets.iter().any(|a| a.hash == entry.hash) {
                    self.assets.push(entry);
                }
                rendered
            }
        })
    }

    fn render_ref(&self, target: &str, attribute: Option<&str>) -> SynthResult<Value> {
        let resolved = self.tree.resolve_target(self.stack, target).ok_or_else(|| {
            Error::InvalidReference(format!("unknown construct '{}'", target))
        })?;

        if self.tree.parent(resolved) == Some(self.stack) {
            return Ok(local_ref(self.tree, resolved, attribute));
        }

        let key = (resolved, attribute.map(String::from));
        let export = self.exports.get(&key).ok_or_else(|| {
            Error::Internal(format!(
                "no export for cross-stack reference to '{}'",
                self.tree.path(resolved)
            ))
        })?;
        Ok(json!({ "Fn::ImportValue": export.export_name }))
    }
}

fn local_ref(tree: &ConstructTree, target: NodeId, attribute: Option<&str>) -> Value {
    let lid = member_logical_id(tree, target);
    match attribute {
        Some(attr) => json!({ "Fn::GetAtt": [lid, attr] }),
        None => json!({ "Ref": lid }),
    }
}

/// Stack ids and assembly directories flatten construct paths with `-`, so
/// `a/b` and `a-b` would share template, state and directory names.
fn check_unique_names(tree: &ConstructTree, nodes: &[NodeId], what: &str) -> SynthResult<()> {
    let mut seen: HashMap<String, NodeId> = HashMap::new();
    for &node in nodes {
        let name = tree.path(node).to_dashed();
        if let Some(existing) = seen.insert(name.clone(), node) {
            return Err(Error::InvalidInput(format!(
                "{}s '{}' and '{}' both map to the name '{}'",
                what,
                tree.path(existing),
                tree.path(node),
                name
            ))
            .into());
        }
    }
    Ok(())
}

fn collect_exports(
    tree: &ConstructTree,
    graph: &ResourceGraph,
) -> SynthResult<BTreeMap<ExportKey, Export>> {
    let mut exports = BTreeMap::new();
    let mut outputs: HashMap<(NodeId, String), ExportKey> = HashMap::new();
    for (_, dep) in graph.cross_stack_references() {
        let key = (dep.target, dep.attribute.clone());
        if exports.contains_key(&key) {
            continue;
        }

        let lid = member_logical_id(tree, dep.target);
        let suffix: String = dep
            .attribute
            .as_deref()
            .unwrap_or("")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let output_id = format!("Export{}{}", lid, suffix);
        if let Some(other) = outputs.insert((dep.target_stack, output_id.clone()), key.clone()) {
            return Err(Error::InvalidInput(format!(
                "references to '{}' with attributes '{}' and '{}' both export as '{}'",
                tree.path(dep.target),
                other.1.as_deref().unwrap_or(""),
                dep.attribute.as_deref().unwrap_or(""),
                output_id
            ))
            .into());
        }
        let export_name = format!("{}:{}", stack_id(tree, dep.target_stack), output_id);

        exports.insert(
            key,
            Export {
                producer_stack: dep.target_stack,
                value: local_ref(tree, dep.target, dep.attribute.as_deref()),
                output_id,
                export_name,
            },
        );
    }
    Ok(exports)
}

fn render_pipeline(tree: &ConstructTree, member: NodeId, definition: &PipelineDefinition) -> Value {
    let source = match &definition.source {
        SourceSpec::GitHub {
            owner,
            repo,
            branch,
            oauth_token,
        } => json!({
            "Provider": "GitHub",
            "Owner": owner,
            "Repo": repo,
            "Branch": branch,
            "OAuthToken": oauth_token.dynamic_reference(),
        }),
        SourceSpec::Local { path } => json!({
            "Provider": "Local",
            "Path": path,
        }),
    };

    let synth = &definition.synth;
    let policies: Vec<Value> = synth
        .policies
        .iter()
        .map(|p| {
            json!({
                "Effect": p.effect,
                "Action": p.actions,
                "Resource": p.resources,
            })
        })
        .collect();

    json!({
        "Type": infrakit_core::ResourceKind::PIPELINE,
        "Properties": {
            "Source": source,
            "Synth": {
                "InstallCommands": synth.install_commands,
                "SynthCommand": synth.synth_command,
                "AppFile": synth.app_file,
                "OutputDir": synth.output_dir,
                "Image": synth.image,
                "Privileged": synth.privileged,
                "Environment": synth.env,
                "Policies": policies,
            },
            "Stages": definition.stages,
            "SelfMutating": definition.self_mutating,
        },
        "Metadata": { PATH_METADATA_KEY: tree.path(member).to_string() },
    })
}

/// Stack name: construct path joined with `-`.
pub fn stack_id(tree: &ConstructTree, stack: NodeId) -> String {
    tree.path(stack).to_dashed()
}

/// Logical id of a stack member, from its path relative to the stack.
pub fn member_logical_id(tree: &ConstructTree, member: NodeId) -> String {
    let path = tree.path(member);
    match tree.enclosing_stack(member) {
        Some(stack) => {
            let stack_path = tree.path(stack);
            logical_id(path.strip_prefix(&stack_path).unwrap_or(path.components()))
        }
        None => logical_id(path.components()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrakit_core::asset::BundlingOptions;
    use infrakit_core::pipeline::{PolicyEffect, PolicyStatement, SynthSpec};
    use infrakit_core::secret::SecretRef;
    use infrakit_core::ResourceKind;
    use crate::SynthError;

    fn sha256_hex(input: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(input))
    }

    fn function(id: &str, hash_seed: &str, extra: &str) -> Resource {
        let mut asset = Asset::new("code");
        asset.bundling = Some(BundlingOptions {
            image: "public.ecr.aws/sam/build-python3.8".to_string(),
            command: vec![
                "bash".to_string(),
                "-c".to_string(),
                format!("cp -r /asset-input/* /asset-output/{}", extra),
            ],
            environment: Default::default(),
        });
        asset.source_hash = Some(hash_seed.to_string());

        Resource::new(id, ResourceKind::function())
            .with_property("handler", "hello.world")
            .with_property("runtime", "python3.8")
            .with_property("code", PropertyValue::Asset(asset))
    }

    /// The asset-test app: a pipeline stack deploying one stage with two functions.
    fn asset_test_app() -> ConstructTree {
        let mut tree = ConstructTree::new("asset-test");
        let pipeline_stack = tree.add_stack(tree.root(), "pipelinestack").unwrap();
        let stage = tree.add_stage(pipeline_stack, "stage").unwrap();
        let stack = tree.add_stack(stage, "stack").unwrap();
        tree.add_resource(stack, function("hello", "hello-hash", "")).unwrap();
        tree.add_resource(stack, function("world", "world-hash", " && touch /asset-output/foo.py"))
            .unwrap();

        let definition = PipelineDefinition {
            source: SourceSpec::GitHub {
                owner: "amirfireeye".to_string(),
                repo: "asset-test".to_string(),
                branch: "master".to_string(),
                oauth_token: SecretRef::new("asset-test").with_field("github_token"),
            },
            synth: SynthSpec {
                install_commands: vec!["pip install poetry".to_string()],
                synth_command: Some("poetry run infrakit synth".to_string()),
                privileged: true,
                policies: vec![PolicyStatement {
                    effect: PolicyEffect::Allow,
                    actions: vec![
                        "secretsmanager:ListSecrets".to_string(),
                        "secretsmanager:GetSecretValue".to_string(),
                    ],
                    resources: vec!["*".to_string()],
                }],
                ..Default::default()
            },
            stages: vec!["pipelinestack/stage".to_string()],
            self_mutating: true,
        };
        tree.add_pipeline(pipeline_stack, "pipeline", definition).unwrap();
        tree
    }

    #[test]
    fn test_asset_test_snapshot() {
        let tree = asset_test_app();
        let assembly = Synthesizer::new(".").synthesize(&tree).unwrap();

        // Root assembly: only the pipeline stack, plus the nested stage.
        assert_eq!(assembly.stacks.len(), 1);
        let pipeline_stack = &assembly.stacks[0];
        assert_eq!(pipeline_stack.id, "pipelinestack");
        assert_eq!(pipeline_stack.logical_ids(), vec!["pipeline"]);
        assert!(pipeline_stack.assets.is_empty());

        let pipeline = pipeline_stack.resource("pipeline").unwrap();
        assert_eq!(pipeline["Type"], "infrakit::pipeline");
        assert_eq!(pipeline["Properties"]["Source"]["Owner"], "amirfireeye");
        assert_eq!(pipeline["Properties"]["Source"]["Branch"], "master");
        assert_eq!(
            pipeline["Properties"]["Source"]["OAuthToken"],
            "{{resolve:secretsmanager:asset-test:SecretString:github_token}}"
        );
        assert_eq!(pipeline["Properties"]["Synth"]["Privileged"], true);
        assert_eq!(
            pipeline["Properties"]["Synth"]["Policies"][0]["Effect"],
            "Allow"
        );
        assert_eq!(pipeline["Properties"]["Stages"][0], "pipelinestack/stage");

        assert_eq!(assembly.nested.len(), 1);
        let stage = &assembly.nested[0];
        assert_eq!(stage.directory.as_deref(), Some("assembly-pipelinestack-stage"));
        assert_eq!(stage.display_name, "pipelinestack/stage");

        let stack = &stage.stacks[0];
        assert_eq!(stack.id, "pipelinestack-stage-stack");
        assert_eq!(stack.template_file, "pipelinestack-stage-stack.template.json");
        assert_eq!(stack.logical_ids(), vec!["hello", "world"]);

        let hello = stack.resource("hello").unwrap();
        assert_eq!(hello["Type"], "infrakit::function");
        assert_eq!(hello["Properties"]["handler"], "hello.world");
        assert_eq!(hello["Properties"]["runtime"], "python3.8");
        assert_eq!(hello["Properties"]["code"]["AssetHash"], sha256_hex(b"hello-hash"));
        assert_eq!(hello["Metadata"][PATH_METADATA_KEY], "pipelinestack/stage/stack/hello");

        // Distinct custom hashes give distinct assets.
        assert_eq!(stack.assets.len(), 2);
        assert_ne!(stack.assets[0].hash, stack.assets[1].hash);
        assert_eq!(
            stack.assets_file().as_deref(),
            Some("pipelinestack-stage-stack.assets.json")
        );
        let manifest = stack.asset_manifest();
        let key = &stack.assets[0].hash;
        assert_eq!(
            manifest["files"][key]["source"]["path"],
            format!("asset.{}", key)
        );
    }

    #[test]
    fn test_locate_nested_stack() {
        let tree = asset_test_app();
        let assembly = Synthesizer::new(".").synthesize(&tree).unwrap();

        let (dir, stack) = assembly.locate("pipelinestack/stage/stack").unwrap();
        assert_eq!(dir, "assembly-pipelinestack-stage");
        assert_eq!(stack.id, "pipelinestack-stage-stack");

        let (dir, _) = assembly.locate("pipelinestack").unwrap();
        assert_eq!(dir, "");
        assert!(assembly.locate("nope").is_none());
        assert_eq!(assembly.all_stacks().len(), 2);

        let manifest = assembly.manifest();
        assert_eq!(manifest.stacks().count(), 1);
        assert_eq!(manifest.nested_assemblies().count(), 1);
    }

    #[test]
    fn test_cross_stack_reference_renders_export() {
        let mut tree = ConstructTree::new("app");
        let stage = tree.add_stage(tree.root(), "prod").unwrap();
        let api = tree.add_stack(stage, "api").unwrap();
        let data = tree.add_stack(stage, "data").unwrap();
        tree.add_resource(data, Resource::new("table", ResourceKind::new("infrakit::table")))
            .unwrap();
        tree.add_resource(
            api,
            Resource::new("handler", ResourceKind::function())
                .with_property("tableArn", PropertyValue::attribute("/prod/data/table", "Arn"))
                .with_property("sibling", PropertyValue::reference("worker")),
        )
        .unwrap();
        tree.add_resource(api, Resource::new("worker", ResourceKind::function()))
            .unwrap();

        let assembly = Synthesizer::new(".").synthesize(&tree).unwrap();
        let prod = assembly.nested_assembly("prod").unwrap();

        // data is deployed before api.
        let ids: Vec<&str> = prod.stacks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["prod-data", "prod-api"]);

        let api_stack = &prod.stacks[1];
        assert_eq!(api_stack.dependencies, vec!["prod-data"]);
        assert_eq!(api_stack.logical_ids(), vec!["worker", "handler"]);

        let handler = api_stack.resource("handler").unwrap();
        assert_eq!(
            handler["Properties"]["tableArn"],
            json!({ "Fn::ImportValue": "prod-data:ExporttableArn" })
        );
        assert_eq!(handler["Properties"]["sibling"], json!({ "Ref": "worker" }));

        let data_stack = &prod.stacks[0];
        assert_eq!(
            data_stack.template["Outputs"]["ExporttableArn"],
            json!({
                "Value": { "Fn::GetAtt": ["table", "Arn"] },
                "Export": { "Name": "prod-data:ExporttableArn" },
            })
        );
    }

    #[test]
    fn test_depends_on_and_secrets() {
        let mut tree = ConstructTree::new("app");
        let stack = tree.add_stack(tree.root(), "stack").unwrap();
        tree.add_resource(stack, Resource::new("db", ResourceKind::new("infrakit::database")))
            .unwrap();
        tree.add_resource(
            stack,
            Resource::new("migrate", ResourceKind::function())
                .with_property(
                    "password",
                    PropertyValue::Secret(SecretRef::new("db").with_field("password")),
                )
                .with_dependency("db"),
        )
        .unwrap();

        let assembly = Synthesizer::new(".").synthesize(&tree).unwrap();
        let migrate = assembly.stacks[0].resource("migrate").unwrap();
        assert_eq!(migrate["DependsOn"], json!(["db"]));
        assert_eq!(
            migrate["Properties"]["password"],
            "{{resolve:secretsmanager:db:SecretString:password}}"
        );
    }

    #[test]
    fn test_logical_id_collision() {
        let mut tree = ConstructTree::new("app");
        let stack = tree.add_stack(tree.root(), "stack").unwrap();
        tree.add_resource(stack, Resource::new("my-fn", ResourceKind::function()))
            .unwrap();
        tree.add_resource(stack, Resource::new("myfn", ResourceKind::function()))
            .unwrap();

        let err = Synthesizer::new(".").synthesize(&tree).unwrap_err();
        assert!(matches!(err, SynthError::Core(Error::InvalidInput(_))));
    }

    #[test]
    fn test_stack_names_must_not_collide() {
        let mut tree = ConstructTree::new("app");
        let a = tree.add_stack(tree.root(), "a").unwrap();
        tree.add_stack(a, "b").unwrap();
        tree.add_stack(tree.root(), "a-b").unwrap();

        let err = Synthesizer::new(".").synthesize(&tree).unwrap_err();
        match err {
            SynthError::Core(Error::InvalidInput(message)) => {
                assert!(message.contains("'a/b' and 'a-b'"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_stage_directories_must_not_collide() {
        let mut tree = ConstructTree::new("app");
        let a = tree.add_stage(tree.root(), "a").unwrap();
        tree.add_stage(a, "b").unwrap();
        tree.add_stage(tree.root(), "a-b").unwrap();

        let err = Synthesizer::new(".").synthesize(&tree).unwrap_err();
        assert!(matches!(err, SynthError::Core(Error::InvalidInput(_))));
    }

    #[test]
    fn test_export_names_must_not_collide() {
        let mut tree = ConstructTree::new("app");
        let data = tree.add_stack(tree.root(), "data").unwrap();
        let api = tree.add_stack(tree.root(), "api").unwrap();
        tree.add_resource(data, Resource::new("table", ResourceKind::new("infrakit::table")))
            .unwrap();
        tree.add_resource(
            api,
            Resource::new("handler", ResourceKind::function())
                .with_property("arn", PropertyValue::attribute("/data/table", "Arn"))
                .with_property("other", PropertyValue::attribute("/data/table", "A-rn")),
        )
        .unwrap();

        let err = Synthesizer::new(".").synthesize(&tree).unwrap_err();
        match err {
            SynthError::Core(Error::InvalidInput(message)) => {
                assert!(message.contains("ExporttableArn"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let tree = asset_test_app();
        let first = Synthesizer::new(".").synthesize(&tree).unwrap();
        let second = Synthesizer::new(".").synthesize(&tree).unwrap();
        assert_eq!(
            serde_json::to_string(&first.nested[0].stacks[0].template).unwrap(),
            serde_json::to_string(&second.nested[0].stacks[0].template).unwrap()
        );
    }
}
