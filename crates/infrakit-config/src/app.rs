//! App definition parsing.
//!
//! An app definition is a KDL document with a single `app` node. Scopes nest
//! the same way constructs do:
//!
//! ```kdl
//! app "asset-test" {
//!     stack "pipelinestack" {
//!         pipeline "pipeline" {
//!             source "github" owner="amirfireeye" repo="asset-test" branch="master" {
//!                 oauth-token "asset-test" field="github_token"
//!             }
//!             synth privileged=#true {
//!                 install "pip install poetry"
//!                 command "infrakit synth infrakit.kdl"
//!             }
//!             deploy-stage "stage"
//!         }
//!         stage "stage" {
//!             stack "stack" {
//!                 function "hello" handler="hello.world" runtime="python3.8" {
//!                     code "code"
//!                 }
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! Every string value goes through [`VariableContext::interpolate`]. Secret
//! values are not available while parsing: `${secrets.*}` is kept as written
//! in pipeline commands and environment, and rejected anywhere that ends up
//! in a template or asset.

use crate::{ConfigError, ConfigResult, VariableContext};
use infrakit_core::asset::{Asset, BundlingOptions};
use infrakit_core::pipeline::{
    PipelineDefinition, PolicyEffect, PolicyStatement, SourceSpec, SynthSpec,
};
use infrakit_core::secret::SecretRef;
use infrakit_core::{ConstructPath, ConstructTree, NodeId, PropertyValue, Resource, ResourceKind};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Parse an app definition from KDL text.
pub fn parse_app(kdl: &str, vars: &VariableContext) -> ConfigResult<ConstructTree> {
    let doc: KdlDocument = kdl.parse()?;

    let mut apps = doc.nodes().iter().filter(|n| n.name().value() == "app");
    let app = apps
        .next()
        .ok_or_else(|| ConfigError::MissingField("app".to_string()))?;
    if apps.next().is_some() {
        return Err(ConfigError::Duplicate("app".to_string()));
    }

    let name = get_first_string_arg(app)
        .ok_or_else(|| ConfigError::MissingField("app name".to_string()))?;

    let mut vars = vars.without_secrets();
    if vars.app.name.is_empty() {
        vars.app.name = name.clone();
    }

    let mut tree = ConstructTree::new(name);
    if let Some(children) = app.children() {
        let root = tree.root();
        parse_scope(&mut tree, root, children, &vars)?;
    }

    debug!(app = %tree.app_id(), constructs = tree.len(), "Parsed app definition");
    Ok(tree)
}

/// Read and parse an app definition file. `${app.dir}` is set to the
/// file's directory unless the context already has one.
pub fn load_app(path: &Path, vars: &VariableContext) -> ConfigResult<ConstructTree> {
    let kdl = std::fs::read_to_string(path)?;
    let mut vars = vars.clone();
    if vars.app.dir.is_empty() {
        vars.app.dir = path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
    }
    parse_app(&kdl, &vars)
}

fn parse_scope(
    tree: &mut ConstructTree,
    scope: NodeId,
    doc: &KdlDocument,
    vars: &VariableContext,
) -> ConfigResult<()> {
    for node in doc.nodes() {
        match node.name().value() {
            "stage" => {
                let id = required_id(node, "stage")?;
                let stage = tree.add_stage(scope, &id)?;
                if let Some(children) = node.children() {
                    parse_scope(tree, stage, children, vars)?;
                }
            }
            "stack" => {
                let id = required_id(node, "stack")?;
                let stack = tree.add_stack(scope, &id)?;
                if let Some(children) = node.children() {
                    parse_scope(tree, stack, children, vars)?;
                }
            }
            "resource" => {
                let resource = parse_resource(node, vars)?;
                tree.add_resource(scope, resource)?;
            }
            "function" => {
                let resource = parse_function(node, vars)?;
                tree.add_resource(scope, resource)?;
            }
            "pipeline" => {
                let id = required_id(node, "pipeline")?;
                let definition = parse_pipeline(&tree.path(scope), node, vars)?;
                tree.add_pipeline(scope, &id, definition)?;
            }
            other => {
                return Err(ConfigError::UnknownNode {
                    node: other.to_string(),
                    context: format!(
                        "{} '{}'",
                        tree.node(scope).kind.label(),
                        tree.display_path(scope)
                    ),
                });
            }
        }
    }
    Ok(())
}

fn parse_resource(node: &KdlNode, vars: &VariableContext) -> ConfigResult<Resource> {
    let id = required_id(node, "resource")?;
    let kind = get_string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("kind for resource '{}'", id)))?;

    let mut resource = Resource::new(id, ResourceKind::new(kind));
    if let Some(children) = node.children() {
        for child in children.nodes() {
            parse_member(&mut resource, child, vars)?;
        }
    }
    Ok(resource)
}

/// `function` is a resource of the function kind with a handler, a runtime
/// and a code asset.
fn parse_function(node: &KdlNode, vars: &VariableContext) -> ConfigResult<Resource> {
    let id = required_id(node, "function")?;
    let handler = get_string_prop(node, "handler")
        .ok_or_else(|| ConfigError::MissingField(format!("handler for function '{}'", id)))?;
    let runtime = get_string_prop(node, "runtime")
        .ok_or_else(|| ConfigError::MissingField(format!("runtime for function '{}'", id)))?;

    let mut resource = Resource::new(id.clone(), ResourceKind::function())
        .with_property("handler", vars.interpolate_public("handler", &handler)?)
        .with_property("runtime", vars.interpolate_public("runtime", &runtime)?);

    let mut has_code = false;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "code" {
                let path = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField(format!("code path for function '{}'", id)))?;
                let asset = parse_asset(child, vars.interpolate_public("code", &path)?, vars)?;
                let previous = resource
                    .properties
                    .insert("code".to_string(), PropertyValue::Asset(asset));
                if previous.is_some() {
                    return Err(ConfigError::Duplicate(format!("code for function '{}'", id)));
                }
                has_code = true;
            } else {
                parse_member(&mut resource, child, vars)?;
            }
        }
    }

    if !has_code {
        return Err(ConfigError::MissingField(format!("code for function '{}'", id)));
    }
    Ok(resource)
}

/// Property, reference, secret, asset and dependency nodes inside a resource.
fn parse_member(resource: &mut Resource, node: &KdlNode, vars: &VariableContext) -> ConfigResult<()> {
    let field = || format!("{} in resource '{}'", node.name().value(), resource.id);

    match node.name().value() {
        "depends-on" => {
            let targets = get_all_string_args(node);
            if targets.is_empty() {
                return Err(ConfigError::MissingField(field()));
            }
            resource
                .depends_on
                .extend(vars.interpolate_public_vec("depends-on", &targets)?);
            return Ok(());
        }
        "prop" | "ref" | "secret" | "asset" => {}
        other => {
            return Err(ConfigError::UnknownNode {
                node: other.to_string(),
                context: format!("resource '{}'", resource.id),
            });
        }
    }

    let args = positional_args(node);
    let key = args
        .first()
        .and_then(|v| v.as_string())
        .map(String::from)
        .ok_or_else(|| ConfigError::MissingField(format!("key of {}", field())))?;

    let value = match node.name().value() {
        "prop" => parse_prop_value(node, &args[1..], vars)?,
        "ref" => {
            let target = string_at(&args, 1).ok_or_else(|| {
                ConfigError::MissingField(format!("target of ref '{}' in resource '{}'", key, resource.id))
            })?;
            PropertyValue::Ref {
                target: vars.interpolate_public("ref", &target)?,
                attribute: get_string_prop(node, "attr"),
            }
        }
        "secret" => {
            let secret_id = string_at(&args, 1).ok_or_else(|| {
                ConfigError::MissingField(format!("secret id of '{}' in resource '{}'", key, resource.id))
            })?;
            PropertyValue::Secret(parse_secret_ref(
                node,
                vars.interpolate_public("secret", &secret_id)?,
            ))
        }
        _ => {
            let path = string_at(&args, 1).ok_or_else(|| {
                ConfigError::MissingField(format!("asset path of '{}' in resource '{}'", key, resource.id))
            })?;
            PropertyValue::Asset(parse_asset(node, vars.interpolate_public("asset", &path)?, vars)?)
        }
    };

    if resource.properties.insert(key.clone(), value).is_some() {
        return Err(ConfigError::Duplicate(format!(
            "property '{}' in resource '{}'",
            key, resource.id
        )));
    }
    Ok(())
}

/// `prop "key" value`, `prop "key" a b c` (list) or `prop "key" { prop ... }` (map).
fn parse_prop_value(
    node: &KdlNode,
    values: &[&KdlValue],
    vars: &VariableContext,
) -> ConfigResult<PropertyValue> {
    if let Some(children) = node.children() {
        let mut map = BTreeMap::new();
        for child in children.nodes() {
            if child.name().value() != "prop" {
                return Err(ConfigError::UnknownNode {
                    node: child.name().value().to_string(),
                    context: "map property".to_string(),
                });
            }
            let args = positional_args(child);
            let key = string_at(&args, 0)
                .ok_or_else(|| ConfigError::MissingField("map property key".to_string()))?;
            map.insert(key, parse_prop_value(child, &args[1..], vars)?);
        }
        return Ok(PropertyValue::Map(map));
    }

    match values {
        [] => Err(ConfigError::MissingField("property value".to_string())),
        [single] => scalar(single, vars),
        many => Ok(PropertyValue::List(
            many.iter()
                .map(|v| scalar(v, vars))
                .collect::<ConfigResult<Vec<_>>>()?,
        )),
    }
}

fn scalar(value: &KdlValue, vars: &VariableContext) -> ConfigResult<PropertyValue> {
    if let Some(s) = value.as_string() {
        return Ok(PropertyValue::String(vars.interpolate_public("property", s)?));
    }
    if let Some(b) = value.as_bool() {
        return Ok(PropertyValue::Bool(b));
    }
    if let Some(i) = value.as_integer() {
        let n = i64::try_from(i).map_err(|_| ConfigError::InvalidValue {
            field: "property".to_string(),
            message: format!("integer {} out of range", i),
        })?;
        return Ok(PropertyValue::Number(n));
    }
    Err(ConfigError::InvalidValue {
        field: "property".to_string(),
        message: format!("unsupported value {}", value),
    })
}

fn parse_secret_ref(node: &KdlNode, secret_id: String) -> SecretRef {
    let reference = SecretRef::new(secret_id);
    match get_string_prop(node, "field") {
        Some(field) => reference.with_field(field),
        None => reference,
    }
}

/// Asset options: `source-hash=` and an optional `bundling` child.
fn parse_asset(node: &KdlNode, path: String, vars: &VariableContext) -> ConfigResult<Asset> {
    let mut asset = Asset::new(path);
    asset.source_hash = get_string_prop(node, "source-hash")
        .map(|h| vars.interpolate_public("source-hash", &h))
        .transpose()?;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "bundling" => {
                    if asset.bundling.is_some() {
                        return Err(ConfigError::Duplicate(format!(
                            "bundling for asset '{}'",
                            asset.path
                        )));
                    }
                    asset.bundling = Some(parse_bundling(child, vars)?);
                }
                other => {
                    return Err(ConfigError::UnknownNode {
                        node: other.to_string(),
                        context: format!("asset '{}'", asset.path),
                    });
                }
            }
        }
    }
    Ok(asset)
}

fn parse_bundling(node: &KdlNode, vars: &VariableContext) -> ConfigResult<BundlingOptions> {
    let image = get_string_prop(node, "image")
        .ok_or_else(|| ConfigError::MissingField("bundling image".to_string()))?;

    let mut command: Option<Vec<String>> = None;
    let mut environment: Option<BTreeMap<String, String>> = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "command" => {
                    let args = vars.interpolate_public_vec("bundling command", &get_all_string_args(child))?;
                    if command.replace(args).is_some() {
                        return Err(ConfigError::Duplicate("bundling command".to_string()));
                    }
                }
                "env" => {
                    let env = vars.interpolate_public_map("bundling env", &parse_env(child))?;
                    if environment.replace(env).is_some() {
                        return Err(ConfigError::Duplicate("bundling env".to_string()));
                    }
                }
                other => {
                    return Err(ConfigError::UnknownNode {
                        node: other.to_string(),
                        context: "bundling".to_string(),
                    });
                }
            }
        }
    }

    let command = command.unwrap_or_default();
    if command.is_empty() {
        return Err(ConfigError::MissingField("bundling command".to_string()));
    }

    Ok(BundlingOptions {
        image: vars.interpolate_public("bundling image", &image)?,
        command,
        environment: environment.unwrap_or_default(),
    })
}

fn parse_pipeline(
    stack_path: &ConstructPath,
    node: &KdlNode,
    vars: &VariableContext,
) -> ConfigResult<PipelineDefinition> {
    let self_mutating = get_bool_prop(node, "self-mutating").unwrap_or(true);

    let mut source = None;
    let mut synth = None;
    let mut stages = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "source" => {
                    if source.is_some() {
                        return Err(ConfigError::Duplicate("pipeline source".to_string()));
                    }
                    source = Some(parse_source(child, vars)?);
                }
                "synth" => {
                    if synth.is_some() {
                        return Err(ConfigError::Duplicate("pipeline synth".to_string()));
                    }
                    synth = Some(parse_synth(child, vars)?);
                }
                "deploy-stage" => {
                    for target in get_all_string_args(child) {
                        stages.push(stage_path(stack_path, &vars.interpolate(&target)));
                    }
                }
                other => {
                    return Err(ConfigError::UnknownNode {
                        node: other.to_string(),
                        context: "pipeline".to_string(),
                    });
                }
            }
        }
    }

    Ok(PipelineDefinition {
        source: source.ok_or_else(|| ConfigError::MissingField("pipeline source".to_string()))?,
        synth: synth.unwrap_or_default(),
        stages,
        self_mutating,
    })
}

/// Stage targets are relative to the pipeline's stack unless absolute.
fn stage_path(stack_path: &ConstructPath, target: &str) -> String {
    let relative = ConstructPath::parse(target);
    if target.starts_with(ConstructPath::SEPARATOR) {
        return relative.to_string();
    }
    relative
        .components()
        .iter()
        .fold(stack_path.clone(), |path, c| path.child(c))
        .to_string()
}

fn parse_source(node: &KdlNode, vars: &VariableContext) -> ConfigResult<SourceSpec> {
    let provider = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("source provider".to_string()))?;
    let prop = |name: &str| get_string_prop(node, name).map(|v| vars.interpolate(&v));

    match provider.as_str() {
        "github" => {
            let token = node
                .children()
                .and_then(|c| c.get("oauth-token"))
                .ok_or_else(|| ConfigError::MissingField("oauth-token for github source".to_string()))?;
            let secret_id = get_first_string_arg(token)
                .ok_or_else(|| ConfigError::MissingField("oauth-token secret id".to_string()))?;

            Ok(SourceSpec::GitHub {
                owner: prop("owner")
                    .ok_or_else(|| ConfigError::MissingField("github source owner".to_string()))?,
                repo: prop("repo")
                    .ok_or_else(|| ConfigError::MissingField("github source repo".to_string()))?,
                branch: prop("branch").unwrap_or_else(|| "main".to_string()),
                oauth_token: parse_secret_ref(token, vars.interpolate(&secret_id)),
            })
        }
        "local" => Ok(SourceSpec::Local {
            path: prop("path").unwrap_or_else(|| ".".to_string()),
        }),
        other => Err(ConfigError::InvalidValue {
            field: "source provider".to_string(),
            message: format!("unknown source provider: {}", other),
        }),
    }
}

fn parse_synth(node: &KdlNode, vars: &VariableContext) -> ConfigResult<SynthSpec> {
    let mut synth = SynthSpec {
        privileged: get_bool_prop(node, "privileged").unwrap_or(false),
        image: get_string_prop(node, "image").map(|v| vars.interpolate(&v)),
        ..Default::default()
    };
    if let Some(app) = get_string_prop(node, "app") {
        synth.app_file = vars.interpolate(&app);
    }
    if let Some(output) = get_string_prop(node, "output") {
        synth.output_dir = vars.interpolate(&output);
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "install" => {
                    synth
                        .install_commands
                        .extend(vars.interpolate_vec(&get_all_string_args(child)));
                }
                "command" => {
                    synth.synth_command = get_first_string_arg(child).map(|c| vars.interpolate(&c));
                }
                "env" => synth.env = vars.interpolate_map(&parse_env(child)),
                "policy" => synth.policies.push(parse_policy(child)?),
                other => {
                    return Err(ConfigError::UnknownNode {
                        node: other.to_string(),
                        context: "synth".to_string(),
                    });
                }
            }
        }
    }
    Ok(synth)
}

fn parse_policy(node: &KdlNode) -> ConfigResult<PolicyStatement> {
    let effect = match get_first_string_arg(node) {
        Some(effect) => effect
            .parse::<PolicyEffect>()
            .map_err(|message| ConfigError::InvalidValue {
                field: "policy effect".to_string(),
                message,
            })?,
        None => PolicyEffect::Allow,
    };

    let actions = get_string_list_prop(node, "action");
    if actions.is_empty() {
        return Err(ConfigError::MissingField("policy action".to_string()));
    }
    let mut resources = get_string_list_prop(node, "resource");
    if resources.is_empty() {
        resources.push("*".to_string());
    }

    Ok(PolicyStatement {
        effect,
        actions,
        resources,
    })
}

/// `env { KEY "value" }` blocks.
fn parse_env(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

fn required_id(node: &KdlNode, what: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(format!("{} id", what)))
}

// Helper functions for extracting values from KDL nodes

fn positional_args(node: &KdlNode) -> Vec<&KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
        .collect()
}

fn string_at(args: &[&KdlValue], index: usize) -> Option<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// Values of a repeated property or of same-named child nodes.
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(get_all_string_args(child));
            }
        }
    }

    result
}
