//! `infrakit ls`.

use super::Project;
use anyhow::Result;
use infrakit_core::{ConstructKind, ConstructTree, NodeId};
use infrakit_synth::{member_logical_id, stack_id};

pub fn list(project: &Project) -> Result<()> {
    let tree = project.load()?;
    for line in render(&tree) {
        println!("{}", line);
    }
    Ok(())
}

/// One line per construct, indented by depth.
fn render(tree: &ConstructTree) -> Vec<String> {
    tree.walk()
        .into_iter()
        .map(|id| {
            let indent = "  ".repeat(tree.ancestors(id).len());
            format!("{}{}", indent, describe(tree, id))
        })
        .collect()
}

fn describe(tree: &ConstructTree, id: NodeId) -> String {
    let node = tree.node(id);
    match &node.kind {
        ConstructKind::App => format!("app {}", node.id),
        ConstructKind::Stage => format!("stage {}", node.id),
        ConstructKind::Stack => format!("stack {} ({})", node.id, stack_id(tree, id)),
        ConstructKind::Resource(resource) => format!(
            "{} [{}] {}",
            node.id,
            member_logical_id(tree, id),
            resource.kind.as_str()
        ),
        ConstructKind::Pipeline(definition) => format!(
            "{} [{}] pipeline from {}",
            node.id,
            member_logical_id(tree, id),
            definition.source.describe()
        ),
    }
}
