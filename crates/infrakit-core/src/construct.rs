//! The construct tree: App → Stage → Stack → Resource.
//!
//! Constructs are stored in an arena and addressed by [`NodeId`]. The tree
//! is built once and never mutated afterwards: there is no removal or
//! re-parenting. Every construct id is unique among its siblings, which
//! makes the `/`-joined path from the root a stable address.

use serde::{Deserialize, Serialize};

use crate::id::ConstructPath;
use crate::pipeline::PipelineDefinition;
use crate::resource::Resource;
use crate::{Error, Result};

/// Index of a construct in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What a construct is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstructKind {
    App,
    /// Environment-scoped group of stacks, synthesized as a nested assembly.
    Stage,
    /// Deployable unit of resources.
    Stack,
    Resource(Resource),
    Pipeline(PipelineDefinition),
}

impl ConstructKind {
    pub fn label(&self) -> &'static str {
        match self {
            ConstructKind::App => "app",
            ConstructKind::Stage => "stage",
            ConstructKind::Stack => "stack",
            ConstructKind::Resource(_) => "resource",
            ConstructKind::Pipeline(_) => "pipeline",
        }
    }

    fn is_scope(&self) -> bool {
        matches!(
            self,
            ConstructKind::App | ConstructKind::Stage | ConstructKind::Stack
        )
    }
}

/// A node of the construct tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructNode {
    pub id: String,
    pub kind: ConstructKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl ConstructNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn resource(&self) -> Option<&Resource> {
        match &self.kind {
            ConstructKind::Resource(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn pipeline(&self) -> Option<&PipelineDefinition> {
        match &self.kind {
            ConstructKind::Pipeline(pipeline) => Some(pipeline),
            _ => None,
        }
    }
}

/// Arena-backed construct tree rooted at the App.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructTree {
    nodes: Vec<ConstructNode>,
}

impl ConstructTree {
    /// Create a tree containing only the App root.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            nodes: vec![ConstructNode {
                id: app_id.into(),
                kind: ConstructKind::App,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn app_id(&self) -> &str {
        &self.nodes[0].id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn node(&self, id: NodeId) -> &ConstructNode {
        &self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// Add a Stage under the App, a Stage or a Stack.
    pub fn add_stage(&mut self, parent: NodeId, id: &str) -> Result<NodeId> {
        self.require_scope(parent, "stage")?;
        self.add_child(parent, id, ConstructKind::Stage)
    }

    /// Add a Stack under the App, a Stage or another Stack.
    pub fn add_stack(&mut self, parent: NodeId, id: &str) -> Result<NodeId> {
        self.require_scope(parent, "stack")?;
        self.add_child(parent, id, ConstructKind::Stack)
    }

    /// Add a resource directly under a Stack.
    pub fn add_resource(&mut self, stack: NodeId, resource: Resource) -> Result<NodeId> {
        self.require_stack(stack, "resource")?;
        let id = resource.id.clone();
        self.add_child(stack, &id, ConstructKind::Resource(resource))
    }

    /// Add a pipeline declaration directly under a Stack.
    pub fn add_pipeline(
        &mut self,
        stack: NodeId,
        id: &str,
        definition: PipelineDefinition,
    ) -> Result<NodeId> {
        self.require_stack(stack, "pipeline")?;
        self.add_child(stack, id, ConstructKind::Pipeline(definition))
    }

    fn require_scope(&self, parent: NodeId, what: &str) -> Result<()> {
        if self.nodes[parent.0].kind.is_scope() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "a {} cannot be added under {} '{}'",
                what,
                self.nodes[parent.0].kind.label(),
                self.path(parent)
            )))
        }
    }

    fn require_stack(&self, parent: NodeId, what: &str) -> Result<()> {
        if matches!(self.nodes[parent.0].kind, ConstructKind::Stack) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "a {} must be added under a stack, not {} '{}'",
                what,
                self.nodes[parent.0].kind.label(),
                self.path(parent)
            )))
        }
    }

    fn add_child(&mut self, parent: NodeId, id: &str, kind: ConstructKind) -> Result<NodeId> {
        if id.is_empty() || id.contains(ConstructPath::SEPARATOR) {
            return Err(Error::InvalidInput(format!(
                "construct id '{}' must be non-empty and must not contain '/'",
                id
            )));
        }

        let duplicate = self.nodes[parent.0]
            .children
            .iter()
            .any(|child| self.nodes[child.0].id == id);
        if duplicate {
            return Err(Error::DuplicateId {
                parent: self.display_path(parent),
                id: id.to_string(),
            });
        }

        let node_id = NodeId(self.nodes.len());
        self.nodes.push(ConstructNode {
            id: id.to_string(),
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(node_id);
        Ok(node_id)
    }

    /// Path from the root, excluding the App id.
    pub fn path(&self, id: NodeId) -> ConstructPath {
        let mut components = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            if node.parent.is_some() {
                components.push(node.id.clone());
            }
            current = node.parent;
        }
        components.reverse();
        ConstructPath::parse(&components.join("/"))
    }

    /// Human-readable path, `<app>` for the root.
    pub fn display_path(&self, id: NodeId) -> String {
        let path = self.path(id);
        if path.is_root() {
            format!("<{}>", self.app_id())
        } else {
            path.to_string()
        }
    }

    /// Find a construct by path from the root.
    pub fn find(&self, path: &ConstructPath) -> Option<NodeId> {
        self.find_from(self.root(), path.components())
    }

    /// Find a construct by path components relative to `scope`.
    pub fn find_from<S: AsRef<str>>(&self, scope: NodeId, components: &[S]) -> Option<NodeId> {
        let mut current = scope;
        for component in components {
            current = *self.nodes[current.0]
                .children
                .iter()
                .find(|child| self.nodes[child.0].id == component.as_ref())?;
        }
        Some(current)
    }

    /// Resolve a reference target as written in a property of a construct
    /// under `stack`: absolute when it starts with `/`, stack-relative otherwise.
    pub fn resolve_target(&self, stack: NodeId, target: &str) -> Option<NodeId> {
        let path = ConstructPath::parse(target);
        if target.starts_with(ConstructPath::SEPARATOR) {
            self.find(&path)
        } else {
            self.find_from(stack, path.components())
        }
    }

    /// Pre-order traversal, children in insertion order.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut pending = vec![self.root()];
        while let Some(id) = pending.pop() {
            order.push(id);
            pending.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// All stacks, in traversal order.
    pub fn stacks(&self) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, ConstructKind::Stack))
            .collect()
    }

    /// All stages, in traversal order.
    pub fn stages(&self) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, ConstructKind::Stage))
            .collect()
    }

    /// Nearest strict ancestor that is a Stack.
    pub fn enclosing_stack(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id)
            .into_iter()
            .find(|a| matches!(self.nodes[a.0].kind, ConstructKind::Stack))
    }

    /// Nearest strict ancestor that is a Stage. `None` means the construct
    /// belongs to the App's top-level assembly.
    pub fn enclosing_stage(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id)
            .into_iter()
            .find(|a| matches!(self.nodes[a.0].kind, ConstructKind::Stage))
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut current = self.nodes[id.0].parent;
        while let Some(node_id) = current {
            result.push(node_id);
            current = self.nodes[node_id.0].parent;
        }
        result
    }

    /// Resources and pipelines directly owned by a stack.
    pub fn stack_members(&self, stack: NodeId) -> Vec<NodeId> {
        self.nodes[stack.0]
            .children
            .iter()
            .copied()
            .filter(|c| {
                matches!(
                    self.nodes[c.0].kind,
                    ConstructKind::Resource(_) | ConstructKind::Pipeline(_)
                )
            })
            .collect()
    }

    /// Stacks belonging to an assembly (`None` for the App's top-level one).
    pub fn assembly_stacks(&self, stage: Option<NodeId>) -> Vec<NodeId> {
        self.stacks()
            .into_iter()
            .filter(|s| self.enclosing_stage(*s) == stage)
            .collect()
    }

    /// All pipeline declarations.
    pub fn pipelines(&self) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, ConstructKind::Pipeline(_)))
            .collect()
    }
}
