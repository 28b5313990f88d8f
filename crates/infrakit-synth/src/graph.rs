//! Resource graph: reference resolution, cycle detection and ordering.

use infrakit_core::{ConstructKind, ConstructPath, ConstructTree, Error, NodeId, Result};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// A resolved edge from a stack member to the resource it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target: NodeId,
    /// Stack owning `target`.
    pub target_stack: NodeId,
    /// Attribute read from the target (`None` for a plain reference).
    pub attribute: Option<String>,
    /// Declared through `depends_on` rather than a property reference.
    pub explicit: bool,
}

/// Directed graph of stack members (resources and pipelines) and the stack
/// dependencies derived from it.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    dependencies: BTreeMap<NodeId, Vec<Dependency>>,
    owners: BTreeMap<NodeId, NodeId>,
    stack_dependencies: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl ResourceGraph {
    /// Resolve every reference in the tree and validate the graph.
    ///
    /// Fails on unknown targets, references to constructs that are not
    /// resources, self references, references across assemblies, pipeline
    /// stages that are not Stage constructs, and cycles between resources or
    /// between stacks.
    pub fn build(tree: &ConstructTree) -> Result<Self> {
        let mut graph = ResourceGraph::default();

        for stack in tree.stacks() {
            graph.stack_dependencies.entry(stack).or_default();

            for member in tree.stack_members(stack) {
                graph.owners.insert(member, stack);
                let mut deps = Vec::new();

                match &tree.node(member).kind {
                    ConstructKind::Resource(resource) => {
                        for value in resource.properties.values() {
                            for (target, attribute) in value.references() {
                                deps.push(resolve_dependency(
                                    tree, stack, member, target, attribute, false,
                                )?);
                            }
                        }
                        for target in &resource.depends_on {
                            deps.push(resolve_dependency(tree, stack, member, target, None, true)?);
                        }
                    }
                    ConstructKind::Pipeline(definition) => {
                        for stage_path in &definition.stages {
                            let stage = tree.find(&ConstructPath::parse(stage_path));
                            match stage {
                                Some(id) if matches!(tree.node(id).kind, ConstructKind::Stage) => {}
                                _ => {
                                    return Err(Error::InvalidReference(format!(
                                        "pipeline '{}' deploys '{}' which is not a stage",
                                        tree.path(member),
                                        stage_path
                                    )));
                                }
                            }
                        }
                    }
                    _ => {}
                }

                for dep in &deps {
                    if dep.target_stack != stack {
                        graph
                            .stack_dependencies
                            .entry(stack)
                            .or_default()
                            .insert(dep.target_stack);
                    }
                }
                graph.dependencies.insert(member, deps);
            }
        }

        let name = |n: NodeId| tree.path(n).to_string();
        let members: Vec<NodeId> = graph.dependencies.keys().copied().collect();
        Ordering::new(&members, |n| {
            graph.dependencies(n).iter().map(|d| d.target).collect()
        })
        .check_acyclic(&name)?;

        let stacks: Vec<NodeId> = graph.stack_dependencies.keys().copied().collect();
        Ordering::new(&stacks, |n| graph.stack_dependencies(n)).check_acyclic(&name)?;

        debug!(
            members = members.len(),
            stacks = stacks.len(),
            "Resource graph built"
        );
        Ok(graph)
    }

    /// Resolved dependencies of a stack member.
    pub fn dependencies(&self, member: NodeId) -> &[Dependency] {
        self.dependencies
            .get(&member)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Stacks that must be deployed before `stack`.
    pub fn stack_dependencies(&self, stack: NodeId) -> Vec<NodeId> {
        self.stack_dependencies
            .get(&stack)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stack owning a member.
    pub fn owner(&self, member: NodeId) -> Option<NodeId> {
        self.owners.get(&member).copied()
    }

    /// Property references that cross stack boundaries, as
    /// `(consumer, dependency)` pairs.
    pub fn cross_stack_references(&self) -> Vec<(NodeId, &Dependency)> {
        self.dependencies
            .iter()
            .flat_map(|(member, deps)| deps.iter().map(move |d| (*member, d)))
            .filter(|(member, dep)| !dep.explicit && self.owner(*member) != Some(dep.target_stack))
            .collect()
    }

    /// Members of `stack` with same-stack dependencies first; ties are broken
    /// by construct path.
    pub fn resource_order(&self, tree: &ConstructTree, stack: NodeId) -> Result<Vec<NodeId>> {
        let members = tree.stack_members(stack);
        Ordering::new(&members, |n| {
            self.dependencies(n)
                .iter()
                .filter(|d| d.target_stack == stack)
                .map(|d| d.target)
                .collect()
        })
        .order(|n| tree.path(n).to_string())
    }

    /// `stacks` with their dependencies first; ties are broken by construct path.
    pub fn stack_order(&self, tree: &ConstructTree, stacks: &[NodeId]) -> Result<Vec<NodeId>> {
        Ordering::new(stacks, |n| self.stack_dependencies(n)).order(|n| tree.path(n).to_string())
    }
}

fn resolve_dependency(
    tree: &ConstructTree,
    stack: NodeId,
    member: NodeId,
    target: &str,
    attribute: Option<&str>,
    explicit: bool,
) -> Result<Dependency> {
    let from = tree.path(member);

    let resolved = tree.resolve_target(stack, target).ok_or_else(|| {
        Error::InvalidReference(format!(
            "'{}' references unknown construct '{}'",
            from, target
        ))
    })?;

    if resolved == member {
        return Err(Error::InvalidReference(format!(
            "'{}' references itself",
            from
        )));
    }

    let node = tree.node(resolved);
    if node.resource().is_none() {
        return Err(Error::InvalidReference(format!(
            "'{}' references '{}' which is a {}, not a resource",
            from,
            target,
            node.kind.label()
        )));
    }

    let target_stack = tree.enclosing_stack(resolved).ok_or_else(|| {
        Error::Internal(format!("resource '{}' has no stack", tree.path(resolved)))
    })?;

    if target_stack != stack && tree.enclosing_stage(target_stack) != tree.enclosing_stage(stack) {
        return Err(Error::InvalidReference(format!(
            "'{}' references '{}' in another assembly; references may only cross stacks of the same stage",
            from,
            tree.path(resolved)
        )));
    }

    Ok(Dependency {
        target: resolved,
        target_stack,
        attribute: attribute.map(String::from),
        explicit,
    })
}

/// Ordering view over a set of nodes; edges point from a node to the nodes
/// it depends on. Dependencies outside the set are ignored.
struct Ordering {
    graph: DiGraph<NodeId, ()>,
}

impl Ordering {
    fn new(nodes: &[NodeId], deps: impl Fn(NodeId) -> Vec<NodeId>) -> Self {
        let mut graph = DiGraph::new();
        let index: HashMap<NodeId, NodeIndex> =
            nodes.iter().map(|n| (*n, graph.add_node(*n))).collect();

        for node in nodes {
            let from = index[node];
            let targets: BTreeSet<NodeId> = deps(*node).into_iter().collect();
            for target in targets {
                if let Some(to) = index.get(&target) {
                    graph.add_edge(from, *to, ());
                }
            }
        }
        Self { graph }
    }

    /// Fails with the path of the first cycle found, starting at the
    /// cycle member with the smallest name.
    fn check_acyclic(&self, name: &impl Fn(NodeId) -> String) -> Result<()> {
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|n| self.graph.contains_edge(*n, *n));
            if cyclic {
                return Err(Error::CycleDetected(
                    self.cycle_path(&component, name).join(" -> "),
                ));
            }
        }
        Ok(())
    }

    fn cycle_path(&self, component: &[NodeIndex], name: &impl Fn(NodeId) -> String) -> Vec<String> {
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let Some(start) = component.iter().copied().min_by_key(|n| name(self.graph[*n])) else {
            return Vec::new();
        };

        let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors(current)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_by_key(|n| name(self.graph[*n]));

            for neighbor in next {
                if neighbor == start {
                    let mut path = vec![current];
                    let mut at = current;
                    while let Some(parent) = parents.get(&at) {
                        path.push(*parent);
                        at = *parent;
                    }
                    path.reverse();
                    path.push(start);
                    return path.into_iter().map(|n| name(self.graph[n])).collect();
                }
                if !parents.contains_key(&neighbor) {
                    parents.insert(neighbor, current);
                    queue.push_back(neighbor);
                }
            }
        }
        Vec::new()
    }

    /// Dependencies first; among the nodes ready at each step the one with
    /// the smallest key goes next.
    fn order(&self, key: impl Fn(NodeId) -> String) -> Result<Vec<NodeId>> {
        self.check_acyclic(&key)?;

        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Outgoing).count()))
            .collect();
        let mut ready: BTreeSet<(String, NodeIndex)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| (key(self.graph[*n]), *n))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((_, node)) = ready.pop_first() {
            order.push(self.graph[node]);
            for dependent in self.graph.neighbors_directed(node, Direction::Incoming) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((key(self.graph[dependent]), dependent));
                    }
                }
            }
        }
        Ok(order)
    }
}
