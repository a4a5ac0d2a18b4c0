use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use relaycore::{Call, Condition, ManifestError, Node, NodeId, Template};
use std::collections::HashMap;
use std::sync::Arc;

/// A node as declared before compilation, with dependencies given by name
pub struct NodeDefinition {
    name: String,
    depends_on: Vec<String>,
    condition: Option<Arc<dyn Condition>>,
    call: Arc<dyn Call>,
    rollback: Option<Arc<dyn Call>>,
}

impl NodeDefinition {
    pub fn new(name: impl Into<String>, call: Arc<dyn Call>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            condition: None,
            call,
            rollback: None,
        }
    }

    pub fn with_dependency(mut self, node: impl Into<String>) -> Self {
        self.depends_on.push(node.into());
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_rollback(mut self, rollback: Arc<dyn Call>) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

pub struct FlowBuilder {
    name: String,
    nodes: Vec<NodeDefinition>,
    output: Option<Template>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            output: None,
        }
    }

    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_node(&mut self, node: NodeDefinition) {
        self.nodes.push(node);
    }

    pub fn output(mut self, output: Template) -> Self {
        self.output = Some(output);
        self
    }

    /// Resolves dependency names into node ids and rejects unknown
    /// dependencies, duplicates and cycles.
    pub fn build(self) -> Result<Flow, ManifestError> {
        let mut index: HashMap<String, NodeId> = HashMap::with_capacity(self.nodes.len());
        for (position, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), NodeId::new(position)).is_some() {
                return Err(ManifestError::DuplicateNode {
                    flow: self.name.clone(),
                    node: node.name.clone(),
                });
            }
        }

        let mut graph: DiGraph<NodeId, ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        let vertices: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|position| graph.add_node(NodeId::new(position)))
            .collect();

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (position, definition) in self.nodes.into_iter().enumerate() {
            let mut dependencies: Vec<NodeId> = Vec::with_capacity(definition.depends_on.len());
            for dependency in &definition.depends_on {
                let id = index.get(dependency).copied().ok_or_else(|| ManifestError::NodeNotFound {
                    node: definition.name.clone(),
                    dependency: dependency.clone(),
                })?;

                if id.index() == position {
                    return Err(ManifestError::CyclicDependency(definition.name.clone()));
                }

                if !dependencies.contains(&id) {
                    dependencies.push(id);
                    graph.add_edge(vertices[id.index()], vertices[position], ());
                }
            }

            let mut node = Node::new(NodeId::new(position), definition.name, definition.call)
                .with_dependencies(dependencies);
            if let Some(condition) = definition.condition {
                node = node.with_condition(condition);
            }
            if let Some(rollback) = definition.rollback {
                node = node.with_rollback(rollback);
            }

            nodes.push(node);
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let node: &Node = &nodes[graph[cycle.node_id()].index()];
            ManifestError::CyclicDependency(node.name().to_string())
        })?;

        let mut dependents = vec![Vec::new(); nodes.len()];
        for node in &nodes {
            for dependency in node.dependencies() {
                dependents[dependency.index()].push(node.id());
            }
        }

        tracing::debug!("Compiled flow {} with {} nodes", self.name, nodes.len());

        Ok(Flow {
            name: self.name,
            order: order.into_iter().map(|vertex| graph[vertex]).collect(),
            nodes,
            dependents,
            output: self.output,
        })
    }
}

/// A compiled, immutable node graph. Shared by every execution of the flow.
#[derive(Debug)]
pub struct Flow {
    name: String,
    nodes: Vec<Node>,
    dependents: Vec<Vec<NodeId>>,
    order: Vec<NodeId>,
    output: Option<Template>,
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|node| node.name() == name).map(Node::id)
    }

    /// Nodes depending directly on the given node
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id.index()]
    }

    /// Nodes without dependencies, ready at the start of every execution
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.dependencies().is_empty())
            .map(Node::id)
            .collect()
    }

    /// Topological order of the nodes
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn output(&self) -> Option<&Template> {
        self.output.as_ref()
    }
}
