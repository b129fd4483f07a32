//! Search-Space Graph
//!
//! Directed acyclic graph whose nodes may own nested subgraphs (cells).
//! Nodes and edges live in ordered maps, so every traversal visits edges
//! in (source, target) order. A parent owns its cells outright; cells
//! are found through an explicit scope index instead of back-pointers.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::edge::EdgeData;
use super::primitives::CombineOp;
use crate::error::{KolosalError, Result};

/// Node identifier within one graph
pub type NodeId = usize;

/// Label grouping the cell instances an update should reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    NormalStage1,
    NormalStage2,
    NormalStage3,
    ReductionStage1,
    ReductionStage2,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::NormalStage1 => "n_stage_1",
            Scope::NormalStage2 => "n_stage_2",
            Scope::NormalStage3 => "n_stage_3",
            Scope::ReductionStage1 => "r_stage_1",
            Scope::ReductionStage2 => "r_stage_2",
        }
    }

    /// Normal-cell scopes, one per stage
    pub fn normal_stages() -> [Scope; 3] {
        [Scope::NormalStage1, Scope::NormalStage2, Scope::NormalStage3]
    }

    /// Reduction-cell scopes
    pub fn reduction_stages() -> [Scope; 2] {
        [Scope::ReductionStage1, Scope::ReductionStage2]
    }
}

/// A graph node
#[derive(Debug, Clone, Default)]
pub struct Node {
    subgraph: Option<Box<Graph>>,
    comb_op: CombineOp,
}

impl Node {
    pub fn subgraph(&self) -> Option<&Graph> {
        self.subgraph.as_deref()
    }

    pub fn comb_op(&self) -> CombineOp {
        self.comb_op
    }
}

/// Incoming edge handed to node update functions
pub type InEdge<'a> = (NodeId, &'a mut EdgeData);

/// Directed acyclic graph with optional nested cells
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    scope: Option<Scope>,
    input_nodes: Vec<NodeId>,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<(NodeId, NodeId), EdgeData>,
    scope_index: BTreeMap<Scope, Vec<NodeId>>,
    frozen: bool,
}

impl Graph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty graph with a name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn scope(&self) -> Option<Scope> {
        self.scope
    }

    /// Tag this graph with a scope
    pub fn set_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Wire this graph's inputs to predecessor nodes of the parent graph
    pub fn set_input(mut self, inputs: Vec<NodeId>) -> Self {
        self.input_nodes = inputs;
        self
    }

    pub fn input_nodes(&self) -> &[NodeId] {
        &self.input_nodes
    }

    /// Add a plain node; adding an existing node is a no-op
    pub fn add_node(&mut self, id: NodeId) {
        self.nodes.entry(id).or_default();
    }

    /// Add a node owning a subgraph; the subgraph can only be set once
    pub fn add_node_with_subgraph(&mut self, id: NodeId, subgraph: Graph) -> Result<()> {
        let node = self.nodes.entry(id).or_default();
        if node.subgraph.is_some() {
            return Err(KolosalError::GraphError(format!(
                "node {} already owns a subgraph",
                id
            )));
        }

        if let Some(scope) = subgraph.scope {
            let ids = self.scope_index.entry(scope).or_default();
            if !ids.contains(&id) {
                ids.push(id);
                ids.sort_unstable();
            }
        }
        node.subgraph = Some(Box::new(subgraph));
        Ok(())
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Node ids in ascending order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn subgraph(&self, id: NodeId) -> Option<&Graph> {
        self.nodes.get(&id).and_then(|n| n.subgraph.as_deref())
    }

    pub fn subgraph_mut(&mut self, id: NodeId) -> Option<&mut Graph> {
        self.nodes.get_mut(&id).and_then(|n| n.subgraph.as_deref_mut())
    }

    /// Set how a node combines its incoming edges
    pub fn set_comb_op(&mut self, id: NodeId, comb_op: CombineOp) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| KolosalError::GraphError(format!("unknown node {}", id)))?;
        node.comb_op = comb_op;
        Ok(())
    }

    /// Add an edge with default data
    pub fn add_edge(&mut self, u: NodeId, v: NodeId) -> Result<()> {
        self.add_edge_with_data(u, v, EdgeData::default())
    }

    /// Add an edge; rejects unknown nodes and edges that close a cycle
    pub fn add_edge_with_data(&mut self, u: NodeId, v: NodeId, data: EdgeData) -> Result<()> {
        for id in [u, v] {
            if !self.nodes.contains_key(&id) {
                return Err(KolosalError::GraphError(format!("unknown node {}", id)));
            }
        }
        if u == v || self.has_path(v, u) {
            return Err(KolosalError::GraphError(format!(
                "edge {} -> {} would introduce a cycle",
                u, v
            )));
        }
        self.edges.insert((u, v), data);
        Ok(())
    }

    /// Add several default edges
    pub fn add_edges_from(&mut self, edges: impl IntoIterator<Item = (NodeId, NodeId)>) -> Result<()> {
        for (u, v) in edges {
            self.add_edge(u, v)?;
        }
        Ok(())
    }

    pub fn remove_edge(&mut self, u: NodeId, v: NodeId) -> Option<EdgeData> {
        self.edges.remove(&(u, v))
    }

    pub fn has_edge(&self, u: NodeId, v: NodeId) -> bool {
        self.edges.contains_key(&(u, v))
    }

    pub fn edge(&self, u: NodeId, v: NodeId) -> Option<&EdgeData> {
        self.edges.get(&(u, v))
    }

    pub fn edge_mut(&mut self, u: NodeId, v: NodeId) -> Option<&mut EdgeData> {
        self.edges.get_mut(&(u, v))
    }

    /// Edges in (source, target) order
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId, &EdgeData)> + '_ {
        self.edges.iter().map(|(&(u, v), data)| (u, v, data))
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = (NodeId, NodeId, &mut EdgeData)> + '_ {
        self.edges.iter_mut().map(|(&(u, v), data)| (u, v, data))
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Incoming edges of a node, ordered by source
    pub fn in_edges(&self, v: NodeId) -> Vec<(NodeId, &EdgeData)> {
        self.edges
            .iter()
            .filter(|((_, target), _)| *target == v)
            .map(|(&(u, _), data)| (u, data))
            .collect()
    }

    pub fn in_degree(&self, v: NodeId) -> usize {
        self.edges.keys().filter(|(_, target)| *target == v).count()
    }

    pub fn successors(&self, u: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges
            .range((u, NodeId::MIN)..=(u, NodeId::MAX))
            .map(|(&(_, v), _)| v)
    }

    /// Whether `to` is reachable from `from`
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if visited.insert(node) {
                stack.extend(self.successors(node));
            }
        }
        false
    }

    /// Kahn's algorithm; ties resolve to the smallest node id
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        for &(_, v) in self.edges.keys() {
            *in_degree.entry(v).or_default() += 1;
        }

        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(u) = queue.pop_front() {
            order.push(u);
            for v in self.successors(u).collect::<Vec<_>>() {
                if let Some(d) = in_degree.get_mut(&v) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(v);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(KolosalError::InvariantViolation(format!(
                "graph {} contains a cycle",
                self.name
            )));
        }
        Ok(order)
    }

    /// Stop further rewiring of cell inputs
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Change the predecessor wiring of the cell at `id`
    pub fn rewire_cell(&mut self, id: NodeId, inputs: Vec<NodeId>) -> Result<()> {
        if self.frozen {
            return Err(KolosalError::GraphError(format!(
                "cannot rewire cell {} of frozen graph {}",
                id, self.name
            )));
        }
        let cell = self
            .subgraph_mut(id)
            .ok_or_else(|| KolosalError::GraphError(format!("node {} has no subgraph", id)))?;
        cell.input_nodes = inputs;
        Ok(())
    }

    /// Cells in node order
    pub fn cells(&self) -> impl Iterator<Item = (NodeId, &Graph)> + '_ {
        self.nodes
            .iter()
            .filter_map(|(&id, node)| node.subgraph.as_deref().map(|g| (id, g)))
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut Graph)> + '_ {
        self.nodes
            .iter_mut()
            .filter_map(|(&id, node)| node.subgraph.as_deref_mut().map(|g| (id, g)))
    }

    /// Nodes whose cells carry the given scope
    pub fn scope_nodes(&self, scope: Scope) -> &[NodeId] {
        self.scope_index.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    fn scoped_cell_ids(&self, scopes: &[Scope]) -> Vec<NodeId> {
        let ids: BTreeSet<NodeId> = scopes
            .iter()
            .flat_map(|s| self.scope_nodes(*s).iter().copied())
            .collect();
        ids.into_iter().collect()
    }

    /// Apply `update` to every non-final edge of the cells in `scopes`
    pub fn update_edges<F>(&mut self, scopes: &[Scope], mut update: F) -> Result<()>
    where
        F: FnMut(NodeId, NodeId, &mut EdgeData) -> Result<()>,
    {
        for id in self.scoped_cell_ids(scopes) {
            if let Some(cell) = self.subgraph_mut(id) {
                for (u, v, data) in cell.edges_mut() {
                    if !data.is_final() {
                        update(u, v, data)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply `update` to every node of this graph, then drop deleted edges
    pub fn update_own_nodes<F>(&mut self, update: &mut F) -> Result<usize>
    where
        F: FnMut(NodeId, &mut [InEdge<'_>]) -> Result<()>,
    {
        let node_ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for node in node_ids {
            let mut in_edges: Vec<InEdge<'_>> = self
                .edges
                .iter_mut()
                .filter(|((_, target), _)| *target == node)
                .map(|(&(u, _), data)| (u, data))
                .collect();
            update(node, in_edges.as_mut_slice())?;
        }

        let before = self.edges.len();
        self.edges.retain(|_, data| !data.is_deleted());
        Ok(before - self.edges.len())
    }

    /// Apply `update` to every node of the cells in `scopes`.
    ///
    /// With `single_instances`, the update runs on the first cell of each
    /// name only and the remaining cells of that name copy its result, so
    /// all instances of a cell type end up with one topology. Returns the
    /// number of removed edges per cell name.
    pub fn update_nodes<F>(
        &mut self,
        scopes: &[Scope],
        single_instances: bool,
        mut update: F,
    ) -> Result<BTreeMap<String, usize>>
    where
        F: FnMut(NodeId, &mut [InEdge<'_>]) -> Result<()>,
    {
        let mut removed: BTreeMap<String, usize> = BTreeMap::new();
        let mut templates: BTreeMap<String, Graph> = BTreeMap::new();

        for id in self.scoped_cell_ids(scopes) {
            let Some(cell) = self.subgraph_mut(id) else {
                continue;
            };
            let name = cell.name.clone();

            if single_instances {
                if let Some(template) = templates.get(&name) {
                    cell.mirror_edges_from(template)?;
                    continue;
                }
            }

            let count = cell.update_own_nodes(&mut update)?;
            *removed.entry(name.clone()).or_default() += count;
            if single_instances {
                templates.insert(name, cell.clone());
            }
        }
        Ok(removed)
    }

    /// Keep only the edges present in `template` and copy its choices
    pub fn mirror_edges_from(&mut self, template: &Graph) -> Result<()> {
        self.edges.retain(|key, _| template.edges.contains_key(key));
        for (key, data) in self.edges.iter_mut() {
            if let Some(source) = template.edges.get(key) {
                data.mirror_choice_from(source)?;
            }
        }
        Ok(())
    }
}
