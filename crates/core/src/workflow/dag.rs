use super::state::WorkflowState;
use crate::error::{EngineError, EngineResult};
use crate::types::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Dependency graph of a workflow, derived from field references.
///
/// Edges point from a dependency to its dependent. Cycles are allowed here;
/// the orchestrator detects them at run time when no progress is possible.
pub struct WorkflowDag {
    graph: DiGraph<NodeId, ()>,
    node_indices: HashMap<NodeId, NodeIndex>,
}

impl WorkflowDag {
    /// Build the graph from a workflow state
    pub fn from_state(state: &WorkflowState) -> EngineResult<Self> {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node_id in state.nodes.keys() {
            let idx = graph.add_node(node_id.clone());
            node_indices.insert(node_id.clone(), idx);
        }

        for node in state.nodes.values() {
            let node_idx = node_indices[&node.node_id];
            let mut seen = HashSet::new();

            for (field, value) in &node.fields {
                let super::state::FieldValue::Ref(r) = value else {
                    continue;
                };
                let dep_idx = node_indices.get(&r.node).ok_or_else(|| {
                    EngineError::DanglingReference {
                        node_id: node.node_id.clone(),
                        field: field.clone(),
                        target: r.node.clone(),
                    }
                })?;

                if seen.insert(*dep_idx) {
                    graph.add_edge(*dep_idx, node_idx, ());
                }
            }
        }

        Ok(Self {
            graph,
            node_indices,
        })
    }

    fn index(&self, node_id: &NodeId) -> EngineResult<NodeIndex> {
        self.node_indices
            .get(node_id)
            .copied()
            .ok_or_else(|| EngineError::UnknownNode(node_id.clone()))
    }

    /// Nodes the given node reads from, ascending
    pub fn dependencies(&self, node_id: &NodeId) -> EngineResult<Vec<NodeId>> {
        let node = self.index(node_id)?;
        let deps: BTreeSet<NodeId> = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        Ok(deps.into_iter().collect())
    }

    /// Check if all dependencies of a node are done
    pub fn can_execute(&self, node_id: &NodeId, done: &HashSet<NodeId>) -> EngineResult<bool> {
        let deps = self.dependencies(node_id)?;
        Ok(deps.iter().all(|dep| done.contains(dep)))
    }

    /// Failed nodes among the direct or transitive dependencies of `node_id`
    pub fn failed_ancestors(
        &self,
        node_id: &NodeId,
        failed: &HashSet<NodeId>,
    ) -> EngineResult<Vec<NodeId>> {
        let start = self.index(node_id)?;
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut blockers = BTreeSet::new();

        while let Some(n) = dfs.next(reversed) {
            if n != start && failed.contains(&self.graph[n]) {
                blockers.insert(self.graph[n].clone());
            }
        }

        Ok(blockers.into_iter().collect())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}
