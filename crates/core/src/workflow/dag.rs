use crate::error::{EngineError, EngineResult};
use crate::types::{StepId, WorkflowStep};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Dependency graph over a definition's steps
///
/// Nodes are stored in step-list order; an edge runs from a dependency to its dependent.
/// Dependencies naming an unknown step are kept aside as dangling rather than rejected:
/// such a step can never run, which the scheduler reports at execution time.
pub struct DependencyGraph {
    graph: DiGraph<StepId, ()>,
    dangling: Vec<(StepId, StepId)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

impl DependencyGraph {
    /// Build the graph from a step list
    pub fn from_steps(steps: &[WorkflowStep]) -> Self {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();
        let mut dangling = Vec::new();

        for step in steps {
            let node = graph.add_node(step.id.clone());
            step_indices.insert(step.id.clone(), node);
        }

        for step in steps {
            let step_idx = step_indices[&step.id];
            for dep_id in &step.depends_on {
                match step_indices.get(dep_id) {
                    Some(dep_idx) => {
                        graph.add_edge(*dep_idx, step_idx, ());
                    }
                    None => dangling.push((step.id.clone(), dep_id.clone())),
                }
            }
        }

        Self { graph, dangling }
    }

    /// Depth-first search for a dependency cycle.
    ///
    /// Returns the first step reached while it is still being visited.
    pub fn find_cycle(&self) -> Option<StepId> {
        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();

        for node in self.graph.node_indices() {
            if marks.contains_key(&node) {
                continue;
            }
            if let Some(step) = self.visit(node, &mut marks) {
                return Some(step);
            }
        }

        None
    }

    fn visit(&self, node: NodeIndex, marks: &mut HashMap<NodeIndex, Mark>) -> Option<StepId> {
        marks.insert(node, Mark::Visiting);

        for dep in self.graph.neighbors_directed(node, Direction::Incoming) {
            match marks.get(&dep) {
                Some(Mark::Visiting) => return Some(self.graph[dep].clone()),
                Some(Mark::Visited) => {}
                None => {
                    if let Some(step) = self.visit(dep, marks) {
                        return Some(step);
                    }
                }
            }
        }

        marks.insert(node, Mark::Visited);
        None
    }

    /// `(step, missing dependency)` pairs
    pub fn dangling_dependencies(&self) -> &[(StepId, StepId)] {
        &self.dangling
    }
}

/// Validate a definition's name and steps before it is stored
pub fn validate_definition(name: &str, steps: &[WorkflowStep]) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("workflow name is required"));
    }

    if steps.is_empty() {
        return Err(EngineError::validation("workflow must have at least one step"));
    }

    let mut orders = HashSet::new();
    for step in steps {
        if !orders.insert(step.order) {
            return Err(EngineError::validation_at(
                &step.id,
                format!("duplicate step order {} at step {}", step.order, step.id),
            ));
        }
    }

    let mut ids = HashSet::new();
    for step in steps {
        if step.id.0.trim().is_empty() {
            return Err(EngineError::validation("step id must not be empty"));
        }
        if !ids.insert(&step.id) {
            return Err(EngineError::validation_at(
                &step.id,
                format!("duplicate step id {}", step.id),
            ));
        }
    }

    let graph = DependencyGraph::from_steps(steps);
    if let Some(step) = graph.find_cycle() {
        return Err(EngineError::validation_at(
            &step,
            format!("circular dependency detected at step {}", step),
        ));
    }

    for (step, missing) in graph.dangling_dependencies() {
        tracing::warn!(
            "Step {} depends on unknown step {}; it will never become ready",
            step,
            missing
        );
    }

    Ok(())
}
