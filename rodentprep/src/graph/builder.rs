//! Graph builder with validation.

use super::Graph;
use crate::errors::{CycleError, DanglingReferenceError, GraphError};
use crate::steps::{InputSource, Step};
use std::collections::{HashMap, HashSet};

/// Builder for creating validated step graphs.
///
/// Steps may be added in any order; edges are derived from artifact inputs
/// when [`GraphBuilder::build`] runs. Declaration order is preserved and
/// used as the scheduling tie-break.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    steps: Vec<Step>,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a step in place.
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Adds several steps in place.
    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) {
        self.steps.extend(steps);
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] on duplicate names or outputs, dangling input
    /// references, or dependency cycles.
    pub fn build(self) -> Result<Graph, GraphError> {
        let steps = self.steps;

        let mut index: HashMap<String, usize> = HashMap::with_capacity(steps.len());
        for (id, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), id).is_some() {
                return Err(GraphError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
            let mut seen = HashSet::new();
            for output in &step.outputs {
                if !seen.insert(output.name.as_str()) {
                    return Err(GraphError::DuplicateOutput {
                        step: step.name.clone(),
                        output: output.name.clone(),
                    });
                }
            }
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut deps = Vec::new();
            for input in &step.inputs {
                if let InputSource::Artifact {
                    step: producer,
                    output,
                } = &input.source
                {
                    let pid = index
                        .get(producer)
                        .copied()
                        .filter(|&pid| steps[pid].output(output).is_some())
                        .ok_or_else(|| DanglingReferenceError::new(&step.name, producer, output))?;
                    if !deps.contains(&pid) {
                        deps.push(pid);
                    }
                }
            }
            dependencies.push(deps);
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let names = cycle.into_iter().map(|id| steps[id].name.clone()).collect();
            return Err(CycleError::new(names).into());
        }

        Ok(Graph::from_parts(steps, index, dependencies))
    }
}

/// Finds a dependency cycle, returning its members with the first repeated
/// at the end.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Finished,
    }

    fn visit(
        node: usize,
        dependencies: &[Vec<usize>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        path.push(node);

        for &dep in &dependencies[node] {
            match marks[dep] {
                Mark::Unvisited => {
                    if let Some(cycle) = visit(dep, dependencies, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::OnStack => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Finished => {}
            }
        }

        path.pop();
        marks[node] = Mark::Finished;
        None
    }

    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut path = Vec::new();
    for node in 0..dependencies.len() {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, dependencies, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
