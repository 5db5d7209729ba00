//! The validated step DAG.

use super::GraphBuilder;
use crate::errors::GraphError;
use crate::steps::Step;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Index of a step within its graph (its declaration position).
pub type StepId = usize;

/// A directed acyclic graph of steps wired by artifact dependencies.
///
/// Step ids are declaration positions, so iterating ids in ascending order
/// is iterating in declaration order.
#[derive(Debug, Clone)]
pub struct Graph {
    steps: Vec<Step>,
    index: HashMap<String, StepId>,
    dependencies: Vec<Vec<StepId>>,
    dependents: Vec<Vec<StepId>>,
    order: Vec<StepId>,
}

impl Graph {
    /// Builds a graph from steps.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::build`].
    pub fn build(steps: impl IntoIterator<Item = Step>) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new();
        builder.extend(steps);
        builder.build()
    }

    pub(super) fn from_parts(
        steps: Vec<Step>,
        index: HashMap<String, StepId>,
        dependencies: Vec<Vec<StepId>>,
    ) -> Self {
        let mut dependents = vec![Vec::new(); steps.len()];
        for (id, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(id);
            }
        }
        let order = topological_sort(&dependencies);

        Self {
            steps,
            index,
            dependencies,
            dependents,
            order,
        }
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the graph has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns all steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns a step by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a step of this graph.
    #[must_use]
    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id]
    }

    /// Looks up a step id by name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<StepId> {
        self.index.get(name).copied()
    }

    /// Returns the steps `id` consumes artifacts from.
    #[must_use]
    pub fn dependencies(&self, id: StepId) -> &[StepId] {
        &self.dependencies[id]
    }

    /// Returns the steps that consume artifacts of `id`.
    #[must_use]
    pub fn dependents(&self, id: StepId) -> &[StepId] {
        &self.dependents[id]
    }

    /// Returns a topological order, stable with respect to declaration order.
    #[must_use]
    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    /// Returns the scheduler frontier: steps whose dependencies are all in
    /// `done` and which are neither done nor in `claimed` (running, failed,
    /// or otherwise already handled). The result is in declaration order.
    #[must_use]
    pub fn topological_ready(&self, done: &HashSet<StepId>, claimed: &HashSet<StepId>) -> Vec<StepId> {
        (0..self.steps.len())
            .filter(|id| !done.contains(id) && !claimed.contains(id))
            .filter(|&id| self.dependencies[id].iter().all(|dep| done.contains(dep)))
            .collect()
    }

    /// Returns every step that depends on `id`, directly or transitively.
    #[must_use]
    pub fn descendants(&self, id: StepId) -> BTreeSet<StepId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<StepId> = self.dependents[id].clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents[next].iter().copied());
            }
        }
        seen
    }

    /// Builds the subgraph of steps matching `keep`.
    ///
    /// # Errors
    ///
    /// Returns a dangling reference error if a kept step consumes an
    /// artifact of a dropped step.
    pub fn restrict(&self, keep: impl Fn(&Step) -> bool) -> Result<Self, GraphError> {
        Self::build(self.steps.iter().filter(|s| keep(s)).cloned())
    }
}

/// Kahn's algorithm, always releasing the lowest ready id first.
fn topological_sort(dependencies: &[Vec<StepId>]) -> Vec<StepId> {
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); dependencies.len()];
    for (id, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(id);
        }
    }

    let mut ready: BTreeSet<StepId> = (0..dependencies.len())
        .filter(|&id| remaining[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &child in &dependents[id] {
            remaining[child] -= 1;
            if remaining[child] == 0 {
                ready.insert(child);
            }
        }
    }

    order
}
