//! Step dependency graph, cycle detection, and eligibility.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles at construction, so a `StepGraph` that exists is always
//! acyclic with every dependency resolved. At run time the graph answers which
//! pending steps are eligible and which are blocked by an upstream failure.

use std::collections::{HashMap, HashSet, VecDeque};

use agentflow_types::status::StepStatus;
use agentflow_types::workflow::StepDefinition;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::WorkflowError;

/// Validated, acyclic dependency graph over the steps of one workflow.
///
/// Step ids keep their declaration order; every query that returns several
/// ids returns them in that order.
#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    topo: Vec<usize>,
}

impl StepGraph {
    /// Build the graph, rejecting duplicate ids, self-dependencies, unknown
    /// dependencies, and cycles.
    pub fn new(steps: &[StepDefinition]) -> Result<Self, WorkflowError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.id.is_empty() {
                return Err(WorkflowError::ValidationError(
                    "step id must not be empty".to_string(),
                ));
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];

        for (to, step) in steps.iter().enumerate() {
            for dep in &step.dependencies {
                if dep == &step.id {
                    return Err(WorkflowError::SelfDependency(step.id.clone()));
                }
                let from = *index.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                if dependencies[to].contains(&from) {
                    continue;
                }
                dependencies[to].push(from);
                dependents[from].push(to);
                graph.add_edge(nodes[from], nodes[to], ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let step_id = &steps[graph[cycle.node_id()]].id;
            WorkflowError::CycleDetected(format!("cycle detected involving step '{step_id}'"))
        })?;

        for list in &mut dependents {
            list.sort_unstable();
        }

        Ok(Self {
            ids: steps.iter().map(|s| s.id.clone()).collect(),
            index,
            dependencies,
            dependents,
            topo: sorted.into_iter().map(|n| graph[n]).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.index.contains_key(step_id)
    }

    /// Step ids in declaration order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Step ids in a dependency-respecting order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.topo.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Direct dependencies of `step_id` (empty if unknown).
    pub fn dependencies(&self, step_id: &str) -> Vec<&str> {
        self.neighbours(step_id, &self.dependencies)
    }

    /// Direct dependents of `step_id` (empty if unknown).
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        self.neighbours(step_id, &self.dependents)
    }

    /// Every step that transitively depends on `step_id`.
    pub fn transitive_dependents(&self, step_id: &str) -> Vec<&str> {
        self.closure(step_id, &self.dependents)
    }

    /// Every step `step_id` transitively depends on.
    pub fn transitive_dependencies(&self, step_id: &str) -> Vec<&str> {
        self.closure(step_id, &self.dependencies)
    }

    // -----------------------------------------------------------------------
    // Run-time queries
    // -----------------------------------------------------------------------

    /// Pending steps whose dependencies have all completed.
    ///
    /// Steps missing from `statuses` count as `Pending`.
    pub fn eligible(&self, statuses: &HashMap<String, StepStatus>) -> Vec<&str> {
        let status_of = |i: usize| {
            statuses
                .get(&self.ids[i])
                .copied()
                .unwrap_or(StepStatus::Pending)
        };
        (0..self.ids.len())
            .filter(|&i| status_of(i) == StepStatus::Pending)
            .filter(|&i| {
                self.dependencies[i]
                    .iter()
                    .all(|&d| status_of(d) == StepStatus::Completed)
            })
            .map(|i| self.ids[i].as_str())
            .collect()
    }

    /// Pending steps with at least one failed or skipped dependency, paired
    /// with the first such dependency.
    ///
    /// Marking these skipped and querying again until the result is empty
    /// propagates a failure through all transitive dependents.
    pub fn blocked(&self, statuses: &HashMap<String, StepStatus>) -> Vec<(&str, &str)> {
        let status_of = |i: usize| {
            statuses
                .get(&self.ids[i])
                .copied()
                .unwrap_or(StepStatus::Pending)
        };
        (0..self.ids.len())
            .filter(|&i| status_of(i) == StepStatus::Pending)
            .filter_map(|i| {
                self.dependencies[i]
                    .iter()
                    .find(|&&d| matches!(status_of(d), StepStatus::Failed | StepStatus::Skipped))
                    .map(|&d| (self.ids[i].as_str(), self.ids[d].as_str()))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Static plan
    // -----------------------------------------------------------------------

    /// Group steps into levels: every step sits one level below its deepest
    /// dependency. Steps within a level could run concurrently if every
    /// earlier level succeeded. Used for display; the executor dispatches
    /// dynamically.
    pub fn execution_waves(&self) -> Vec<Vec<&str>> {
        if self.ids.is_empty() {
            return vec![];
        }

        let mut depths = vec![0usize; self.ids.len()];
        for &i in &self.topo {
            depths[i] = self.dependencies[i]
                .iter()
                .map(|&d| depths[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let max_depth = depths.iter().copied().max().unwrap_or(0);
        let mut waves: Vec<Vec<&str>> = vec![vec![]; max_depth + 1];
        for (i, id) in self.ids.iter().enumerate() {
            waves[depths[i]].push(id.as_str());
        }
        waves
    }

    fn neighbours(&self, step_id: &str, edges: &[Vec<usize>]) -> Vec<&str> {
        match self.index.get(step_id) {
            Some(&i) => edges[i].iter().map(|&j| self.ids[j].as_str()).collect(),
            None => Vec::new(),
        }
    }

    fn closure(&self, step_id: &str, edges: &[Vec<usize>]) -> Vec<&str> {
        let Some(&start) = self.index.get(step_id) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &next in &edges[current] {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut found: Vec<usize> = visited.into_iter().collect();
        found.sort_unstable();
        found.into_iter().map(|i| self.ids[i].as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
