//! Execution Planner
//!
//! Decides which step runs next. Order is fixed by three layers, most
//! significant first:
//! 1. Dependencies: a step is ready once every `depends_on` step completed
//! 2. Priority: lower values run first among ready steps
//! 3. Step id: lexical tie-break
//!
//! Steps run one at a time, so the planner only ever hands out one step.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};

use crate::recipe::{StepGraph, StepId, StepSpec};

/// Tracks completion for one run over a shared graph.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    graph: Arc<StepGraph>,
    completed: HashSet<StepId>,
    completed_order: Vec<StepId>,
}

impl ExecutionPlanner {
    pub fn new(graph: Arc<StepGraph>) -> Self {
        Self {
            graph,
            completed: HashSet::new(),
            completed_order: Vec::new(),
        }
    }

    /// Creates a planner that continues after previously completed steps.
    ///
    /// Ids no longer present in the graph are ignored.
    pub fn from_completed(graph: Arc<StepGraph>, completed: &[StepId]) -> Self {
        let mut planner = Self::new(graph);
        for id in completed {
            if planner.graph.contains(id) {
                planner.mark_step_completed(id);
                debug!("Skipping previously completed step: {}", id);
            } else {
                info!("Completed step '{}' is no longer part of the graph", id);
            }
        }
        planner
    }

    fn is_ready(&self, spec: &StepSpec) -> bool {
        !self.completed.contains(&spec.id)
            && spec.depends_on.iter().all(|dep| self.completed.contains(dep))
    }

    /// All ready steps in execution order.
    pub fn ready_steps(&self) -> Vec<&StepSpec> {
        let mut ready: Vec<&StepSpec> = self.graph.steps().filter(|s| self.is_ready(s)).collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        ready
    }

    /// The step to run next, if any.
    pub fn next_step(&self) -> Option<&StepSpec> {
        self.graph
            .steps()
            .filter(|s| self.is_ready(s))
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
    }

    pub fn mark_step_completed(&mut self, id: &StepId) {
        if self.completed.insert(id.clone()) {
            self.completed_order.push(id.clone());
        }
    }

    pub fn has_work_remaining(&self) -> bool {
        self.completed.len() < self.graph.len()
    }

    /// Returns the current progress as (completed, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.completed.len(), self.graph.len())
    }

    /// Completed step ids in completion order.
    pub fn completed(&self) -> &[StepId] {
        &self.completed_order
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }
}

/// The order in which a run would execute every step, assuming none pauses.
pub fn execution_order(graph: Arc<StepGraph>) -> Vec<StepId> {
    let mut planner = ExecutionPlanner::new(graph);
    while let Some(id) = planner.next_step().map(|s| s.id.clone()) {
        planner.mark_step_completed(&id);
    }
    planner.completed_order
}
