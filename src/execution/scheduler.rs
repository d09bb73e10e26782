//! Execution State
//!
//! Per-run bookkeeping for the scheduler: which steps are pending, running,
//! completed or failed, and which pending steps may start now.
//!
//! A step is ready once all of its dependencies completed. A ready step is
//! admitted when the pool has room, no exclusive (`parallel: false`) step is
//! running, and it is either parallel itself or nothing else is running.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::StepFailure;
use crate::module::ModuleDefinition;

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Default)]
pub struct ExecutionState {
    /// Pending step names, in declaration order
    pending: Vec<String>,
    /// Running step name -> parallel flag
    in_flight: HashMap<String, bool>,
    completed: HashSet<String>,
    failed: Vec<StepFailure>,
}

impl ExecutionState {
    pub fn new(definition: &ModuleDefinition) -> Self {
        Self {
            pending: definition.steps.iter().map(|s| s.name.clone()).collect(),
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn status(&self, step: &str) -> Option<StepStatus> {
        if self.completed.contains(step) {
            Some(StepStatus::Completed)
        } else if self.failed.iter().any(|f| f.step == step) {
            Some(StepStatus::Failed)
        } else if self.in_flight.contains_key(step) {
            Some(StepStatus::Running)
        } else if self.pending.iter().any(|p| p == step) {
            Some(StepStatus::Pending)
        } else {
            None
        }
    }

    /// Moves every admissible pending step to running and returns their
    /// names in declaration order.
    pub fn admit_ready(&mut self, definition: &ModuleDefinition, threads: usize) -> Vec<String> {
        let mut admitted = Vec::new();
        let mut index = 0;

        while index < self.pending.len() {
            if self.in_flight.len() >= threads || self.in_flight.values().any(|parallel| !parallel) {
                break;
            }

            let name = &self.pending[index];
            let Some(step) = definition.get_step(name) else {
                index += 1;
                continue;
            };

            let ready = step.depends_on.iter().all(|d| self.completed.contains(d));
            if ready && (step.parallel || self.in_flight.is_empty()) {
                let name = self.pending.remove(index);
                debug!("Admitting step '{}' (parallel: {})", name, step.parallel);
                self.in_flight.insert(name.clone(), step.parallel);
                admitted.push(name);
            } else {
                index += 1;
            }
        }

        admitted
    }

    pub fn mark_completed(&mut self, step: &str) {
        self.in_flight.remove(step);
        self.completed.insert(step.to_string());
    }

    pub fn mark_failed(&mut self, failure: StepFailure) {
        self.in_flight.remove(&failure.step);
        self.failed.push(failure);
    }

    /// Completed plus failed steps.
    pub fn finished_count(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// True when nothing is pending or running.
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// True when steps remain but nothing is running to unblock them.
    pub fn is_deadlocked(&self) -> bool {
        !self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.step.clone()).collect()
    }

    pub fn blocked_names(&self) -> Vec<String> {
        self.pending.clone()
    }

    pub fn failures(&self) -> &[StepFailure] {
        &self.failed
    }

    pub fn into_failures(self) -> Vec<StepFailure> {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleInfo, StepDeclaration};

    fn definition(steps: Vec<StepDeclaration>) -> ModuleDefinition {
        ModuleDefinition {
            info: ModuleInfo {
                id: "t".into(),
                name: "T".into(),
                author: "a".into(),
                description: String::new(),
                tag: String::new(),
            },
            variables: Vec::new(),
            steps,
        }
    }

    fn failure(step: &str) -> StepFailure {
        StepFailure {
            step: step.into(),
            kind: "command-execution",
            message: "exit 1".into(),
        }
    }

    #[test]
    fn test_roots_admitted_in_declaration_order() {
        let def = definition(vec![
            StepDeclaration::tool("a", "echo", ""),
            StepDeclaration::tool("b", "echo", "").depends_on("a"),
            StepDeclaration::tool("c", "echo", ""),
        ]);
        let mut state = ExecutionState::new(&def);

        assert_eq!(state.admit_ready(&def, 10), vec!["a", "c"]);
        assert_eq!(state.status("b"), Some(StepStatus::Pending));

        state.mark_completed("a");
        assert_eq!(state.admit_ready(&def, 10), vec!["b"]);
        assert_eq!(state.status("b"), Some(StepStatus::Running));
    }

    #[test]
    fn test_thread_limit() {
        let def = definition(vec![
            StepDeclaration::tool("a", "echo", ""),
            StepDeclaration::tool("b", "echo", ""),
            StepDeclaration::tool("c", "echo", ""),
        ]);
        let mut state = ExecutionState::new(&def);

        assert_eq!(state.admit_ready(&def, 2), vec!["a", "b"]);
        assert!(state.admit_ready(&def, 2).is_empty());
        state.mark_completed("a");
        assert_eq!(state.admit_ready(&def, 2), vec!["c"]);
    }

    #[test]
    fn test_exclusive_step_runs_alone() {
        let def = definition(vec![
            StepDeclaration::tool("a", "echo", ""),
            StepDeclaration::tool("x", "echo", "").exclusive(),
            StepDeclaration::tool("c", "echo", ""),
        ]);
        let mut state = ExecutionState::new(&def);

        assert_eq!(state.admit_ready(&def, 10), vec!["a", "c"]);
        state.mark_completed("a");
        assert!(state.admit_ready(&def, 10).is_empty());
        state.mark_completed("c");
        assert_eq!(state.admit_ready(&def, 10), vec!["x"]);
    }

    #[test]
    fn test_exclusive_blocks_later_admissions() {
        let def = definition(vec![
            StepDeclaration::tool("x", "echo", "").exclusive(),
            StepDeclaration::tool("a", "echo", ""),
        ]);
        let mut state = ExecutionState::new(&def);

        assert_eq!(state.admit_ready(&def, 10), vec!["x"]);
        assert!(state.admit_ready(&def, 10).is_empty());
        state.mark_completed("x");
        assert_eq!(state.admit_ready(&def, 10), vec!["a"]);
    }

    #[test]
    fn test_failed_dependency_deadlocks() {
        let def = definition(vec![
            StepDeclaration::tool("a", "false", ""),
            StepDeclaration::tool("b", "echo", "").depends_on("a"),
        ]);
        let mut state = ExecutionState::new(&def);

        state.admit_ready(&def, 10);
        state.mark_failed(failure("a"));
        assert!(state.admit_ready(&def, 10).is_empty());
        assert!(state.is_deadlocked());
        assert_eq!(state.failed_names(), vec!["a"]);
        assert_eq!(state.blocked_names(), vec!["b"]);
        assert_eq!(state.status("a"), Some(StepStatus::Failed));
    }

    #[test]
    fn test_cycle_is_deadlock_from_start() {
        let def = definition(vec![
            StepDeclaration::tool("a", "echo", "").depends_on("b"),
            StepDeclaration::tool("b", "echo", "").depends_on("a"),
        ]);
        let mut state = ExecutionState::new(&def);

        assert!(state.admit_ready(&def, 10).is_empty());
        assert!(state.is_deadlocked());
        assert!(state.failed_names().is_empty());
    }

    #[test]
    fn test_finished_counts() {
        let def = definition(vec![
            StepDeclaration::tool("a", "echo", ""),
            StepDeclaration::tool("b", "echo", ""),
        ]);
        let mut state = ExecutionState::new(&def);
        state.admit_ready(&def, 10);
        state.mark_completed("a");
        state.mark_failed(failure("b"));

        assert!(state.is_finished());
        assert!(!state.is_deadlocked());
        assert_eq!(state.finished_count(), 2);
        assert_eq!(state.into_failures().len(), 1);
    }
}
