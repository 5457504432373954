//! Starts runnable tasks, never running more than a fixed number at once.

use crate::graph::{InvariantViolation, TaskGraph, Writer};
use crate::process::ProcessHost;
use crate::runner::{Runner, StartError};
use crate::task::{TaskId, TaskState};
use tracing::warn;

pub struct Scheduler {
    parallelism: usize,
    /// Tasks this scheduler moved to Running that have not been seen to leave
    /// it yet.
    running: Vec<TaskId>,
}

impl Scheduler {
    pub fn new(parallelism: usize) -> Self {
        Scheduler {
            parallelism: parallelism.max(1),
            running: Vec::new(),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn running(&self) -> &[TaskId] {
        &self.running
    }

    /// Starts as many runnable tasks as the bound allows, in insertion
    /// order, and returns the ones started.
    ///
    /// A task that fails to spawn is left in Error by the runner and does not
    /// count against the bound.  `failures_allowed` is how many more failures
    /// the build tolerates, None for no limit; once that many spawns fail,
    /// nothing further is started.
    pub fn dispatch<H: ProcessHost>(
        &mut self,
        graph: &mut TaskGraph,
        runner: &mut Runner<H>,
        mut failures_allowed: Option<usize>,
    ) -> Result<Vec<TaskId>, InvariantViolation> {
        self.running
            .retain(|&id| graph.state(id) == Some(TaskState::Running));

        let mut started = Vec::new();
        let mut candidates = graph.runnable().into_iter();
        while self.running.len() < self.parallelism && failures_allowed != Some(0) {
            let Some(id) = candidates.next() else {
                break;
            };
            // The snapshot may be behind: a notification delivered during
            // this pass can have moved the task on.
            if graph.state(id) != Some(TaskState::Runnable) {
                continue;
            }
            let process = match runner.start(graph, id) {
                Ok(process) => process,
                Err(StartError::Spawn(err)) => {
                    warn!(?id, %err, "could not start task");
                    failures_allowed = failures_allowed.map(|n| n.saturating_sub(1));
                    continue;
                }
                Err(StartError::Invariant(err)) => return Err(err),
            };
            graph.set_state(Writer::Scheduler, id, TaskState::Runnable, TaskState::Running)?;
            graph.attach_process(id, process)?;
            graph.update(id, None)?;
            self.running.push(id);
            started.push(id);
        }
        Ok(started)
    }
}
