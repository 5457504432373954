//! Runs tasks as external processes and reports how they went.
//!
//! The runner owns the Running -> Done/Error transitions, plus Runnable ->
//! Error when a process cannot even be spawned.

use crate::graph::{InvariantViolation, TaskGraph, Writer};
use crate::hash::{self, ContentHasher};
use crate::path::Layout;
use crate::process::{Exit, LocalHost, ProcessHost, ProcessId, SpawnError, SpawnRequest};
use crate::task::{Metrics, TaskId, TaskResult, TaskSpec, TaskState, Termination};
use crate::trace;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Tracks faked "thread ids" -- integers assigned to running tasks to track
/// parallelism in perf trace output.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                self.slots.push(true);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

struct Running {
    task: TaskId,
    process: ProcessId,
    tid: usize,
    start: Instant,
}

pub struct Runner<H: ProcessHost = LocalHost> {
    host: H,
    hasher: Arc<dyn ContentHasher>,
    layout: Layout,
    /// Environment every process starts from; task env is layered on top.
    base_env: BTreeMap<String, String>,
    running: Vec<Running>,
    tids: ThreadIds,
}

impl<H: ProcessHost> Runner<H> {
    pub fn new(
        host: H,
        hasher: Arc<dyn ContentHasher>,
        layout: Layout,
        base_env: BTreeMap<String, String>,
    ) -> Self {
        Runner {
            host,
            hasher,
            layout,
            base_env,
            running: Vec::new(),
            tids: ThreadIds::default(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    fn prepare(&self, spec: &TaskSpec) -> Result<(), SpawnError> {
        for target in &spec.targets {
            if let Some(parent) = self.layout.resolve(target).parent() {
                std::fs::create_dir_all(parent).map_err(|source| SpawnError::Io {
                    cmd: spec.cmd.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Spawns the process for a Runnable task.  The caller is expected to
    /// then move the task to Running.
    ///
    /// The task must have been evaluated: its target ids are what its outputs
    /// are recorded under when it finishes.
    ///
    /// If the process cannot be spawned, the task is moved to Error with a
    /// result describing why, and the error is returned.
    pub fn start(&mut self, graph: &mut TaskGraph, id: TaskId) -> Result<ProcessId, StartError> {
        let task = graph.task(id).ok_or(InvariantViolation::Detached(id))?;
        if task.state() != TaskState::Runnable {
            return Err(InvariantViolation::StateMismatch {
                task: id,
                expected: TaskState::Runnable,
                found: task.state(),
            }
            .into());
        }
        if graph.target_ids(id).is_none() {
            return Err(InvariantViolation::Unevaluated(id).into());
        }
        let spec = task.spec_arc();

        let mut env = self.base_env.clone();
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let spawned = self.prepare(&spec).and_then(|()| {
            self.host.spawn(&SpawnRequest {
                cmd: &spec.cmd,
                args: &spec.args,
                env,
                stdin: spec.stdin.as_deref(),
                capture_stdout: spec.capture_stdout,
                capture_stderr: spec.capture_stderr,
            })
        });

        match spawned {
            Ok(process) => {
                debug!(task = %spec.label(), ?process, "spawned");
                self.running.push(Running {
                    task: id,
                    process,
                    tid: self.tids.claim(),
                    start: Instant::now(),
                });
                Ok(process)
            }
            Err(err) => {
                info!(task = %spec.label(), %err, "spawn failed");
                let result = TaskResult::spawn_failed((*spec).clone(), format!("{}\n", err));
                graph.set_state(Writer::Runner, id, TaskState::Runnable, TaskState::Error)?;
                graph.update(id, Some(result))?;
                Err(err.into())
            }
        }
    }

    /// Completes at most one finished task, without blocking.
    pub fn reap(&mut self, graph: &mut TaskGraph) -> Result<Option<TaskId>, InvariantViolation> {
        for idx in 0..self.running.len() {
            if let Some(exit) = self.host.poll(self.running[idx].process) {
                let running = self.running.swap_remove(idx);
                return self.complete(graph, running, exit).map(Some);
            }
        }
        Ok(None)
    }

    /// Blocks until a task finishes and completes it.  Returns None when
    /// nothing is running.
    pub fn wait(&mut self, graph: &mut TaskGraph) -> Result<Option<TaskId>, InvariantViolation> {
        if let Some(id) = self.reap(graph)? {
            return Ok(Some(id));
        }
        while !self.running.is_empty() {
            let Some((process, exit)) = self.host.block_wait_any() else {
                break;
            };
            match self.running.iter().position(|r| r.process == process) {
                Some(idx) => {
                    let running = self.running.swap_remove(idx);
                    return self.complete(graph, running, exit).map(Some);
                }
                None => debug!(?process, "ignoring exit of unknown process"),
            }
        }
        Ok(None)
    }

    fn complete(
        &mut self,
        graph: &mut TaskGraph,
        running: Running,
        exit: anyhow::Result<Exit>,
    ) -> Result<TaskId, InvariantViolation> {
        let end = Instant::now();
        self.tids.release(running.tid);
        let id = running.task;
        let spec = graph.task(id).ok_or(InvariantViolation::Detached(id))?.spec().clone();
        trace::write_complete(&spec.label(), running.tid, running.start, end);

        let mut result = match exit {
            Ok(exit) => TaskResult {
                termination: exit.termination,
                target_ids: BTreeMap::new(),
                output_hashes: BTreeMap::new(),
                stdout: exit.stdout,
                stderr: exit.stderr,
                task: spec,
                metrics: exit.metrics,
            },
            Err(err) => TaskResult {
                termination: Termination::Lost,
                target_ids: BTreeMap::new(),
                output_hashes: BTreeMap::new(),
                stdout: Vec::new(),
                stderr: format!("{:#}", err).into_bytes(),
                task: spec,
                metrics: Metrics {
                    wall: end - running.start,
                    ..Metrics::default()
                },
            },
        };
        if result.termination == Termination::Exited(0) {
            self.record_outputs(graph, id, &mut result);
        }

        let state = if result.success() {
            TaskState::Done
        } else {
            TaskState::Error
        };
        info!(
            task = %result.task.label(),
            termination = ?result.termination,
            wall_ms = result.metrics.wall.as_millis() as u64,
            "finished"
        );
        graph.set_state(Writer::Runner, id, TaskState::Running, state)?;
        graph.update(id, Some(result))?;
        Ok(id)
    }

    /// Hashes each produced target and assigns it the id computed when the
    /// task was evaluated.  A task that exits cleanly without writing every
    /// declared target has failed.
    fn record_outputs(&self, graph: &TaskGraph, id: TaskId, result: &mut TaskResult) {
        let expected = graph.target_ids(id);
        let mut missing = false;
        for target in &result.task.targets {
            let Some(target_id) = expected.and_then(|ids| ids.get(target).copied()) else {
                // Only reachable if the task was replaced while running.
                warn!(task = ?id, target = %target, "no content id for target");
                missing = true;
                let _ = writeln!(result.stderr, "taskforce: no content id for target {}", target);
                continue;
            };
            match hash::hash_file(&*self.hasher, &self.layout.resolve(target)) {
                Ok(content) => {
                    result.output_hashes.insert(target.clone(), content);
                    result.target_ids.insert(target.clone(), target_id);
                }
                Err(err) => {
                    missing = true;
                    let _ = writeln!(
                        result.stderr,
                        "taskforce: target {} was not produced: {}",
                        target, err
                    );
                }
            }
        }
        if missing {
            result.target_ids.clear();
            result.output_hashes.clear();
        }
    }
}
