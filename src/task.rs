//! Tasks, their states, and the results of running them.

use crate::densemap;
use crate::hash::ContentId;
use crate::path::Path;
use crate::process::ProcessId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(usize);
impl densemap::Index for TaskId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for TaskId {
    fn from(u: usize) -> TaskId {
        TaskId(u)
    }
}

/// The state of a task within the current build generation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskState {
    /// Not yet evaluated, e.g. just added or invalidated by a change.
    Unknown,
    /// Needs to run, but some dependency is not done yet.
    Unsatisfied,
    /// Needs to run, and all direct dependencies are done.
    Runnable,
    Running,
    /// Outputs are up to date.
    Done,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error)
    }
}

/// The immutable description of a task: what it reads, what it writes, and
/// the exact process to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub targets: BTreeSet<Path>,
    pub sources: BTreeSet<Path>,
    /// Path to the executable.  Never interpreted by a shell.
    pub cmd: String,
    /// Arguments passed literally as argv[1..].
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl TaskSpec {
    pub fn new(
        targets: impl IntoIterator<Item = Path>,
        sources: impl IntoIterator<Item = Path>,
        cmd: impl Into<String>,
    ) -> Self {
        TaskSpec {
            targets: targets.into_iter().collect(),
            sources: sources.into_iter().collect(),
            cmd: cmd.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdin: None,
            capture_stdout: true,
            capture_stderr: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn capture(mut self, stdout: bool, stderr: bool) -> Self {
        self.capture_stdout = stdout;
        self.capture_stderr = stderr;
        self
    }

    /// Short human-readable description, used in progress and errors.
    pub fn label(&self) -> String {
        match self.targets.iter().next() {
            Some(first) if self.targets.len() > 1 => {
                format!("{} (+{} more)", first, self.targets.len() - 1)
            }
            Some(first) => first.to_string(),
            None => self.cmd.clone(),
        }
    }

    /// The command line for display; not something to hand to a shell.
    pub fn cmdline(&self) -> String {
        let mut line = self.cmd.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A task: an immutable spec plus the mutable state owned by its graph.
///
/// Fields other than the spec can only be changed by the `TaskGraph` holding
/// the task.
#[derive(Debug)]
pub struct Task {
    spec: Arc<TaskSpec>,
    pub(crate) state: TaskState,
    /// The running process, present only while Running.
    pub(crate) process: Option<ProcessId>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Task {
            spec: Arc::new(spec),
            state: TaskState::Unknown,
            process: None,
        }
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub(crate) fn spec_arc(&self) -> Arc<TaskSpec> {
        self.spec.clone()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn process(&self) -> Option<ProcessId> {
        self.process
    }
}

/// How a task's process ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// The process could not be spawned.
    NotStarted,
    /// The process is gone but its exit status could not be collected.
    Lost,
    /// Nothing ran: the outputs were already up to date.
    UpToDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub wall: Duration,
    pub user: Option<Duration>,
    pub system: Option<Duration>,
    /// Peak resident set size, in kilobytes.
    pub max_rss_kb: Option<u64>,
}

/// The record of one completed execution of a task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub termination: Termination,
    /// Per-target content ids; only populated on success.
    pub target_ids: BTreeMap<Path, ContentId>,
    /// Hashes of the bytes of each produced target; only populated on
    /// success of a process that actually ran.
    pub output_hashes: BTreeMap<Path, ContentId>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The task as it was when it finished.
    pub task: TaskSpec,
    pub metrics: Metrics,
}

impl TaskResult {
    pub fn success(&self) -> bool {
        match self.termination {
            Termination::Exited(0) | Termination::UpToDate => {
                self.target_ids.len() == self.task.targets.len()
            }
            _ => false,
        }
    }

    /// Whether a process actually ran to produce this result.
    pub fn ran(&self) -> bool {
        matches!(
            self.termination,
            Termination::Exited(_) | Termination::Signaled(_)
        )
    }

    /// The result recorded when evaluation finds the outputs already current.
    pub fn up_to_date(task: TaskSpec, target_ids: BTreeMap<Path, ContentId>) -> Self {
        TaskResult {
            termination: Termination::UpToDate,
            target_ids,
            output_hashes: BTreeMap::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            task,
            metrics: Metrics::default(),
        }
    }

    pub fn spawn_failed(task: TaskSpec, message: String) -> Self {
        TaskResult {
            termination: Termination::NotStarted,
            target_ids: BTreeMap::new(),
            output_hashes: BTreeMap::new(),
            stdout: Vec::new(),
            stderr: message.into_bytes(),
            task,
            metrics: Metrics::default(),
        }
    }
}
