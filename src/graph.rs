//! The task graph: owns the live tasks, is the only place task state is
//! written, and announces every state change to its subscribers.

use crate::densemap::{DenseMap, Index};
use crate::hash::ContentId;
use crate::path::Path;
use crate::process::ProcessId;
use crate::task::{Task, TaskId, TaskResult, TaskState};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// The components allowed to write task state.  Every legal transition has
/// exactly one owner; see `Writer::owner`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Writer {
    Evaluator,
    Scheduler,
    Runner,
}

impl Writer {
    /// The component owning the `from -> to` transition, or None if the
    /// transition is not legal at all.
    pub fn owner(from: TaskState, to: TaskState) -> Option<Writer> {
        use TaskState::*;
        match (from, to) {
            (Unknown, Unsatisfied | Runnable | Done) => Some(Writer::Evaluator),
            (Unsatisfied, Runnable | Done) => Some(Writer::Evaluator),
            // Invalidation, for the next generation.  Running tasks are never
            // reset; they must finish first.
            (Unsatisfied | Runnable | Done | Error, Unknown) => Some(Writer::Evaluator),
            (Runnable, Running) => Some(Writer::Scheduler),
            (Running, Done | Error) => Some(Writer::Runner),
            // Spawn failure.
            (Runnable, Error) => Some(Writer::Runner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("task {task:?}: expected state {expected:?} but found {found:?}")]
    StateMismatch {
        task: TaskId,
        expected: TaskState,
        found: TaskState,
    },
    #[error("task {task:?}: {writer:?} may not move a task from {from:?} to {to:?}")]
    IllegalTransition {
        task: TaskId,
        writer: Writer,
        from: TaskState,
        to: TaskState,
    },
    #[error("task {task:?}: entering {state:?} requires a result")]
    MissingResult { task: TaskId, state: TaskState },
    #[error("task {task:?}: a result cannot accompany state {state:?}")]
    UnexpectedResult { task: TaskId, state: TaskState },
    #[error("task {0:?} is not in this graph")]
    Detached(TaskId),
    #[error("task {0:?} has no content ids; it was never evaluated")]
    Unevaluated(TaskId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("multiple tasks build target {0}")]
    DuplicateTarget(Path),
    #[error("task {0:?} declares no targets")]
    NoTargets(String),
    #[error("dependency cycle among [{}]", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("{label} is still needed by {} other task(s)", .dependents.len())]
    DanglingDependency {
        label: String,
        dependents: Vec<TaskId>,
    },
    #[error("task {0:?} is running")]
    Busy(TaskId),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Something that wants to hear about state changes.
///
/// Notifications are delivered synchronously, in subscription order.  A
/// subscriber may itself write state and call `update`; the resulting
/// notification is queued and delivered once the current one has reached
/// every subscriber.
pub trait Subscriber {
    /// Called once, when the subscriber is registered.
    fn on_subscribe(&mut self, _graph: &mut TaskGraph) {}

    fn on_task_update(&mut self, graph: &mut TaskGraph, id: TaskId, result: Option<&TaskResult>);

    /// Called when a file that tasks may depend on has changed.
    fn on_source_changed(&mut self, _graph: &mut TaskGraph, _path: &Path) {}
}

enum Event {
    Task(TaskId, Option<Arc<TaskResult>>),
    SourceChanged(Path),
}

struct Slot {
    task: Task,
    /// The state as of the last `update`; what snapshots report.
    committed: TaskState,
    result: Option<Arc<TaskResult>>,
    /// Current per-target content ids, as computed by evaluation.
    target_ids: Option<Arc<BTreeMap<Path, ContentId>>>,
}

/// Number of tasks in each committed state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateCounts {
    pub unknown: usize,
    pub unsatisfied: usize,
    pub runnable: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
}

impl StateCounts {
    fn add(&mut self, state: TaskState) {
        let n = match state {
            TaskState::Unknown => &mut self.unknown,
            TaskState::Unsatisfied => &mut self.unsatisfied,
            TaskState::Runnable => &mut self.runnable,
            TaskState::Running => &mut self.running,
            TaskState::Done => &mut self.done,
            TaskState::Error => &mut self.error,
        };
        *n += 1;
    }

    pub fn total(&self) -> usize {
        self.unknown + self.unsatisfied + self.runnable + self.running + self.done + self.error
    }
}

#[derive(Default)]
pub struct TaskGraph {
    slots: DenseMap<TaskId, Option<Slot>>,
    /// Target path to the task that builds it.
    producers: FxHashMap<Path, TaskId>,
    /// Tree-relative name of every target, to keep a name out of two trees.
    claimed: FxHashMap<String, TaskId>,
    /// Source path to the tasks reading it.  Reverse edges derive from this.
    consumers: FxHashMap<Path, BTreeSet<TaskId>>,
    unsatisfied: BTreeSet<TaskId>,
    runnable: BTreeSet<TaskId>,
    live: usize,
    subscribers: Vec<Box<dyn Subscriber>>,
    queue: VecDeque<Event>,
    draining: bool,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id).map(|slot| &slot.task)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.task(id).map(Task::state)
    }

    /// Live tasks, in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.slots.live().map(|(id, slot)| (id, &slot.task))
    }

    pub fn producer(&self, path: &Path) -> Option<TaskId> {
        self.producers.get(path).copied()
    }

    /// Tasks reading `path` as a source.
    pub fn consumers(&self, path: &Path) -> impl Iterator<Item = TaskId> + '_ {
        self.consumers.get(path).into_iter().flatten().copied()
    }

    /// The tasks producing the sources of `id`.
    pub fn dependencies(&self, id: TaskId) -> BTreeSet<TaskId> {
        let Some(task) = self.task(id) else {
            return BTreeSet::new();
        };
        task.spec()
            .sources
            .iter()
            .filter_map(|source| self.producer(source))
            .collect()
    }

    /// The tasks reading any target of `id`.
    pub fn dependents(&self, id: TaskId) -> BTreeSet<TaskId> {
        let Some(task) = self.task(id) else {
            return BTreeSet::new();
        };
        task.spec()
            .targets
            .iter()
            .flat_map(|target| self.consumers(target))
            .collect()
    }

    /// The result recorded by the most recent transition to Done or Error.
    pub fn last_result(&self, id: TaskId) -> Option<&Arc<TaskResult>> {
        self.slots.get(id).and_then(|slot| slot.result.as_ref())
    }

    pub fn target_ids(&self, id: TaskId) -> Option<&Arc<BTreeMap<Path, ContentId>>> {
        self.slots.get(id).and_then(|slot| slot.target_ids.as_ref())
    }

    /// Records the content ids evaluation computed for a task's targets.
    pub fn record_target_ids(
        &mut self,
        id: TaskId,
        ids: BTreeMap<Path, ContentId>,
    ) -> Result<(), InvariantViolation> {
        let slot = self.slots.get_mut(id).ok_or(InvariantViolation::Detached(id))?;
        slot.target_ids = Some(Arc::new(ids));
        Ok(())
    }

    /// Tasks committed as Unsatisfied, in insertion order.
    pub fn unsatisfied(&self) -> Vec<TaskId> {
        self.unsatisfied.iter().copied().collect()
    }

    /// Tasks committed as Runnable, in insertion order.
    pub fn runnable(&self) -> Vec<TaskId> {
        self.runnable.iter().copied().collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for (_, slot) in self.slots.live() {
            counts.add(slot.committed);
        }
        counts
    }

    pub fn add(&mut self, task: Task) -> Result<TaskId, GraphError> {
        let ids = self.add_all(vec![task])?;
        Ok(ids[0])
    }

    /// Adds a batch of tasks atomically: either all of them are added, or the
    /// graph is left untouched.
    pub fn add_all(&mut self, tasks: Vec<Task>) -> Result<Vec<TaskId>, GraphError> {
        self.check_targets(&tasks)?;
        self.check_acyclic(&tasks)?;

        let mut ids = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let id = self.slots.next_id();
            for target in &task.spec().targets {
                self.producers.insert(target.clone(), id);
                self.claimed.insert(target.rel().to_owned(), id);
            }
            for source in &task.spec().sources {
                self.consumers.entry(source.clone()).or_default().insert(id);
            }
            task.state = TaskState::Unknown;
            task.process = None;
            debug!(task = %task.spec().label(), ?id, "added");
            self.slots.push(Some(Slot {
                task,
                committed: TaskState::Unknown,
                result: None,
                target_ids: None,
            }));
            self.live += 1;
            ids.push(id);
        }

        for &id in &ids {
            self.queue.push_back(Event::Task(id, None));
        }
        self.drain();
        Ok(ids)
    }

    fn check_targets(&self, tasks: &[Task]) -> Result<(), GraphError> {
        let mut batch: FxHashMap<&str, ()> = FxHashMap::default();
        for task in tasks {
            let spec = task.spec();
            if spec.targets.is_empty() {
                return Err(GraphError::NoTargets(spec.cmdline()));
            }
            for target in &spec.targets {
                if self.claimed.contains_key(target.rel())
                    || batch.insert(target.rel(), ()).is_some()
                {
                    return Err(GraphError::DuplicateTarget(target.clone()));
                }
            }
        }
        Ok(())
    }

    /// Runs Kahn's algorithm over the graph as it would be with `new` added.
    /// The existing graph is acyclic, so any cycle involves a new task.
    fn check_acyclic(&self, new: &[Task]) -> Result<(), GraphError> {
        let base = self.slots.len();
        let mut nodes: Vec<(usize, &Task)> = self
            .slots
            .live()
            .map(|(id, slot)| (id.index(), &slot.task))
            .collect();
        nodes.extend(new.iter().enumerate().map(|(i, task)| (base + i, task)));

        let mut new_producers: FxHashMap<&Path, usize> = FxHashMap::default();
        for (i, task) in new.iter().enumerate() {
            for target in &task.spec().targets {
                new_producers.insert(target, base + i);
            }
        }
        let producer = |path: &Path| {
            self.producers
                .get(path)
                .map(|id| id.index())
                .or_else(|| new_producers.get(path).copied())
        };

        let total = base + new.len();
        let mut indegree = vec![0usize; total];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); total];
        for &(node, task) in &nodes {
            for source in &task.spec().sources {
                if let Some(from) = producer(source) {
                    indegree[node] += 1;
                    edges[from].push(node);
                }
            }
        }

        let mut ready: VecDeque<usize> = nodes
            .iter()
            .map(|&(node, _)| node)
            .filter(|&node| indegree[node] == 0)
            .collect();
        let mut visited = 0;
        while let Some(node) = ready.pop_front() {
            visited += 1;
            for &next in &edges[node] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if visited == nodes.len() {
            return Ok(());
        }

        // Whatever was never freed is on a cycle or downstream of one.
        let stuck = nodes
            .iter()
            .filter(|&&(node, _)| indegree[node] > 0)
            .map(|(_, task)| task.spec().label())
            .collect();
        Err(GraphError::Cycle(stuck))
    }

    /// Detaches a task from the graph and hands it back.
    pub fn remove(&mut self, id: TaskId) -> Result<Task, GraphError> {
        let task = self.task(id).ok_or(InvariantViolation::Detached(id))?;
        if task.state == TaskState::Running {
            return Err(GraphError::Busy(id));
        }
        let dependents: Vec<TaskId> = self.dependents(id).into_iter().collect();
        if !dependents.is_empty() {
            return Err(GraphError::DanglingDependency {
                label: task.spec().label(),
                dependents,
            });
        }

        let slot = self.slots.take(id).ok_or(InvariantViolation::Detached(id))?;
        for target in &slot.task.spec().targets {
            self.producers.remove(target);
            self.claimed.remove(target.rel());
        }
        for source in &slot.task.spec().sources {
            if let Some(readers) = self.consumers.get_mut(source) {
                readers.remove(&id);
                if readers.is_empty() {
                    self.consumers.remove(source);
                }
            }
        }
        self.unsatisfied.remove(&id);
        self.runnable.remove(&id);
        self.live -= 1;
        debug!(task = %slot.task.spec().label(), ?id, "removed");
        Ok(slot.task)
    }

    /// Compare-and-swap of a task's state.  Fails if the task is not in `old`
    /// (someone else moved it) or if `writer` does not own the transition.
    ///
    /// The change is not visible in snapshots until announced by `update`.
    pub fn set_state(
        &mut self,
        writer: Writer,
        id: TaskId,
        old: TaskState,
        new: TaskState,
    ) -> Result<(), InvariantViolation> {
        let slot = self.slots.get_mut(id).ok_or(InvariantViolation::Detached(id))?;
        let found = slot.task.state;
        if found != old {
            return Err(InvariantViolation::StateMismatch {
                task: id,
                expected: old,
                found,
            });
        }
        if Writer::owner(old, new) != Some(writer) {
            return Err(InvariantViolation::IllegalTransition {
                task: id,
                writer,
                from: old,
                to: new,
            });
        }
        slot.task.state = new;
        if new != TaskState::Running {
            slot.task.process = None;
        }
        debug!(task = %slot.task.spec().label(), ?old, ?new, ?writer, "state");
        Ok(())
    }

    /// Associates a running task with its process.
    pub fn attach_process(
        &mut self,
        id: TaskId,
        process: ProcessId,
    ) -> Result<(), InvariantViolation> {
        let slot = self.slots.get_mut(id).ok_or(InvariantViolation::Detached(id))?;
        if slot.task.state != TaskState::Running {
            return Err(InvariantViolation::StateMismatch {
                task: id,
                expected: TaskState::Running,
                found: slot.task.state,
            });
        }
        slot.task.process = Some(process);
        Ok(())
    }

    /// Commits the task's current state and announces it to subscribers.
    /// Done and Error must come with the result that produced them; other
    /// states must not.
    pub fn update(
        &mut self,
        id: TaskId,
        result: Option<TaskResult>,
    ) -> Result<(), InvariantViolation> {
        let slot = self.slots.get_mut(id).ok_or(InvariantViolation::Detached(id))?;
        let state = slot.task.state;
        match (state.is_terminal(), result.is_some()) {
            (true, false) => return Err(InvariantViolation::MissingResult { task: id, state }),
            (false, true) => {
                return Err(InvariantViolation::UnexpectedResult { task: id, state })
            }
            _ => {}
        }
        let result = result.map(Arc::new);
        if result.is_some() {
            slot.result = result.clone();
        }
        let prev = std::mem::replace(&mut slot.committed, state);

        match prev {
            TaskState::Unsatisfied => {
                self.unsatisfied.remove(&id);
            }
            TaskState::Runnable => {
                self.runnable.remove(&id);
            }
            _ => {}
        }
        match state {
            TaskState::Unsatisfied => {
                self.unsatisfied.insert(id);
            }
            TaskState::Runnable => {
                self.runnable.insert(id);
            }
            _ => {}
        }

        self.queue.push_back(Event::Task(id, result));
        self.drain();
        Ok(())
    }

    /// Announces that a file changed, e.g. from a filesystem watcher.
    pub fn source_changed(&mut self, path: Path) {
        self.queue.push_back(Event::SourceChanged(path));
        self.drain();
    }

    pub fn subscribe(&mut self, mut subscriber: Box<dyn Subscriber>) {
        subscriber.on_subscribe(self);
        self.subscribers.push(subscriber);
    }

    /// Delivers queued events until the queue is empty.  Reentrant calls
    /// (from a subscriber's `update`) only enqueue.
    fn drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        let mut subscribers = std::mem::take(&mut self.subscribers);
        while let Some(event) = self.queue.pop_front() {
            for subscriber in subscribers.iter_mut() {
                match &event {
                    Event::Task(id, result) => {
                        subscriber.on_task_update(self, *id, result.as_deref())
                    }
                    Event::SourceChanged(path) => subscriber.on_source_changed(self, path),
                }
            }
        }
        // Anyone subscribing mid-drain goes after the existing subscribers.
        subscribers.append(&mut self.subscribers);
        self.subscribers = subscribers;
        self.draining = false;
    }
}
