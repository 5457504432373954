//! Decides which tasks need to run.
//!
//! The evaluator is a graph subscriber.  Whenever a task becomes Unknown it
//! computes the task's content id and either finds the outputs already built
//! (Done), or marks it Runnable or Unsatisfied depending on whether its
//! dependencies are done.  When a task becomes Done its dependents are
//! promoted.
//!
//! Classification visits dependencies first, so a task that is not Unknown
//! never has an Unknown dependency.

use crate::cache::Cache;
use crate::graph::{InvariantViolation, Subscriber, TaskGraph, Writer};
use crate::hash::{self, ContentHasher, ContentId, IdInputs};
use crate::path::{Layout, Path};
use crate::task::{TaskId, TaskResult, TaskState, Termination};
use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Memoized hashes of files that no task produces.
pub struct SourceHashes {
    hasher: Arc<dyn ContentHasher>,
    layout: Layout,
    /// None for a file that could not be read.
    memo: DashMap<Path, Option<ContentId>>,
}

impl SourceHashes {
    pub fn new(hasher: Arc<dyn ContentHasher>, layout: Layout) -> Self {
        SourceHashes {
            hasher,
            layout,
            memo: DashMap::new(),
        }
    }

    pub fn get(&self, path: &Path) -> Option<ContentId> {
        if let Some(id) = self.memo.get(path) {
            return *id;
        }
        let id = self.read(path);
        self.memo.insert(path.clone(), id);
        id
    }

    fn read(&self, path: &Path) -> Option<ContentId> {
        match hash::hash_file(&*self.hasher, &self.layout.resolve(path)) {
            Ok(id) => Some(id),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path, %err, "unreadable source");
                None
            }
        }
    }

    /// Hashes all of `paths` in parallel.
    pub fn prime(&self, paths: &[Path]) {
        paths.par_iter().for_each(|path| {
            self.get(path);
        });
    }

    pub fn forget(&self, path: &Path) {
        self.memo.remove(path);
    }
}

pub struct Evaluator {
    cache: Box<dyn Cache>,
    hasher: Arc<dyn ContentHasher>,
    sources: SourceHashes,
    layout: Layout,
    /// Global settings folded into every task id.
    scope: BTreeMap<String, String>,
    /// Running tasks whose inputs changed; reset once they finish.
    stale: FxHashSet<TaskId>,
}

impl Evaluator {
    pub fn new(
        cache: Box<dyn Cache>,
        hasher: Arc<dyn ContentHasher>,
        layout: Layout,
        scope: BTreeMap<String, String>,
    ) -> Self {
        Evaluator {
            cache,
            sources: SourceHashes::new(hasher.clone(), layout.clone()),
            hasher,
            layout,
            scope,
            stale: FxHashSet::default(),
        }
    }

    /// Whether every target is on disk and was built with exactly this id.
    fn up_to_date(&self, ids: &BTreeMap<Path, ContentId>) -> bool {
        ids.iter().all(|(target, id)| {
            self.cache.lookup(target) == Some(*id) && self.layout.resolve(target).exists()
        })
    }

    fn source_id(&self, graph: &TaskGraph, source: &Path) -> ContentId {
        let recorded = graph
            .producer(source)
            .and_then(|producer| graph.target_ids(producer))
            .and_then(|ids| ids.get(source).copied());
        if let Some(id) = recorded {
            return id;
        }
        self.sources
            .get(source)
            .unwrap_or_else(|| hash::missing_id(&*self.hasher, source))
    }

    fn compute_ids(
        &self,
        graph: &TaskGraph,
        id: TaskId,
    ) -> Result<BTreeMap<Path, ContentId>, InvariantViolation> {
        let spec = graph.task(id).ok_or(InvariantViolation::Detached(id))?.spec();
        let sources: Vec<(Path, ContentId)> = spec
            .sources
            .iter()
            .map(|source| (source.clone(), self.source_id(graph, source)))
            .collect();
        let task_id = hash::task_id(
            &*self.hasher,
            &IdInputs {
                cmd: &spec.cmd,
                args: &spec.args,
                env: &spec.env,
                stdin: spec.stdin.as_deref(),
                scope: &self.scope,
                sources: &sources,
            },
        );
        Ok(spec
            .targets
            .iter()
            .map(|target| {
                (
                    target.clone(),
                    hash::target_id(&*self.hasher, &task_id, target),
                )
            })
            .collect())
    }

    fn dependencies_done(graph: &TaskGraph, id: TaskId) -> bool {
        graph
            .dependencies(id)
            .into_iter()
            .all(|dep| graph.state(dep) == Some(TaskState::Done))
    }

    /// Marks a task Done because its outputs are already current.
    fn settle(
        &self,
        graph: &mut TaskGraph,
        id: TaskId,
        from: TaskState,
        ids: BTreeMap<Path, ContentId>,
    ) -> Result<(), InvariantViolation> {
        let spec = graph.task(id).ok_or(InvariantViolation::Detached(id))?.spec().clone();
        debug!(task = %spec.label(), "up to date");
        graph.set_state(Writer::Evaluator, id, from, TaskState::Done)?;
        graph.update(id, Some(TaskResult::up_to_date(spec, ids)))
    }

    fn classify_one(&mut self, graph: &mut TaskGraph, id: TaskId) -> Result<(), InvariantViolation> {
        let ids = self.compute_ids(graph, id)?;
        graph.record_target_ids(id, ids.clone())?;
        if self.up_to_date(&ids) {
            return self.settle(graph, id, TaskState::Unknown, ids);
        }
        let next = if Self::dependencies_done(graph, id) {
            TaskState::Runnable
        } else {
            TaskState::Unsatisfied
        };
        graph.set_state(Writer::Evaluator, id, TaskState::Unknown, next)?;
        graph.update(id, None)
    }

    /// Classifies `root` and, first, any of its dependencies that are still
    /// Unknown.
    fn classify(&mut self, graph: &mut TaskGraph, root: TaskId) -> Result<(), InvariantViolation> {
        // Iterative post-order, as dependency chains can be long.
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if graph.state(id) != Some(TaskState::Unknown) {
                continue;
            }
            if expanded {
                self.classify_one(graph, id)?;
                continue;
            }
            stack.push((id, true));
            for dep in graph.dependencies(id) {
                if graph.state(dep) == Some(TaskState::Unknown) {
                    stack.push((dep, false));
                }
            }
        }
        Ok(())
    }

    /// Resets `roots` and everything downstream of them to Unknown, so they
    /// are evaluated again.  Running tasks cannot be reset; they are
    /// remembered and reset when they finish.
    fn invalidate(
        &mut self,
        graph: &mut TaskGraph,
        roots: impl IntoIterator<Item = TaskId>,
    ) -> Result<(), InvariantViolation> {
        let mut stack: Vec<TaskId> = roots.into_iter().collect();
        let mut seen = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match graph.state(id) {
                None | Some(TaskState::Unknown) => continue,
                Some(TaskState::Running) => {
                    self.stale.insert(id);
                }
                Some(state) => {
                    graph.set_state(Writer::Evaluator, id, state, TaskState::Unknown)?;
                    graph.update(id, None)?;
                }
            }
            stack.extend(graph.dependents(id));
        }
        Ok(())
    }

    fn promote_dependents(
        &mut self,
        graph: &mut TaskGraph,
        id: TaskId,
    ) -> Result<(), InvariantViolation> {
        for dep in graph.dependents(id) {
            if graph.state(dep) != Some(TaskState::Unsatisfied)
                || !Self::dependencies_done(graph, dep)
            {
                continue;
            }
            let ids = graph.target_ids(dep).map(|ids| (**ids).clone());
            match ids {
                Some(ids) if self.up_to_date(&ids) => {
                    self.settle(graph, dep, TaskState::Unsatisfied, ids)?
                }
                _ => {
                    graph.set_state(
                        Writer::Evaluator,
                        dep,
                        TaskState::Unsatisfied,
                        TaskState::Runnable,
                    )?;
                    graph.update(dep, None)?;
                }
            }
        }
        Ok(())
    }

    /// Updates the cache after a process ran.  Only a successful run whose
    /// inputs did not change under it vouches for its outputs; any other run
    /// may have overwritten them, so what was cached for them is dropped.
    fn record(&mut self, result: &TaskResult, stale: bool) {
        if result.success() && !stale {
            for (target, target_id) in &result.target_ids {
                if let Err(err) = self.cache.store(target, *target_id) {
                    error!(target = %target, "storing build record: {:#}", err);
                }
            }
            return;
        }
        for target in &result.task.targets {
            if let Err(err) = self.cache.forget(target) {
                error!(target = %target, "dropping build record: {:#}", err);
            }
        }
    }

    fn finished(
        &mut self,
        graph: &mut TaskGraph,
        id: TaskId,
        result: &TaskResult,
    ) -> Result<(), InvariantViolation> {
        let stale = self.stale.remove(&id);
        // A lost process may still have written its targets.
        if result.ran() || result.termination == Termination::Lost {
            self.record(result, stale);
        }
        let Some(state) = graph.state(id) else {
            return Ok(());
        };
        if stale && state.is_terminal() {
            debug!(task = %result.task.label(), "inputs changed while running");
            graph.set_state(Writer::Evaluator, id, state, TaskState::Unknown)?;
            return graph.update(id, None);
        }
        if state == TaskState::Done {
            self.promote_dependents(graph, id)?;
        }
        Ok(())
    }

    fn reevaluate(&mut self, graph: &mut TaskGraph, id: TaskId) -> Result<(), InvariantViolation> {
        // A task entering the graph may produce files existing tasks read.
        let dependents = graph.dependents(id);
        self.invalidate(graph, dependents)?;
        self.classify(graph, id)
    }
}

impl Subscriber for Evaluator {
    fn on_subscribe(&mut self, graph: &mut TaskGraph) {
        let plain: Vec<Path> = graph
            .tasks()
            .flat_map(|(_, task)| task.spec().sources.iter())
            .filter(|source| graph.producer(source).is_none())
            .cloned()
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        self.sources.prime(&plain);

        let unknown: Vec<TaskId> = graph
            .tasks()
            .filter(|(_, task)| task.state() == TaskState::Unknown)
            .map(|(id, _)| id)
            .collect();
        for id in unknown {
            if let Err(err) = self.classify(graph, id) {
                error!("evaluating {:?}: {}", id, err);
            }
        }
    }

    fn on_task_update(&mut self, graph: &mut TaskGraph, id: TaskId, result: Option<&TaskResult>) {
        let outcome = match (graph.state(id), result) {
            (Some(TaskState::Unknown), _) => self.reevaluate(graph, id),
            (Some(_), Some(result)) => self.finished(graph, id, result),
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            error!("evaluating {:?}: {}", id, err);
        }
    }

    fn on_source_changed(&mut self, graph: &mut TaskGraph, path: &Path) {
        self.sources.forget(path);
        let mut roots: Vec<TaskId> = graph.consumers(path).collect();
        roots.extend(graph.producer(path));
        if let Err(err) = self.invalidate(graph, roots) {
            error!("invalidating after change to {}: {}", path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::hash::Blake3Hasher;
    use crate::task::{Task, TaskSpec};

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        cache: MemoryCache,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::rooted(dir.path());
            std::fs::create_dir_all(&layout.build).unwrap();
            Fixture {
                _dir: dir,
                layout,
                cache: MemoryCache::new(),
            }
        }

        fn evaluator(&self) -> Box<Evaluator> {
            Box::new(Evaluator::new(
                Box::new(self.cache.clone()),
                Arc::new(Blake3Hasher),
                self.layout.clone(),
                BTreeMap::new(),
            ))
        }

        fn write(&self, path: &str, content: &str) {
            let file = self.layout.resolve(&p(path));
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, content).unwrap();
        }

        /// Does what scheduler and runner would: runs the task, writing its
        /// targets, and reports success.
        fn finish(&self, graph: &mut TaskGraph, id: TaskId) {
            graph
                .set_state(Writer::Scheduler, id, TaskState::Runnable, TaskState::Running)
                .unwrap();
            graph.update(id, None).unwrap();
            self.complete(graph, id);
        }

        /// Runs the task and reports failure, after it clobbered its
        /// targets.
        fn fail(&self, graph: &mut TaskGraph, id: TaskId) {
            graph
                .set_state(Writer::Scheduler, id, TaskState::Runnable, TaskState::Running)
                .unwrap();
            graph.update(id, None).unwrap();
            let spec = graph.task(id).unwrap().spec().clone();
            for target in &spec.targets {
                self.write(&target.to_string(), "half-written");
            }
            let mut result = TaskResult::spawn_failed(spec, String::new());
            result.termination = Termination::Exited(1);
            graph
                .set_state(Writer::Runner, id, TaskState::Running, TaskState::Error)
                .unwrap();
            graph.update(id, Some(result)).unwrap();
        }

        fn complete(&self, graph: &mut TaskGraph, id: TaskId) {
            let spec = graph.task(id).unwrap().spec().clone();
            for target in &spec.targets {
                self.write(&target.to_string(), "built");
            }
            let ids = (**graph.target_ids(id).unwrap()).clone();
            let mut result = TaskResult::up_to_date(spec, ids);
            result.termination = Termination::Exited(0);
            graph
                .set_state(Writer::Runner, id, TaskState::Running, TaskState::Done)
                .unwrap();
            graph.update(id, Some(result)).unwrap();
        }
    }

    fn task(target: &str, sources: &[&str]) -> Task {
        Task::new(TaskSpec::new([p(target)], sources.iter().map(|s| p(s)), "/bin/cp"))
    }

    /// a.c -> #/a -> #/b
    fn chain(fx: &Fixture) -> (TaskGraph, TaskId, TaskId) {
        let mut graph = TaskGraph::new();
        graph.subscribe(fx.evaluator());
        let ids = graph
            .add_all(vec![task("#/a", &["a.c"]), task("#/b", &["#/a"])])
            .unwrap();
        (graph, ids[0], ids[1])
    }

    #[test]
    fn fresh_build_runs_in_order() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        assert_eq!(graph.runnable(), vec![a]);
        assert_eq!(graph.unsatisfied(), vec![b]);

        fx.finish(&mut graph, a);
        assert_eq!(fx.cache.get(&p("#/a")), Some(graph.target_ids(a).unwrap()[&p("#/a")]));
        assert_eq!(graph.runnable(), vec![b]);
        fx.finish(&mut graph, b);
        assert_eq!(graph.counts().done, 2);
    }

    #[test]
    fn second_build_is_a_no_op() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        fx.finish(&mut graph, a);
        fx.finish(&mut graph, b);

        let (graph, a, b) = chain(&fx);
        assert_eq!(graph.state(a), Some(TaskState::Done));
        assert_eq!(graph.state(b), Some(TaskState::Done));
        assert_eq!(
            graph.last_result(b).unwrap().termination,
            Termination::UpToDate
        );
        assert!(graph.runnable().is_empty());
    }

    #[test]
    fn source_change_rebuilds_downstream() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        fx.finish(&mut graph, a);
        fx.finish(&mut graph, b);
        let old = graph.target_ids(b).unwrap().clone();

        fx.write("a.c", "int a = 1;");
        graph.source_changed(p("a.c"));
        assert_eq!(graph.runnable(), vec![a]);
        assert_eq!(graph.unsatisfied(), vec![b]);
        assert_ne!(graph.target_ids(b).unwrap(), &old);
    }

    #[test]
    fn deleted_output_reruns_only_its_producer() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        fx.finish(&mut graph, a);
        fx.finish(&mut graph, b);

        std::fs::remove_file(fx.layout.resolve(&p("#/b"))).unwrap();
        let (graph, a, b) = chain(&fx);
        assert_eq!(graph.state(a), Some(TaskState::Done));
        assert_eq!(graph.runnable(), vec![b]);
    }

    #[test]
    fn downstream_of_rebuilt_task_can_stay_done() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        fx.finish(&mut graph, a);
        fx.finish(&mut graph, b);

        // #/a is regenerated with the same id, so #/b is still current.
        std::fs::remove_file(fx.layout.resolve(&p("#/a"))).unwrap();
        let (graph, a, b) = chain(&fx);
        assert_eq!(graph.runnable(), vec![a]);
        assert_eq!(graph.state(b), Some(TaskState::Done));
    }

    #[test]
    fn cache_hit_after_dependency_finishes_skips_the_run() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        assert_eq!(graph.unsatisfied(), vec![b]);

        // Another build fills in #/b while #/a is still being built.
        let b_id = graph.target_ids(b).unwrap()[&p("#/b")];
        fx.cache.clone().store(&p("#/b"), b_id).unwrap();
        fx.write("#/b", "built");

        fx.finish(&mut graph, a);
        assert_eq!(graph.state(b), Some(TaskState::Done));
        assert_eq!(
            graph.last_result(b).unwrap().termination,
            Termination::UpToDate
        );
        assert!(graph.runnable().is_empty());
    }

    #[test]
    fn failed_run_forgets_cached_output() {
        let fx = Fixture::new();
        fx.write("a.c", "x");
        let (mut graph, a, b) = chain(&fx);
        fx.finish(&mut graph, a);
        fx.finish(&mut graph, b);
        assert!(fx.cache.get(&p("#/a")).is_some());

        fx.write("a.c", "y");
        graph.source_changed(p("a.c"));
        fx.fail(&mut graph, a);
        assert_eq!(graph.state(a), Some(TaskState::Error));
        assert_eq!(fx.cache.get(&p("#/a")), None);

        // Back to the inputs of the good build: #/a on disk is whatever the
        // failed run left, so it has to be rebuilt.
        fx.write("a.c", "x");
        let (graph, a, _) = chain(&fx);
        assert_eq!(graph.runnable(), vec![a]);
    }

    #[test]
    fn missing_source_still_runs() {
        let fx = Fixture::new();
        let (graph, a, _) = chain(&fx);
        assert_eq!(graph.runnable(), vec![a]);
    }

    #[test]
    fn change_while_running_reruns_after_finish() {
        let fx = Fixture::new();
        fx.write("a.c", "int a;");
        let (mut graph, a, b) = chain(&fx);
        graph
            .set_state(Writer::Scheduler, a, TaskState::Runnable, TaskState::Running)
            .unwrap();
        graph.update(a, None).unwrap();

        fx.write("a.c", "int a = 2;");
        graph.source_changed(p("a.c"));
        assert_eq!(graph.state(a), Some(TaskState::Running));

        fx.complete(&mut graph, a);
        // The output was built from newer inputs than its id says, so it is
        // not recorded, and the task runs again.
        assert!(fx.cache.is_empty());
        assert_eq!(graph.runnable(), vec![a]);
        assert_eq!(graph.unsatisfied(), vec![b]);
    }

    #[test]
    fn late_producer_invalidates_consumer() {
        let fx = Fixture::new();
        let mut graph = TaskGraph::new();
        graph.subscribe(fx.evaluator());
        let b = graph.add(task("#/b", &["#/gen.h"])).unwrap();
        assert_eq!(graph.runnable(), vec![b]);

        let gen = graph.add(task("#/gen.h", &[])).unwrap();
        assert_eq!(graph.runnable(), vec![gen]);
        assert_eq!(graph.unsatisfied(), vec![b]);
    }

    #[test]
    fn subscribing_late_classifies_existing_tasks() {
        let fx = Fixture::new();
        let mut graph = TaskGraph::new();
        let ids = graph
            .add_all(vec![task("#/b", &["#/a"]), task("#/a", &[])])
            .unwrap();
        assert_eq!(graph.counts().unknown, 2);
        graph.subscribe(fx.evaluator());
        assert_eq!(graph.runnable(), vec![ids[1]]);
        assert_eq!(graph.unsatisfied(), vec![ids[0]]);
    }

    #[test]
    fn scope_changes_every_id() {
        let fx = Fixture::new();
        let (graph, a, _) = chain(&fx);
        let before = graph.target_ids(a).unwrap().clone();

        let mut graph = TaskGraph::new();
        graph.subscribe(Box::new(Evaluator::new(
            Box::new(fx.cache.clone()),
            Arc::new(Blake3Hasher),
            fx.layout.clone(),
            BTreeMap::from([("CFLAGS".to_string(), "-O2".to_string())]),
        )));
        let a = graph.add(task("#/a", &["a.c"])).unwrap();
        assert_ne!(graph.target_ids(a).unwrap(), &before);
    }
}
