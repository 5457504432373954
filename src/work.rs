//! Drives a build: keeps the scheduler fed and waits on the runner until
//! nothing more can run.

use crate::cache::Cache;
use crate::eval::Evaluator;
use crate::graph::TaskGraph;
use crate::hash::ContentHasher;
use crate::path::Layout;
use crate::process::{LocalHost, ProcessHost};
use crate::runner::Runner;
use crate::scheduler::Scheduler;
use crate::task::{TaskId, TaskState};
use crate::trace;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Maximum number of tasks running at once.
    pub parallelism: usize,
    /// Stop starting tasks after this many failures; 0 means never stop.
    pub keep_going: usize,
    pub layout: Layout,
    /// Environment shared by every task.  Part of every content id.
    pub base_env: BTreeMap<String, String>,
}

impl BuildConfig {
    pub fn new(layout: Layout) -> Self {
        BuildConfig {
            parallelism: std::thread::available_parallelism().map_or(1, usize::from),
            keep_going: 1,
            layout,
            base_env: BTreeMap::new(),
        }
    }

    /// An evaluator consistent with this configuration.
    pub fn evaluator(&self, cache: Box<dyn Cache>, hasher: Arc<dyn ContentHasher>) -> Evaluator {
        Evaluator::new(cache, hasher, self.layout.clone(), self.base_env.clone())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    /// Number of processes that ran to completion, successfully or not.
    pub ran: usize,
    pub failed: Vec<TaskId>,
    /// Tasks left undone because something they need failed, or because the
    /// build stopped early.
    pub blocked: Vec<TaskId>,
}

impl BuildSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

pub struct Work<H: ProcessHost = LocalHost> {
    keep_going: usize,
    scheduler: Scheduler,
    runner: Runner<H>,
}

impl Work<LocalHost> {
    /// Runs processes in the source directory.
    pub fn new(config: &BuildConfig, hasher: Arc<dyn ContentHasher>) -> Self {
        let host = LocalHost::new(config.layout.source.clone());
        Self::with_host(host, config, hasher)
    }
}

impl<H: ProcessHost> Work<H> {
    pub fn with_host(host: H, config: &BuildConfig, hasher: Arc<dyn ContentHasher>) -> Self {
        Work {
            keep_going: config.keep_going,
            scheduler: Scheduler::new(config.parallelism),
            runner: Runner::new(
                host,
                hasher,
                config.layout.clone(),
                config.base_env.clone(),
            ),
        }
    }

    pub fn runner(&self) -> &Runner<H> {
        &self.runner
    }

    /// Runs tasks until every task is done, or nothing more can start.  The
    /// graph's evaluator must already be subscribed.
    pub fn run(&mut self, graph: &mut TaskGraph) -> anyhow::Result<BuildSummary> {
        let errors_before = graph.counts().error;
        let mut ran = 0;
        loop {
            let failures = graph.counts().error.saturating_sub(errors_before);
            let failures_allowed = match self.keep_going {
                0 => None,
                n => Some(n.saturating_sub(failures)),
            };
            if failures_allowed != Some(0) {
                let (scheduler, runner) = (&mut self.scheduler, &mut self.runner);
                trace::scope("dispatch", || {
                    scheduler.dispatch(graph, runner, failures_allowed)
                })?;
            }
            match self.runner.wait(graph)? {
                Some(_) => ran += 1,
                None => break,
            }
        }

        let mut summary = BuildSummary {
            ran,
            ..BuildSummary::default()
        };
        for (id, task) in graph.tasks() {
            match task.state() {
                TaskState::Done => {}
                TaskState::Error => summary.failed.push(id),
                _ => summary.blocked.push(id),
            }
        }
        info!(
            ran = summary.ran,
            failed = summary.failed.len(),
            blocked = summary.blocked.len(),
            "build finished"
        );
        Ok(summary)
    }
}
