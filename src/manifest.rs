//! Loads a serialized list of tasks from a JSON file.
//!
//! The manifest is plain data: every task spells out its targets, sources and
//! exact command.  Nothing is expanded or globbed.
//!
//! ```json
//! {
//!   "base_env": { "PATH": "/usr/bin:/bin" },
//!   "layout": { "build": "build", "output": "out" },
//!   "tasks": [
//!     { "targets": ["#/hello.o"], "sources": ["hello.c"],
//!       "cmd": "/usr/bin/cc", "args": ["-c", "hello.c", "-o", "build/hello.o"] }
//!   ]
//! }
//! ```

use crate::path::{Layout, Path};
use crate::task::{Task, TaskSpec};
use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Tree directories, relative to the manifest's directory.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutConfig {
    pub source: Option<std::path::PathBuf>,
    pub build: Option<std::path::PathBuf>,
    pub output: Option<std::path::PathBuf>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    pub targets: Vec<Path>,
    #[serde(default)]
    pub sources: Vec<Path>,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default = "yes")]
    pub capture_stdout: bool,
    #[serde(default = "yes")]
    pub capture_stderr: bool,
}

impl TaskEntry {
    fn spec(&self) -> TaskSpec {
        TaskSpec {
            targets: self.targets.iter().cloned().collect(),
            sources: self.sources.iter().cloned().collect(),
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            stdin: self.stdin.clone(),
            capture_stdout: self.capture_stdout,
            capture_stderr: self.capture_stderr,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub base_env: BTreeMap<String, String>,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl Manifest {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }

    /// The layout, with relative directories taken relative to `root`.
    pub fn layout(&self, root: &std::path::Path) -> Layout {
        let mut layout = Layout::rooted(root);
        let cfg = &self.layout;
        if let Some(dir) = &cfg.source {
            layout.source = root.join(dir);
        }
        if let Some(dir) = &cfg.build {
            layout.build = root.join(dir);
        }
        if let Some(dir) = &cfg.output {
            layout.output = root.join(dir);
        }
        layout
    }

    /// The tasks needed to build `requested`, or every task when nothing is
    /// requested.  Tasks keep manifest order.
    pub fn tasks(&self, requested: &[Path]) -> anyhow::Result<Vec<Task>> {
        if requested.is_empty() {
            return Ok(self.tasks.iter().map(|entry| Task::new(entry.spec())).collect());
        }

        let mut producers: FxHashMap<&Path, usize> = FxHashMap::default();
        for (i, entry) in self.tasks.iter().enumerate() {
            for target in &entry.targets {
                producers.insert(target, i);
            }
        }

        let mut wanted = BTreeSet::new();
        let mut stack = Vec::new();
        for path in requested {
            match producers.get(path) {
                Some(&i) => stack.push(i),
                None => bail!("unknown target requested: {}", path),
            }
        }
        while let Some(i) = stack.pop() {
            if !wanted.insert(i) {
                continue;
            }
            for source in &self.tasks[i].sources {
                if let Some(&dep) = producers.get(source) {
                    stack.push(dep);
                }
            }
        }
        Ok(wanted
            .into_iter()
            .map(|i| Task::new(self.tasks[i].spec()))
            .collect())
    }
}
