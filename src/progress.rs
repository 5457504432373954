//! Build progress reporting for a plain console, without any overprinting.

use crate::graph::{Subscriber, TaskGraph};
use crate::task::{TaskId, TaskResult, TaskState, Termination};
use std::io::Write;

/// Prints each task as it starts, and the output of any task that printed
/// something or failed.
pub struct ConsoleProgress<W: Write = std::io::Stdout> {
    /// Whether to print command lines of started programs.
    verbose: bool,
    /// The id of the last task printed, used to avoid printing it twice
    /// when its output immediately follows.
    last_started: Option<TaskId>,
    out: W,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self::with_writer(verbose, std::io::stdout())
    }
}

impl<W: Write> ConsoleProgress<W> {
    pub fn with_writer(verbose: bool, out: W) -> Self {
        ConsoleProgress {
            verbose,
            last_started: None,
            out,
        }
    }

    fn log(&mut self, msg: &str) {
        // Progress is best effort; a closed stdout must not fail the build.
        let _ = writeln!(self.out, "{}", msg);
    }

    fn started(&mut self, graph: &TaskGraph, id: TaskId) {
        let Some(task) = graph.task(id) else {
            return;
        };
        let msg = if self.verbose {
            task.spec().cmdline()
        } else {
            task.spec().label()
        };
        self.log(&msg);
        self.last_started = Some(id);
    }

    fn finished(&mut self, id: TaskId, result: &TaskResult) {
        let label = result.task.label();
        let quiet = result.stdout.is_empty() && result.stderr.is_empty();
        if result.success() {
            if !quiet && self.last_started != Some(id) {
                self.log(&label);
            }
        } else {
            match result.termination {
                Termination::Signaled(sig) => {
                    self.log(&format!("failed: {} (signal {})", label, sig))
                }
                Termination::Exited(code) if code != 0 => {
                    self.log(&format!("failed: {} (exit {})", label, code))
                }
                _ => self.log(&format!("failed: {}", label)),
            }
        }
        if !quiet {
            let _ = self.out.write_all(&result.stdout);
            let _ = self.out.write_all(&result.stderr);
        }
        let _ = self.out.flush();
    }
}

impl<W: Write> Subscriber for ConsoleProgress<W> {
    fn on_task_update(&mut self, graph: &mut TaskGraph, id: TaskId, result: Option<&TaskResult>) {
        match result {
            // Only report tasks that really ran; up to date ones are silent.
            Some(result) if result.termination != Termination::UpToDate => {
                self.finished(id, result)
            }
            None if graph.state(id) == Some(TaskState::Running) => self.started(graph, id),
            _ => {}
        }
    }
}
