//! Spawning and reaping external processes.
//!
//! The `ProcessHost` trait is the whole contract the runner needs from the
//! platform.  `LocalHost` implements it with std's process API: each child
//! gets a helper thread that feeds its stdin, collects its output and waits
//! for it, then reports over a channel.  The threads only block on the child;
//! all actual work happens in the child process.

use crate::task::{Metrics, Termination};
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn from_raw(raw: u64) -> Self {
        ProcessId(raw)
    }
}

/// Everything needed to start a process.  `args` become argv[1..] verbatim
/// and `env` is the complete environment of the child.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub cmd: &'a str,
    pub args: &'a [String],
    pub env: BTreeMap<String, String>,
    pub stdin: Option<&'a str>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

/// How a process finished and what it printed.
#[derive(Debug)]
pub struct Exit {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub metrics: Metrics,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("{cmd}: executable not found")]
    NotFound { cmd: String },
    #[error("{cmd}: permission denied")]
    PermissionDenied { cmd: String },
    #[error("{cmd}: {source}")]
    Io {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    pub fn from_io(cmd: &str, err: std::io::Error) -> Self {
        let cmd = cmd.to_owned();
        match err.kind() {
            std::io::ErrorKind::NotFound => SpawnError::NotFound { cmd },
            std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { cmd },
            _ => SpawnError::Io { cmd, source: err },
        }
    }
}

/// The platform's process API.
///
/// Spawning never blocks on the child.  There is deliberately no wait with a
/// timeout: that needs an out-of-band interrupt such as a signal handler.
/// Callers wanting a deadline should `poll` and sleep.
///
/// An `Err` from the wait functions means the process is gone but its exit
/// could not be collected.
pub trait ProcessHost {
    fn spawn(&mut self, req: &SpawnRequest) -> Result<ProcessId, SpawnError>;

    /// Returns the exit if the process has finished, without blocking.
    fn poll(&mut self, id: ProcessId) -> Option<anyhow::Result<Exit>>;

    /// Blocks until the given process finishes.
    fn block_wait(&mut self, id: ProcessId) -> anyhow::Result<Exit>;

    /// Blocks until any process finishes.  Returns None when no process is
    /// outstanding.
    fn block_wait_any(&mut self) -> Option<(ProcessId, anyhow::Result<Exit>)>;
}

type Finished = (ProcessId, anyhow::Result<Exit>);

pub struct LocalHost {
    cwd: std::path::PathBuf,
    next_id: u64,
    /// Spawned, and not yet handed back to the caller.
    outstanding: usize,
    finished_send: mpsc::Sender<Finished>,
    finished_recv: mpsc::Receiver<Finished>,
    /// Received from the channel but not yet asked for.
    finished: FxHashMap<ProcessId, anyhow::Result<Exit>>,
}

impl LocalHost {
    /// Processes run with `cwd` as their working directory.
    pub fn new(cwd: impl Into<std::path::PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel();
        LocalHost {
            cwd: cwd.into(),
            next_id: 0,
            outstanding: 0,
            finished_send: tx,
            finished_recv: rx,
            finished: FxHashMap::default(),
        }
    }

    fn collect_ready(&mut self) {
        while let Ok((id, exit)) = self.finished_recv.try_recv() {
            self.finished.insert(id, exit);
        }
    }

    fn recv(&mut self) -> Finished {
        // We hold a sender ourselves, so the channel never disconnects; recv
        // only fails if that invariant is broken.
        match self.finished_recv.recv() {
            Ok(finished) => finished,
            Err(err) => unreachable!("process channel closed: {}", err),
        }
    }

    fn claim(&mut self, id: ProcessId) -> Option<anyhow::Result<Exit>> {
        let exit = self.finished.remove(&id)?;
        self.outstanding -= 1;
        Some(exit)
    }
}

impl ProcessHost for LocalHost {
    fn spawn(&mut self, req: &SpawnRequest) -> Result<ProcessId, SpawnError> {
        let pipe_or = |capture: bool| {
            if capture {
                Stdio::piped()
            } else {
                Stdio::inherit()
            }
        };
        let mut cmd = Command::new(req.cmd);
        cmd.args(req.args)
            .env_clear()
            .envs(&req.env)
            .current_dir(&self.cwd)
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(pipe_or(req.capture_stdout))
            .stderr(pipe_or(req.capture_stderr));

        let start = Instant::now();
        let child = cmd.spawn().map_err(|err| SpawnError::from_io(req.cmd, err))?;

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        self.outstanding += 1;

        let stdin = req.stdin.map(str::to_owned);
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let exit = collect(child, stdin, start);
            // The send will only fail if the receiver disappeared, e.g. due to shutting down.
            let _ = tx.send((id, exit));
        });
        Ok(id)
    }

    fn poll(&mut self, id: ProcessId) -> Option<anyhow::Result<Exit>> {
        self.collect_ready();
        self.claim(id)
    }

    fn block_wait(&mut self, id: ProcessId) -> anyhow::Result<Exit> {
        loop {
            if let Some(exit) = self.claim(id) {
                return exit;
            }
            let (other, exit) = self.recv();
            self.finished.insert(other, exit);
        }
    }

    fn block_wait_any(&mut self) -> Option<(ProcessId, anyhow::Result<Exit>)> {
        if self.outstanding == 0 {
            return None;
        }
        self.collect_ready();
        let ready = self.finished.keys().min().copied();
        let id = match ready {
            Some(id) => id,
            None => {
                let (id, exit) = self.recv();
                self.finished.insert(id, exit);
                id
            }
        };
        self.claim(id).map(|exit| (id, exit))
    }
}

/// Runs on the helper thread: feeds stdin, drains output, reaps the child.
fn collect(mut child: Child, stdin: Option<String>, start: Instant) -> anyhow::Result<Exit> {
    let writer = child.stdin.take().map(|mut pipe| {
        let input = stdin.unwrap_or_default();
        std::thread::spawn(move || {
            // The child need not read all of its input; a broken pipe is fine.
            let _ = pipe.write_all(input.as_bytes());
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        std::thread::spawn(move || -> std::io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    });

    let mut stdout = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_end(&mut stdout)?;
    }
    let stderr = match stderr_reader {
        Some(reader) => reader
            .join()
            .map_err(|_| anyhow!("stderr reader panicked"))??,
        None => Vec::new(),
    };
    if let Some(writer) = writer {
        let _ = writer.join();
    }

    let (termination, mut metrics) = wait(child)?;
    metrics.wall = start.elapsed();
    Ok(Exit {
        termination,
        stdout,
        stderr,
        metrics,
    })
}

#[cfg(unix)]
fn wait(child: Child) -> anyhow::Result<(Termination, Metrics)> {
    // Reaped by wait4 rather than Child::wait to get its resource usage.
    // Dropping a Child does not wait on it.
    crate::process_posix::wait_with_usage(child.id())
}

#[cfg(not(unix))]
fn wait(mut child: Child) -> anyhow::Result<(Termination, Metrics)> {
    let status = child.wait()?;
    let termination = match status.code() {
        Some(code) => Termination::Exited(code),
        None => Termination::Lost,
    };
    Ok((termination, Metrics::default()))
}
