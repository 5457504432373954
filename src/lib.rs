pub mod cache;
pub mod db;
mod densemap;
pub mod eval;
pub mod graph;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod path;
pub mod process;
#[cfg(unix)]
mod process_posix;
pub mod progress;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod trace;
pub mod work;

pub use graph::{GraphError, InvariantViolation, Subscriber, TaskGraph, Writer};
pub use path::{Layout, Path, Tree};
pub use task::{Task, TaskId, TaskResult, TaskSpec, TaskState, Termination};

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
