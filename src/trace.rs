//! Chrome trace output.
//!
//! Load the resulting file in chrome://tracing or https://ui.perfetto.dev to
//! see where a build spent its time, one track per concurrently running task.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &std::path::Path) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(
        &mut self,
        name: &str,
        tid: usize,
        start: Instant,
        end: Instant,
    ) -> std::io::Result<()> {
        write!(
            self.w,
            "{{\"pid\": 0, \"tid\": {}, \"name\": {}, \"ts\": {}, \"ph\": \"X\", \"dur\": {}}}",
            tid,
            serde_json::to_string(name)?,
            start.saturating_duration_since(self.start).as_micros(),
            end.saturating_duration_since(start).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", 0, start, Instant::now())?;
        writeln!(self.w, "\n]")?;
        self.w.flush()
    }
}

fn with_trace<T>(f: impl FnOnce(&mut Trace) -> T) -> Option<T> {
    // A poisoned lock only means a panic mid-write; the trace is best effort.
    let mut guard = TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.as_mut().map(f)
}

pub fn open(path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
    let trace = Trace::new(path.as_ref())?;
    let mut guard = TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(trace);
    Ok(())
}

pub fn is_enabled() -> bool {
    with_trace(|_| ()).is_some()
}

/// Records a span that ran from `start` to `end` on the faked thread `tid`.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) {
    with_trace(|t| {
        let _ = t
            .write_complete(name, tid, start, end)
            .and_then(|()| writeln!(t.w, ","));
    });
}

#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !is_enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    write_complete(name, 0, start, Instant::now());
    result
}

pub fn close() -> std::io::Result<()> {
    let mut guard = TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match guard.take() {
        Some(mut t) => t.close(),
        None => Ok(()),
    }
}
