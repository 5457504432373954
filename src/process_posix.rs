//! Reaps children on posix with wait4, which unlike waitpid also reports the
//! child's resource usage.

use crate::task::{Metrics, Termination};
use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

/// ru_maxrss is in kilobytes on Linux but in bytes on macOS.
fn maxrss_kb(raw: libc::c_long) -> u64 {
    let raw = raw.max(0) as u64;
    if cfg!(target_os = "macos") {
        raw / 1024
    } else {
        raw
    }
}

pub fn wait_with_usage(pid: u32) -> anyhow::Result<(Termination, Metrics)> {
    let mut status: libc::c_int = 0;
    // Safety: rusage is plain old data; wait4 fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // Safety: pointers are to live locals.
        let ret = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if ret >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            anyhow::bail!("wait4 {}: {}", pid, err);
        }
    }

    let status = std::process::ExitStatus::from_raw(status);
    let termination = match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(sig)) => Termination::Signaled(sig),
        (None, None) => Termination::Lost,
    };
    let metrics = Metrics {
        wall: Duration::ZERO,
        user: Some(timeval_duration(usage.ru_utime)),
        system: Some(timeval_duration(usage.ru_stime)),
        max_rss_kb: Some(maxrss_kb(usage.ru_maxrss)),
    };
    Ok((termination, metrics))
}
