//! Support code for e2e tests, which run taskforce as a binary.

mod basic;
mod failures;
mod incremental;

pub fn taskforce_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_taskforce"));
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = String::from_utf8_lossy(&out.stdout);
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let out = String::from_utf8_lossy(&out.stdout);
    if out.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// A task that runs a shell script, for writing manifests.
pub fn sh(targets: &[&str], sources: &[&str], script: &str) -> serde_json::Value {
    serde_json::json!({
        "targets": targets,
        "sources": sources,
        "cmd": "/bin/sh",
        "args": ["-c", script],
    })
}

/// Manages a temporary directory for invoking taskforce.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    /// Writes tasks.json with the given tasks and a PATH good enough for
    /// the shell scripts they run.
    pub fn manifest(&self, tasks: Vec<serde_json::Value>) -> anyhow::Result<()> {
        let manifest = serde_json::json!({
            "base_env": { "PATH": "/usr/bin:/bin" },
            "tasks": tasks,
        });
        self.write("tasks.json", &serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn remove(&self, path: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.dir.path().join(path))
    }

    /// Invoke taskforce, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}
