use crate::e2e::*;

#[test]
fn empty_manifest() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![])?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert_eq!(std::str::from_utf8(&out.stdout)?, "taskforce: no work to do\n");
    Ok(())
}

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &["in"], "cp in build/out")])?;
    space.write("in", "hello")?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "taskforce: ran 1 tasks, now up to date");
    assert_eq!(space.read("build/out")?, b"hello");

    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn create_subdir() -> anyhow::Result<()> {
    // The target's directory is created before the task runs.
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["@/deep/sub/out"], &[], "touch out/deep/sub/out")])?;
    space.run_expect(&mut taskforce_command(vec![]))?;
    assert!(space.read("out/deep/sub/out").is_ok());
    Ok(())
}

#[test]
fn chain_runs_in_dependency_order() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![
        sh(&["@/final"], &["#/mid"], "cat build/mid build/mid > out/final"),
        sh(&["#/mid"], &["in"], "tr a-z A-Z < in > build/mid"),
    ])?;
    space.write("in", "abc\n")?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("out/final")?, b"ABC\nABC\n");
    Ok(())
}

#[test]
fn requested_target_builds_only_what_it_needs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![
        sh(&["#/a"], &[], "echo a > build/a"),
        sh(&["#/b"], &["#/a"], "cp build/a build/b"),
        sh(&["#/other"], &[], "echo other > build/other"),
    ])?;
    let out = space.run_expect(&mut taskforce_command(vec!["#/b"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert!(space.read("build/b").is_ok());
    assert!(space.read("build/other").is_err());

    let out = space.run(&mut taskforce_command(vec!["#/nope"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown target requested: #/nope");
    Ok(())
}

#[test]
fn stdin_and_env_reach_the_task() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut task = sh(&["#/out"], &[], "printf '%s:' \"$WHO\" > build/out; cat >> build/out");
    task["env"] = serde_json::json!({ "WHO": "taskforce" });
    task["stdin"] = serde_json::json!("from stdin");
    space.manifest(vec![task])?;
    space.run_expect(&mut taskforce_command(vec![]))?;
    assert_eq!(space.read("build/out")?, b"taskforce:from stdin");
    Ok(())
}

#[test]
fn verbose_prints_command_lines() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &[], "touch build/out")])?;
    let out = space.run_expect(&mut taskforce_command(vec!["-v"]))?;
    assert_output_contains(&out, "/bin/sh -c touch build/out");

    space.remove("build/out")?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "#/out\n");
    assert_output_not_contains(&out, "/bin/sh");
    Ok(())
}

#[test]
fn trace_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &[], "touch build/out")])?;
    space.run_expect(&mut taskforce_command(vec!["-d", "trace"]))?;
    let trace: serde_json::Value = serde_json::from_slice(&space.read("trace.json")?)?;
    let names: Vec<&str> = trace
        .as_array()
        .map(|events| events.iter().filter_map(|e| e["name"].as_str()).collect())
        .unwrap_or_default();
    assert!(names.contains(&"#/out"));
    assert!(names.contains(&"work.run"));
    Ok(())
}

#[test]
fn manifest_elsewhere() -> anyhow::Result<()> {
    // Paths are relative to the manifest's directory, not the cwd.
    let space = TestSpace::new()?;
    space.write(
        "proj/tasks.json",
        r##"{
            "base_env": { "PATH": "/usr/bin:/bin" },
            "layout": { "build": "obj" },
            "tasks": [
                { "targets": ["#/out"], "sources": ["in"], "cmd": "/bin/cp",
                  "args": ["in", "obj/out"] }
            ]
        }"##,
    )?;
    space.write("proj/in", "x")?;
    space.run_expect(&mut taskforce_command(vec!["-f", "proj/tasks.json"]))?;
    assert_eq!(space.read("proj/obj/out")?, b"x");
    Ok(())
}
