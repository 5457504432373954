use crate::e2e::*;

#[test]
fn failing_task_prints_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &[], "echo broken >&2; exit 3")])?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "failed: #/out (exit 3)");
    assert_output_contains(&out, "broken");
    assert_output_contains(&out, "taskforce: build failed: 1 failed, 0 not built");
    Ok(())
}

#[test]
fn target_not_written() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &[], "true")])?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "target #/out was not produced");
    Ok(())
}

#[test]
fn missing_executable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "tasks.json",
        r##"{"tasks": [{"targets": ["#/out"], "cmd": "/nonexistent/compiler"}]}"##,
    )?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "failed: #/out");
    assert_output_contains(&out, "/nonexistent/compiler: executable not found");
    Ok(())
}

#[test]
fn dependents_of_failure_are_not_built() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![
        sh(&["#/a"], &[], "exit 1"),
        sh(&["#/b"], &["#/a"], "touch build/b"),
    ])?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "1 failed, 1 not built");
    assert!(space.read("build/b").is_err());
    Ok(())
}

#[test]
fn keep_going() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![
        sh(&["#/a"], &[], "exit 1"),
        sh(&["#/b"], &[], "exit 1"),
        sh(&["#/c"], &[], "exit 1"),
    ])?;

    let out = space.run(&mut taskforce_command(vec!["-j", "1"]))?;
    assert_output_contains(&out, "1 failed, 2 not built");

    let out = space.run(&mut taskforce_command(vec!["-j", "1", "-k", "0"]))?;
    assert_output_contains(&out, "3 failed, 0 not built");
    Ok(())
}

#[test]
fn failed_task_reruns_next_time() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &["in"], "test -s in && cp in build/out")])?;
    space.write("in", "")?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());

    space.write("in", "ok")?;
    space.run_expect(&mut taskforce_command(vec![]))?;
    assert_eq!(space.read("build/out")?, b"ok");
    Ok(())
}

#[test]
fn cycle_is_rejected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![
        sh(&["#/a"], &["#/b"], "touch build/a"),
        sh(&["#/b"], &["#/a"], "touch build/b"),
    ])?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "dependency cycle among [#/a, #/b]");
    Ok(())
}

#[test]
fn duplicate_target_is_rejected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![
        sh(&["#/a"], &[], "touch build/a"),
        sh(&["@/a"], &[], "touch out/a"),
    ])?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "multiple tasks build target @/a");
    Ok(())
}
