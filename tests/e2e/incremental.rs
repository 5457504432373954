use crate::e2e::*;

fn two_step(space: &TestSpace) -> anyhow::Result<()> {
    space.manifest(vec![
        sh(&["#/mid"], &["in"], "cp in build/mid"),
        sh(&["@/final"], &["#/mid"], "cp build/mid out/final"),
    ])
}

#[test]
fn source_change_rebuilds_downstream() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    two_step(&space)?;
    space.write("in", "one")?;
    space.run_expect(&mut taskforce_command(vec![]))?;

    space.write("in", "two")?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("out/final")?, b"two");

    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn deleted_output_reruns_only_its_producer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    two_step(&space)?;
    space.write("in", "x")?;
    space.run_expect(&mut taskforce_command(vec![]))?;

    space.remove("build/mid")?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "ran 1 tasks");
    assert!(space.read("build/mid").is_ok());
    Ok(())
}

#[test]
fn changed_command_reruns() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(vec![sh(&["#/out"], &[], "echo 1 > build/out")])?;
    space.run_expect(&mut taskforce_command(vec![]))?;

    space.manifest(vec![sh(&["#/out"], &[], "echo 2 > build/out")])?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "ran 1 tasks");
    assert_eq!(space.read("build/out")?, b"2\n");
    Ok(())
}

#[test]
fn base_env_change_reruns_everything() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = |flags: &str| {
        format!(
            r##"{{
                "base_env": {{ "PATH": "/usr/bin:/bin", "FLAGS": "{}" }},
                "tasks": [
                    {{ "targets": ["#/a"], "cmd": "/bin/sh", "args": ["-c", "touch build/a"] }},
                    {{ "targets": ["#/b"], "cmd": "/bin/sh", "args": ["-c", "touch build/b"] }}
                ]
            }}"##,
            flags
        )
    };
    space.write("tasks.json", &manifest("-O0"))?;
    space.run_expect(&mut taskforce_command(vec![]))?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "no work to do");

    space.write("tasks.json", &manifest("-O2"))?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "ran 2 tasks");
    Ok(())
}

#[test]
fn failed_run_output_is_not_reused() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // Writes its target, then fails unless the input is "x".
    space.manifest(vec![sh(&["#/a"], &["in"], "cp in build/a; test \"$(cat in)\" = x")])?;
    space.write("in", "x")?;
    space.run_expect(&mut taskforce_command(vec![]))?;

    space.write("in", "y")?;
    let out = space.run(&mut taskforce_command(vec![]))?;
    assert!(!out.status.success());
    assert_eq!(space.read("build/a")?, b"y");

    space.write("in", "x")?;
    let out = space.run_expect(&mut taskforce_command(vec![]))?;
    assert_output_contains(&out, "ran 1 tasks");
    assert_eq!(space.read("build/a")?, b"x");
    Ok(())
}
