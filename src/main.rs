use anyhow::{anyhow, Context};
use std::sync::Arc;
use taskforce::hash::{Blake3Hasher, ContentHasher};
use taskforce::manifest::Manifest;
use taskforce::progress::ConsoleProgress;
use taskforce::work::{BuildConfig, Work};
use taskforce::{db, logging, trace, TaskGraph};

const DB_FILENAME: &str = ".taskforce_db";

#[derive(argh::FromArgs)]
/// taskforce, a content-addressed build runner
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// task manifest [default=tasks.json]
    #[argh(option, short = 'f', default = "String::from(\"tasks.json\")")]
    manifest: String,

    /// parallelism [default from system]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until at least N failures (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// debugging tools, "-d list" to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// targets to build, e.g. "#/obj/main.o"; default is every task
    #[argh(positional)]
    targets: Vec<String>,
}

fn run() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();
    logging::init()?;

    if let Some(debug) = &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => anyhow::bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &opts.chdir {
        let dir = std::path::Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let manifest_path = std::path::Path::new(&opts.manifest);
    let manifest = trace::scope("manifest::load", || Manifest::load(manifest_path))?;
    let cwd = std::env::current_dir()?;
    let root = match manifest_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => cwd.join(dir),
        _ => cwd,
    };

    let mut config = BuildConfig::new(manifest.layout(&root));
    if let Some(parallelism) = opts.parallelism {
        config.parallelism = parallelism;
    }
    config.keep_going = opts.keep_going;
    config.base_env = manifest.base_env.clone();

    let mut targets = Vec::new();
    for name in &opts.targets {
        targets.push(
            name.parse::<taskforce::Path>()
                .with_context(|| format!("bad target {:?}", name))?,
        );
    }
    let tasks = manifest.tasks(&targets)?;

    let hasher: Arc<dyn ContentHasher> = Arc::new(Blake3Hasher);
    let db = db::open(&root.join(DB_FILENAME))?;
    let mut graph = TaskGraph::new();
    graph.add_all(tasks)?;
    let evaluator = config.evaluator(Box::new(db), hasher.clone());
    trace::scope("evaluate", || graph.subscribe(Box::new(evaluator)));
    graph.subscribe(Box::new(ConsoleProgress::new(opts.verbose)));

    let mut work = Work::new(&config, hasher);
    let summary = trace::scope("work.run", || work.run(&mut graph))?;

    if !summary.success() {
        println!(
            "taskforce: build failed: {} failed, {} not built",
            summary.failed.len(),
            summary.blocked.len()
        );
        return Ok(1);
    }
    match summary.ran {
        // Special case: don't print numbers when no work done.
        0 => println!("taskforce: no work to do"),
        n => println!("taskforce: ran {} tasks, now up to date", n),
    }
    Ok(0)
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            println!("taskforce: error: {:#}", err);
            1
        }
    };
    let _ = trace::close();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
