use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use testpool::cli::{parse_manifest, Cli};
use testpool::{Config, Result, RunContext, Scheduler, UnixBackend};

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;

    let text = if cli.manifest == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(&cli.manifest)?
    };
    let tests = parse_manifest(&text)?;
    info!(tests = tests.len(), jobs = config.worker_count, "starting run");

    let ctx = RunContext {
        prefix: Vec::new(),
        tempdir: std::env::temp_dir(),
    };
    let scheduler = Scheduler::new(UnixBackend::new(), config, tests)
        .with_context(ctx)
        .on_heartbeat(|| trace!("waiting on running tests"));

    let mut failures = 0usize;
    let mut total = 0usize;
    for result in scheduler {
        let out = result?;
        total += 1;
        if out.skipped {
            println!("SKIP    {}", out.test.name);
            continue;
        }
        let verdict = if out.timed_out() {
            "TIMEOUT"
        } else if out.status == 0 {
            "PASS"
        } else {
            "FAIL"
        };
        if verdict != "PASS" {
            failures += 1;
        }
        println!(
            "{verdict:<7} {} ({:.2}s, status {})",
            out.test.name,
            out.duration.as_secs_f64(),
            out.status
        );
        if verdict != "PASS" && !out.err.is_empty() {
            eprint!("{}", out.err);
        }
    }

    info!(total, failures, "run complete");
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
