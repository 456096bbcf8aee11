use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;

use crate::config::Config;
use crate::testcase::TestDescriptor;
use crate::Result;

/// A manifest line starting with this marker is a heavy test.
const HEAVY_MARKER: char = '!';
/// A manifest line starting with this marker is disabled.
const SKIP_MARKER: char = '~';

/// Run a manifest of test commands in parallel
#[derive(Parser)]
#[command(name = "testpool")]
#[command(about = "Run a manifest of test commands in parallel")]
#[command(version)]
pub struct Cli {
    /// Number of tests to run concurrently
    #[arg(short = 'j', long, default_value = "4")]
    pub jobs: usize,

    /// Per-test timeout in seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub timeout: u64,

    /// Also run tests marked as skipped
    #[arg(long)]
    pub run_skipped: bool,

    /// Print each command before it runs
    #[arg(long)]
    pub show_cmd: bool,

    /// Exec the first test in place of this process (debugging aid)
    #[arg(long)]
    pub passthrough: bool,

    /// Hold every test until the first one finishes
    #[arg(long)]
    pub serialize_first: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "100")]
    pub heartbeat_ms: u64,

    /// Manifest with one shell command per line, or `-` for stdin
    pub manifest: PathBuf,
}

impl Config {
    /// Parse command line arguments into a run configuration.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = Config::new(cli.jobs)?;
        config.timeout = Duration::from_secs(cli.timeout);
        config.run_skipped = cli.run_skipped;
        config.show_cmd = cli.show_cmd;
        config.passthrough = cli.passthrough;
        config.use_shared_artifact = cli.serialize_first;
        config.heartbeat_interval = Duration::from_millis(cli.heartbeat_ms);
        Ok(config)
    }
}

/// Parses a manifest into test descriptors, preserving line order.
///
/// Blank lines and `#` comments are ignored. A `!` prefix marks a heavy
/// test, a `~` prefix a disabled one; both may appear together in either
/// order. The remaining text is split with shell quoting rules and doubles
/// as the test name.
pub fn parse_manifest(text: &str) -> Result<Vec<TestDescriptor>> {
    let mut tests = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let mut line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut heavy = false;
        let mut enabled = true;
        loop {
            if let Some(rest) = line.strip_prefix(HEAVY_MARKER) {
                heavy = true;
                line = rest.trim_start();
            } else if let Some(rest) = line.strip_prefix(SKIP_MARKER) {
                enabled = false;
                line = rest.trim_start();
            } else {
                break;
            }
        }

        let argv = shell_words::split(line)
            .wrap_err_with(|| format!("manifest line {}: unbalanced quoting", lineno + 1))?;
        if argv.is_empty() {
            continue;
        }

        let mut test = TestDescriptor::new(line, argv);
        test.heavy = heavy;
        test.enabled = enabled;
        tests.push(test);
    }
    Ok(tests)
}
