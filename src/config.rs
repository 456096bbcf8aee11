use std::time::Duration;

use eyre::eyre;

use crate::Result;

/// Run-wide dispatcher configuration.
///
/// One `Config` covers a single run; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on concurrently running tests.
    pub worker_count: usize,
    /// Per-test timeout. Zero disables enforcement entirely.
    pub timeout: Duration,
    /// Also run tests marked as disabled.
    pub run_skipped: bool,
    /// Replace this process with the first test instead of scheduling.
    /// Debugging aid for a single test; incompatible with parallel runs.
    pub passthrough: bool,
    /// Log each resolved command before it starts.
    pub show_cmd: bool,
    /// Hold every test back until the elected shared-artifact producer
    /// has finished.
    pub use_shared_artifact: bool,
    /// How often the loop wakes up when nothing else forces it to, and
    /// therefore how often the heartbeat callback can fire.
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 1,
            timeout: Duration::ZERO,
            run_skipped: false,
            passthrough: false,
            show_cmd: false,
            use_shared_artifact: false,
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Creates a configuration with the given worker count.
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(eyre!("worker count must be positive"));
        }
        Ok(Self {
            worker_count,
            ..Self::default()
        })
    }

    /// Whether elapsed-time enforcement is active for this run.
    pub fn timeout_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }
}
