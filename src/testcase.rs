//! Test descriptors as handed to the dispatcher, and the per-test results
//! it hands back.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Runtime context handed to command builders when a test is about to start.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Harness argv prefix prepended by builders that want one.
    pub prefix: Vec<String>,
    /// Scratch directory usable by the command.
    pub tempdir: PathBuf,
}

/// Builds the argv for one test given the runtime context.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, ctx: &RunContext) -> Vec<String>;
}

/// Builder for tests whose argv is fixed up front.
pub struct StaticCommand(pub Vec<String>);

impl CommandBuilder for StaticCommand {
    fn build(&self, _ctx: &RunContext) -> Vec<String> {
        self.0.clone()
    }
}

/// One runnable test as handed to the dispatcher.
#[derive(Clone)]
pub struct TestDescriptor {
    pub name: String,
    /// Disabled tests are reported as skipped unless the run asks otherwise.
    pub enabled: bool,
    /// Resource-intensive; at most one heavy test runs at a time.
    pub heavy: bool,
    /// Marks the test producing the shared artifact other tests depend on.
    pub encodes_artifact: bool,
    builder: Arc<dyn CommandBuilder>,
}

impl TestDescriptor {
    /// A test with a fixed command line.
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self::with_builder(name, Arc::new(StaticCommand(argv)))
    }

    /// A test whose command is resolved against the run context at spawn time.
    pub fn with_builder(name: impl Into<String>, builder: Arc<dyn CommandBuilder>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            heavy: false,
            encodes_artifact: false,
            builder,
        }
    }

    pub fn heavy(mut self) -> Self {
        self.heavy = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn encoder(mut self) -> Self {
        self.encodes_artifact = true;
        self
    }

    /// Resolves the command line for this test.
    pub fn command(&self, ctx: &RunContext) -> Vec<String> {
        self.builder.build(ctx)
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("heavy", &self.heavy)
            .field("encodes_artifact", &self.encodes_artifact)
            .finish_non_exhaustive()
    }
}

/// Everything recorded about one finished (or skipped) test.
#[derive(Debug, Clone)]
pub struct TestOutput {
    pub test: TestDescriptor,
    /// The resolved command, empty for synthetic skips.
    pub cmd: Vec<String>,
    pub out: String,
    pub err: String,
    /// Non-negative exit code, or the negated terminating signal number.
    pub status: i32,
    pub duration: Duration,
    /// Time past the deadline at collection, when the task timed out.
    pub overage: Option<Duration>,
    /// Extra run metadata; carries at least `pid` for spawned tests.
    pub meta: HashMap<String, String>,
    /// True for the synthetic result of a disabled test.
    pub skipped: bool,
}

impl TestOutput {
    /// The synthetic result for a disabled test. No process was created.
    pub fn skipped(test: TestDescriptor) -> Self {
        Self {
            test,
            cmd: Vec::new(),
            out: String::new(),
            err: String::new(),
            status: 0,
            duration: Duration::ZERO,
            overage: None,
            meta: HashMap::new(),
            skipped: true,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.overage.is_some()
    }

    /// Pid of the collected child, absent for skips.
    pub fn pid(&self) -> Option<i32> {
        self.meta.get("pid").and_then(|pid| pid.parse().ok())
    }
}

/// Shell-quotes a command line for logs and `show_cmd` output.
pub fn escape_cmdline(cmd: &[String]) -> String {
    shell_words::join(cmd)
}
