//! Pluggable admission control for the scheduling loop.
//!
//! The worker cap and heavy-test exclusivity live in the scheduler itself;
//! anything narrower is expressed as an [`AdmissionPolicy`] consulted during
//! slot filling, so one-off rules never leak into the core loop.

use tracing::debug;

use crate::task::Task;
use crate::testcase::{TestDescriptor, TestOutput};

/// Scheduler state a policy may consult when deciding.
pub struct RunState<'a> {
    /// Tasks currently running, in spawn order.
    pub running: &'a [Task],
}

/// Decides which pending tests may start during slot filling. Tests the
/// policy holds back stay queued in submission order.
pub trait AdmissionPolicy {
    fn may_start(&mut self, test: &TestDescriptor, state: &RunState<'_>) -> bool;

    /// Called for every emitted result, synthetic skips included.
    fn observe_result(&mut self, _output: &TestOutput) {}
}

/// No restrictions beyond the worker cap.
#[derive(Debug, Default)]
pub struct Unrestricted;

impl AdmissionPolicy for Unrestricted {
    fn may_start(&mut self, _test: &TestDescriptor, _state: &RunState<'_>) -> bool {
        true
    }
}

/// Holds every test back until the elected shared-artifact producer has
/// finished, then admits freely for the rest of the run.
///
/// The other tests read the artifact the elected test writes, so letting
/// them start first would race the encoder.
#[derive(Debug)]
pub struct EncodeBarrier {
    elected: String,
    done: bool,
}

impl EncodeBarrier {
    /// Elects the test flagged as the artifact producer, falling back to the
    /// first test overall. A run with fewer than two tests needs no barrier.
    pub fn elect(tests: &[TestDescriptor]) -> Option<Self> {
        if tests.len() < 2 {
            return None;
        }
        let elected = tests
            .iter()
            .find(|test| test.encodes_artifact)
            .or_else(|| tests.first())?;
        Some(Self {
            elected: elected.name.clone(),
            done: false,
        })
    }

    pub fn elected(&self) -> &str {
        &self.elected
    }
}

impl AdmissionPolicy for EncodeBarrier {
    fn may_start(&mut self, test: &TestDescriptor, _state: &RunState<'_>) -> bool {
        self.done || test.name == self.elected
    }

    fn observe_result(&mut self, output: &TestOutput) {
        if !self.done && output.test.name == self.elected {
            debug!(test = %self.elected, "shared artifact ready, lifting admission barrier");
            self.done = true;
        }
    }
}
