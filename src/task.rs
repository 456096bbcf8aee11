//! In-flight bookkeeping for one spawned test.

use std::time::{Duration, Instant};

use crate::backend::{SpawnedChild, StreamId};
use crate::testcase::TestDescriptor;

/// One live child invocation. Created at spawn, mutated only by output
/// drains and timeout checks, destroyed when the reaper turns it into a
/// result.
pub struct Task {
    pub test: TestDescriptor,
    pub cmd: Vec<String>,
    pub pid: i32,
    pub stdout: StreamId,
    pub stderr: StreamId,
    pub start: Instant,
    pub out: Vec<u8>,
    pub err: Vec<u8>,
}

impl Task {
    pub fn new(test: TestDescriptor, cmd: Vec<String>, child: SpawnedChild, start: Instant) -> Self {
        Self {
            test,
            cmd,
            pid: child.pid,
            stdout: child.stdout,
            stderr: child.stderr,
            start,
            out: Vec::new(),
            err: Vec::new(),
        }
    }

    /// Amount past the deadline, or `None` while still within it. A zero
    /// timeout disables enforcement for this task entirely.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        if timeout.is_zero() {
            return None;
        }
        let elapsed = now.duration_since(self.start);
        if elapsed > timeout {
            Some(elapsed - timeout)
        } else {
            None
        }
    }

    /// The buffer a ready stream drains into, if the stream is ours.
    pub fn sink_for(&mut self, stream: StreamId) -> Option<&mut Vec<u8>> {
        if stream == self.stdout {
            Some(&mut self.out)
        } else if stream == self.stderr {
            Some(&mut self.err)
        } else {
            None
        }
    }
}
