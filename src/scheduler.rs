//! The single-threaded scheduling loop.
//!
//! Concurrency comes from many live child processes plus multiplexed I/O,
//! never from scheduler threads: one `Scheduler` owns the running-task set
//! for the duration of a run, and every mutation happens on the calling
//! thread. Results come out of the `Iterator` impl lazily, in completion
//! order.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use eyre::eyre;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionPolicy, EncodeBarrier, RunState, Unrestricted};
use crate::backend::{ExitKind, ProcessBackend, ReapEvent, Signal, StreamId};
use crate::config::Config;
use crate::task::Task;
use crate::testcase::{escape_cmdline, RunContext, TestDescriptor, TestOutput};
use crate::Result;

/// Grace period between SIGABRT and SIGKILL for an overdue task. SIGABRT
/// first so the child can dump a stack.
const KILL_GRACE: Duration = Duration::from_secs(30);

/// Drives one run of tests against a [`ProcessBackend`].
///
/// Yields one `Result<TestOutput>` per test as an exhaustible, single-pass
/// sequence. A fatal scheduler failure (spawn, poll or reap infrastructure)
/// is yielded once as `Err` and ends the run; per-test outcomes such as
/// timeouts, crashes and non-zero exits are data on the `TestOutput`, never
/// errors.
pub struct Scheduler<B: ProcessBackend> {
    backend: B,
    config: Config,
    ctx: RunContext,
    heavy: VecDeque<TestDescriptor>,
    light: VecDeque<TestDescriptor>,
    running: Vec<Task>,
    ready_out: VecDeque<TestOutput>,
    policy: Box<dyn AdmissionPolicy>,
    heartbeat: Box<dyn FnMut()>,
    failed: bool,
}

impl<B: ProcessBackend> Scheduler<B> {
    pub fn new(backend: B, config: Config, tests: Vec<TestDescriptor>) -> Self {
        let policy: Box<dyn AdmissionPolicy> = if config.use_shared_artifact {
            match EncodeBarrier::elect(&tests) {
                Some(barrier) => {
                    info!(elected = barrier.elected(), "serializing on shared-artifact producer");
                    Box::new(barrier)
                }
                None => Box::new(Unrestricted),
            }
        } else {
            Box::new(Unrestricted)
        };

        let (heavy, light): (VecDeque<_>, VecDeque<_>) =
            tests.into_iter().partition(|test| test.heavy);

        Self {
            backend,
            config,
            ctx: RunContext::default(),
            heavy,
            light,
            running: Vec::new(),
            ready_out: VecDeque::new(),
            policy,
            heartbeat: Box::new(|| {}),
            failed: false,
        }
    }

    /// Runtime context resolved into each test's command line.
    pub fn with_context(mut self, ctx: RunContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Replaces the admission policy chosen from the configuration.
    pub fn with_policy(mut self, policy: Box<dyn AdmissionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Called once per iteration that finished no test, so external
    /// progress reporting can still advance.
    pub fn on_heartbeat(mut self, heartbeat: impl FnMut() + 'static) -> Self {
        self.heartbeat = Box::new(heartbeat);
        self
    }

    /// Drives the whole run eagerly.
    pub fn run_all(self) -> Result<Vec<TestOutput>> {
        self.collect()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn finished_run(&self) -> bool {
        self.heavy.is_empty() && self.light.is_empty() && self.running.is_empty()
    }

    fn running_heavy(&self) -> bool {
        self.running.iter().any(|task| task.test.heavy)
    }

    /// Removes and returns the first queued test the policy admits.
    fn admit_one(
        queue: &mut VecDeque<TestDescriptor>,
        policy: &mut dyn AdmissionPolicy,
        running: &[Task],
    ) -> Option<TestDescriptor> {
        let state = RunState { running };
        let index = queue.iter().position(|test| policy.may_start(test, &state))?;
        queue.remove(index)
    }

    /// Spawns one child, or declines for a disabled test.
    fn spawn_test(&mut self, test: &TestDescriptor) -> Result<Option<Task>> {
        if !test.enabled && !self.config.run_skipped {
            debug!(test = %test.name, "skipping disabled test");
            return Ok(None);
        }

        let cmd = test.command(&self.ctx);
        if self.config.show_cmd {
            info!(test = %test.name, cmd = %escape_cmdline(&cmd), "starting");
        }

        if self.config.passthrough {
            // Replaces this process image; single-test debugging only.
            match self.backend.exec(&cmd)? {}
        }

        let child = self.backend.spawn(&cmd)?;
        let start = self.backend.now();
        Ok(Some(Task::new(test.clone(), cmd, child, start)))
    }

    /// Longest we may sleep in the multiplex wait before a heartbeat is due
    /// or the earliest running task can cross its deadline.
    fn wait_budget(&self) -> Duration {
        let mut wait = self.config.heartbeat_interval;
        if self.config.timeout_enabled() {
            let now = self.backend.now();
            for task in &self.running {
                // An already-overdue task has been signalled; the heartbeat
                // cadence is enough to upgrade it later, and pinning the
                // budget at zero would turn the loop into a busy wait.
                if task.overdue(now, self.config.timeout).is_some() {
                    continue;
                }
                if let Some(deadline) = task.start.checked_add(self.config.timeout) {
                    wait = wait.min(deadline.saturating_duration_since(now));
                }
            }
        }
        wait
    }

    /// One scheduling iteration: admit, spawn, multiplex-wait, drain,
    /// escalate, reap.
    fn step(&mut self) -> Result<()> {
        // Admission: at most one heavy task system-wide, then light tests
        // in submission order.
        let available = self.config.worker_count.saturating_sub(self.running.len());
        let mut starting = Vec::new();
        if available > 0 && !self.running_heavy() {
            if let Some(test) = Self::admit_one(&mut self.heavy, self.policy.as_mut(), &self.running)
            {
                starting.push(test);
            }
        }
        while starting.len() < available {
            match Self::admit_one(&mut self.light, self.policy.as_mut(), &self.running) {
                Some(test) => starting.push(test),
                None => break,
            }
        }
        debug_assert!(self.running.len() + starting.len() <= self.config.worker_count);

        let mut finished = Vec::new();
        for test in &starting {
            match self.spawn_test(test)? {
                Some(task) => self.running.push(task),
                None => {
                    let output = TestOutput::skipped(test.clone());
                    self.policy.observe_result(&output);
                    finished.push(output);
                }
            }
        }

        let wait = self.wait_budget();
        let streams: Vec<StreamId> = self
            .running
            .iter()
            .flat_map(|task| [task.stdout, task.stderr])
            .collect();
        let ready = match self.backend.poll_ready(&streams, wait) {
            Ok(ready) => ready,
            Err(e) => {
                error!(wait_secs = wait.as_secs_f64(), "multiplex wait failed");
                return Err(e);
            }
        };

        for stream in ready {
            for task in &mut self.running {
                if let Some(sink) = task.sink_for(stream) {
                    self.backend.drain(stream, sink)?;
                    break;
                }
            }
        }

        // Escalation pass. Never removes a task; only the reaper does.
        let now = self.backend.now();
        for task in &self.running {
            if let Some(over) = task.overdue(now, self.config.timeout) {
                let signal = if over < KILL_GRACE {
                    Signal::SIGABRT
                } else {
                    Signal::SIGKILL
                };
                warn!(
                    test = %task.test.name,
                    pid = task.pid,
                    over_secs = over.as_secs_f64(),
                    ?signal,
                    "task overdue, signalling"
                );
                self.backend.kill(task.pid, signal)?;
            }
        }

        // Reap pass: collect every child that has exited by now.
        loop {
            match self.backend.reap()? {
                ReapEvent::None | ReapEvent::NoChildren => break,
                ReapEvent::Child { pid, exit } => {
                    let output = self.finalize(pid, exit)?;
                    self.policy.observe_result(&output);
                    finished.push(output);
                }
            }
        }

        if finished.is_empty() {
            (self.heartbeat)();
        }
        self.ready_out.extend(finished);
        Ok(())
    }

    /// Turns an exited child back into a result. Each pid is finalized
    /// exactly once and its streams closed exactly once.
    fn finalize(&mut self, pid: i32, exit: ExitKind) -> Result<TestOutput> {
        let index = self
            .running
            .iter()
            .position(|task| task.pid == pid)
            .ok_or_else(|| eyre!("reaped unknown pid {pid}"))?;
        let mut task = self.running.remove(index);

        // Late output can land between the last poll and the exit.
        if let Err(e) = self.backend.drain(task.stdout, &mut task.out) {
            warn!(pid, "final stdout drain failed: {e}");
        }
        if let Err(e) = self.backend.drain(task.stderr, &mut task.err) {
            warn!(pid, "final stderr drain failed: {e}");
        }
        self.backend.close(task.stdout)?;
        self.backend.close(task.stderr)?;

        let now = self.backend.now();
        let duration = now.duration_since(task.start);
        let overage = task.overdue(now, self.config.timeout);
        let status = exit.status();
        debug!(
            test = %task.test.name,
            pid,
            status,
            secs = duration.as_secs_f64(),
            "collected"
        );

        let mut meta = HashMap::new();
        meta.insert("pid".to_string(), pid.to_string());

        Ok(TestOutput {
            test: task.test,
            cmd: task.cmd,
            out: String::from_utf8_lossy(&task.out).into_owned(),
            err: String::from_utf8_lossy(&task.err).into_owned(),
            status,
            duration,
            overage,
            meta,
            skipped: false,
        })
    }
}

impl<B: ProcessBackend> Iterator for Scheduler<B> {
    type Item = Result<TestOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(output) = self.ready_out.pop_front() {
                return Some(Ok(output));
            }
            if self.failed || self.finished_run() {
                return None;
            }
            if let Err(e) = self.step() {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::backend::fake::{ChildScript, FakeBackend, FakeChild};

    fn test(name: &str) -> TestDescriptor {
        TestDescriptor::new(name, vec![name.to_string()])
    }

    fn config(workers: usize) -> Config {
        Config::new(workers).unwrap()
    }

    fn script(runs_for: Duration) -> ChildScript {
        ChildScript {
            runs_for,
            ..Default::default()
        }
    }

    /// Largest number of simultaneously live children, from the fake's
    /// recorded intervals. Exits sort before starts at equal times.
    fn max_concurrent(children: &[FakeChild]) -> usize {
        let mut events = Vec::new();
        for child in children {
            events.push((child.started_at, 1i32));
            events.push((child.exited_at.expect("child never exited"), -1));
        }
        events.sort();
        let mut live = 0;
        let mut peak = 0;
        for (_, delta) in events {
            live += delta;
            peak = peak.max(live);
        }
        peak as usize
    }

    fn run(
        backend: FakeBackend,
        config: Config,
        tests: Vec<TestDescriptor>,
    ) -> (Vec<TestOutput>, FakeBackend) {
        let mut scheduler = Scheduler::new(backend, config, tests);
        let mut outputs = Vec::new();
        for result in &mut scheduler {
            outputs.push(result.expect("scheduler failed"));
        }
        let Scheduler { backend, .. } = scheduler;
        (outputs, backend)
    }

    #[test]
    fn worker_cap_is_never_exceeded() {
        let mut backend = FakeBackend::new();
        for _ in 0..5 {
            backend.push(script(Duration::from_millis(50)));
        }
        let tests = (0..5).map(|i| test(&format!("t{i}"))).collect();
        let (outputs, backend) = run(backend, config(2), tests);

        assert_eq!(outputs.len(), 5);
        assert!(outputs.iter().all(|out| out.status == 0 && !out.timed_out()));
        assert!(max_concurrent(&backend.children) <= 2);
    }

    #[test]
    fn heavy_tasks_never_overlap() {
        // Two heavy 1s tasks and two instant light ones, four slots.
        let mut backend = FakeBackend::new();
        let tests = vec![
            test("h1").heavy(),
            test("h2").heavy(),
            test("l1"),
            test("l2"),
        ];
        // Scripts apply in spawn order: one heavy plus the lights first.
        backend.push(script(Duration::from_secs(1)));
        backend.push(script(Duration::ZERO));
        backend.push(script(Duration::ZERO));
        backend.push(script(Duration::from_secs(1)));

        let (outputs, backend) = run(backend, config(4), tests);
        assert_eq!(outputs.len(), 4);

        let heavies: Vec<&FakeChild> = backend
            .children
            .iter()
            .filter(|child| child.argv[0].starts_with('h'))
            .collect();
        assert_eq!(heavies.len(), 2);
        let (a, b) = (heavies[0], heavies[1]);
        let disjoint = a.exited_at.unwrap() <= b.started_at || b.exited_at.unwrap() <= a.started_at;
        assert!(disjoint, "heavy intervals overlapped: {a:?} vs {b:?}");
    }

    #[test]
    fn disabled_test_yields_synthetic_skip_without_spawning() {
        let backend = FakeBackend::new();
        let tests = vec![test("on"), test("off").disabled()];
        let (outputs, backend) = run(backend, config(2), tests);

        assert_eq!(outputs.len(), 2);
        let skip = outputs.iter().find(|out| out.test.name == "off").unwrap();
        assert!(skip.skipped);
        assert_eq!(skip.pid(), None);
        assert_eq!(backend.children.len(), 1, "disabled test must not spawn");
    }

    #[test]
    fn run_skipped_spawns_disabled_tests() {
        let backend = FakeBackend::new();
        let mut config = config(1);
        config.run_skipped = true;
        let (outputs, backend) = run(backend, config, vec![test("off").disabled()]);

        assert_eq!(outputs.len(), 1);
        assert!(!outputs[0].skipped);
        assert!(outputs[0].pid().is_some());
        assert_eq!(backend.children.len(), 1);
    }

    #[test]
    fn shared_artifact_serializes_on_the_encoder() {
        // Three slots available, but nothing may start before the encoder
        // finishes.
        let mut backend = FakeBackend::new();
        backend.push(script(Duration::from_millis(500)));
        backend.push(script(Duration::from_millis(100)));
        backend.push(script(Duration::from_millis(100)));

        let tests = vec![test("enc").encoder(), test("a"), test("b")];
        let mut config = config(3);
        config.use_shared_artifact = true;
        let (outputs, backend) = run(backend, config, tests);
        assert_eq!(outputs.len(), 3);

        let encoder = backend
            .children
            .iter()
            .find(|child| child.argv[0] == "enc")
            .unwrap();
        let encoder_done = encoder.exited_at.unwrap();
        for child in &backend.children {
            if child.argv[0] != "enc" {
                assert!(
                    child.started_at >= encoder_done,
                    "{} started before the encoder finished",
                    child.argv[0]
                );
            }
        }
    }

    #[test]
    fn skipped_encoder_still_lifts_the_barrier() {
        let backend = FakeBackend::new();
        let tests = vec![test("enc").encoder().disabled(), test("a"), test("b")];
        let mut config = config(3);
        config.use_shared_artifact = true;
        let (outputs, _) = run(backend, config, tests);

        assert_eq!(outputs.len(), 3);
        assert!(outputs[0].skipped);
        assert_eq!(outputs[0].test.name, "enc");
    }

    #[test]
    fn overdue_task_gets_sigabrt_then_sigkill() {
        // The child shrugs off SIGABRT, so the scheduler upgrades to
        // SIGKILL after the 30s grace period.
        let mut backend = FakeBackend::new();
        backend.push(ChildScript {
            runs_for: Duration::from_secs(300),
            ignores_sigabrt: true,
            ..Default::default()
        });
        let mut config = config(1);
        config.timeout = Duration::from_secs(1);
        let (outputs, backend) = run(backend, config, vec![test("stuck")]);

        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(out.status, -(Signal::SIGKILL as i32));
        assert!(out.overage.unwrap() >= Duration::from_secs(30));

        let (_, first_signal, first_at) = backend.signals.first().unwrap();
        assert_eq!(*first_signal, Signal::SIGABRT);
        assert!(*first_at >= Duration::from_secs(1));
        let kill_at = backend
            .signals
            .iter()
            .find(|(_, signal, _)| *signal == Signal::SIGKILL)
            .map(|(_, _, at)| *at)
            .expect("never upgraded to SIGKILL");
        assert!(kill_at - *first_at >= KILL_GRACE);
    }

    #[test]
    fn compliant_task_dies_on_the_first_sigabrt() {
        let mut backend = FakeBackend::new();
        backend.push(script(Duration::from_secs(300)));
        let mut config = config(1);
        config.timeout = Duration::from_secs(1);
        let (outputs, backend) = run(backend, config, vec![test("slow")]);

        assert_eq!(outputs[0].status, -(Signal::SIGABRT as i32));
        assert!(outputs[0].timed_out());
        assert!(backend
            .signals
            .iter()
            .all(|(_, signal, _)| *signal == Signal::SIGABRT));
    }

    #[test]
    fn zero_timeout_never_signals() {
        let mut backend = FakeBackend::new();
        backend.push(script(Duration::from_secs(5)));
        let (outputs, backend) = run(backend, config(1), vec![test("slowish")]);

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].status, 0);
        assert!(!outputs[0].timed_out());
        assert!(backend.signals.is_empty());
    }

    #[test]
    fn results_arrive_in_completion_order() {
        let mut backend = FakeBackend::new();
        backend.push(script(Duration::from_millis(300)));
        backend.push(script(Duration::from_millis(100)));
        let (outputs, _) = run(backend, config(2), vec![test("slow"), test("fast")]);

        let order: Vec<&str> = outputs.iter().map(|out| out.test.name.as_str()).collect();
        assert_eq!(order, ["fast", "slow"]);
    }

    #[test]
    fn every_pid_is_collected_exactly_once() {
        let mut backend = FakeBackend::new();
        for _ in 0..4 {
            backend.push(script(Duration::from_millis(20)));
        }
        let tests = (0..4).map(|i| test(&format!("t{i}"))).collect();
        let (outputs, backend) = run(backend, config(2), tests);

        let mut pids: Vec<i32> = outputs.iter().filter_map(|out| out.pid()).collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 4);
        assert!(backend.children.iter().all(|child| child.reaped));
    }

    #[test]
    fn statuses_follow_the_sign_convention() {
        let mut backend = FakeBackend::new();
        backend.push(ChildScript {
            exit: ExitKind::Code(3),
            ..Default::default()
        });
        backend.push(ChildScript {
            exit: ExitKind::Signaled(15),
            ..Default::default()
        });
        let (outputs, _) = run(backend, config(1), vec![test("code"), test("sig")]);

        let by_name = |name: &str| outputs.iter().find(|out| out.test.name == name).unwrap();
        assert_eq!(by_name("code").status, 3);
        assert_eq!(by_name("sig").status, -15);
    }

    #[test]
    fn child_output_is_captured_and_decoded() {
        let mut backend = FakeBackend::new();
        backend.push(ChildScript {
            stdout: b"hello\n".to_vec(),
            stderr: vec![b'o', 0xff, b'k'],
            ..Default::default()
        });
        let (outputs, _) = run(backend, config(1), vec![test("talker")]);

        assert_eq!(outputs[0].out, "hello\n");
        // Invalid UTF-8 decodes permissively instead of failing the run.
        assert_eq!(outputs[0].err, "o\u{fffd}k");
    }

    #[test]
    fn heartbeat_fires_on_idle_iterations() {
        let mut backend = FakeBackend::new();
        backend.push(script(Duration::from_secs(1)));
        let beats = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&beats);

        let scheduler = Scheduler::new(backend, config(1), vec![test("slow")])
            .on_heartbeat(move || counter.set(counter.get() + 1));
        let outputs = scheduler.run_all().unwrap();

        assert_eq!(outputs.len(), 1);
        // 1s of runtime at a 100ms heartbeat cadence.
        assert!(beats.get() >= 5, "only {} heartbeats", beats.get());
    }

    #[test]
    fn passthrough_failure_is_fatal() {
        let backend = FakeBackend::new();
        let mut config = config(1);
        config.passthrough = true;
        let mut scheduler = Scheduler::new(backend, config, vec![test("dbg")]);

        let first = scheduler.next().unwrap();
        assert!(first.is_err());
        assert!(scheduler.next().is_none(), "iterator must end after a fatal error");
    }

    #[test]
    fn iterator_is_exhausted_after_the_run() {
        let backend = FakeBackend::new();
        let mut scheduler = Scheduler::new(backend, config(1), vec![test("only")]);
        assert!(scheduler.next().unwrap().is_ok());
        assert!(scheduler.next().is_none());
        assert!(scheduler.next().is_none());
    }
}
