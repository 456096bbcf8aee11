//! Process primitives behind a capability trait.
//!
//! The scheduler never touches the OS directly; it goes through
//! [`ProcessBackend`] so the whole loop can also run against a scripted
//! in-memory backend in unit tests. [`UnixBackend`] is the real thing:
//! pipes for child output, `poll(2)` for multiplexed waiting, `waitpid(2)`
//! with `WNOHANG` for reaping and `kill(2)` for timeout escalation.

use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsFd, OwnedFd};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use eyre::{eyre, WrapErr};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, execvp, Pid};
use tracing::debug;

use crate::Result;

pub use nix::sys::signal::Signal;

/// Read granularity for draining child output.
pub const READ_CHUNK: usize = 4096;

/// Opaque handle to one readable child output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

/// Pid and output streams of a freshly spawned child.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedChild {
    pub pid: i32,
    pub stdout: StreamId,
    pub stderr: StreamId,
}

/// How a child left the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a code.
    Code(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

impl ExitKind {
    /// Exit code when the child exited normally, negated signal number
    /// otherwise.
    pub fn status(self) -> i32 {
        match self {
            ExitKind::Code(code) => code,
            ExitKind::Signaled(signal) => -signal,
        }
    }
}

/// Outcome of one non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapEvent {
    /// A child exited and was collected.
    Child { pid: i32, exit: ExitKind },
    /// Children exist but none has exited yet.
    None,
    /// This process has no children left at all. Ends the reap loop, never
    /// an error.
    NoChildren,
}

/// The OS-facing surface the scheduler depends on.
pub trait ProcessBackend {
    /// Spawns a child with both output streams redirected into fresh
    /// streams. Failure here is fatal to the run.
    fn spawn(&mut self, argv: &[String]) -> Result<SpawnedChild>;

    /// Replaces the current process image with the command. Only returns on
    /// failure.
    fn exec(&mut self, argv: &[String]) -> Result<Infallible>;

    /// Waits up to `timeout` for any of the given streams to become
    /// readable (or to hang up), returning the ready ones.
    fn poll_ready(&mut self, streams: &[StreamId], timeout: Duration) -> Result<Vec<StreamId>>;

    /// Reads everything currently buffered on the stream into `sink`,
    /// without blocking.
    fn drain(&mut self, stream: StreamId, sink: &mut Vec<u8>) -> Result<()>;

    /// Releases the stream. Closing twice is a caller bug and an error.
    fn close(&mut self, stream: StreamId) -> Result<()>;

    /// Non-blocking collection of one exited child, if any.
    fn reap(&mut self) -> Result<ReapEvent>;

    /// Sends a signal to a child. A child that exited in the meantime is
    /// not an error.
    fn kill(&mut self, pid: i32, signal: Signal) -> Result<()>;

    /// The clock all deadlines are measured against.
    fn now(&self) -> Instant;
}

/// Real backend over pipes, `poll(2)` and `waitpid(2)`.
#[derive(Debug, Default)]
pub struct UnixBackend {
    streams: HashMap<StreamId, OwnedFd>,
    next_stream: u64,
}

impl UnixBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, fd: OwnedFd) -> Result<StreamId> {
        set_nonblocking(&fd)?;
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(id, fd);
        Ok(id)
    }

    fn stream(&self, id: StreamId) -> Result<&OwnedFd> {
        self.streams
            .get(&id)
            .ok_or_else(|| eyre!("unknown stream {id:?}"))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

impl ProcessBackend for UnixBackend {
    fn spawn(&mut self, argv: &[String]) -> Result<SpawnedChild> {
        let (program, args) = argv.split_first().ok_or_else(|| eyre!("empty command"))?;

        let (out_read, out_write) = unistd::pipe().wrap_err("allocating stdout pipe")?;
        let (err_read, err_write) = unistd::pipe().wrap_err("allocating stderr pipe")?;

        // Command takes ownership of the write ends and closes the parent's
        // copies once the child holds its duplicates.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::from(out_write))
            .stderr(Stdio::from(err_write))
            .spawn()
            .wrap_err_with(|| format!("spawning {program}"))?;

        let pid = child.id() as i32;
        // Collection goes through waitpid, not the std handle.
        drop(child);

        let spawned = SpawnedChild {
            pid,
            stdout: self.register(out_read)?,
            stderr: self.register(err_read)?,
        };
        debug!(pid, program = %program, "spawned child");
        Ok(spawned)
    }

    fn exec(&mut self, argv: &[String]) -> Result<Infallible> {
        let args = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .wrap_err("command contains an interior NUL byte")?;
        let program = args.first().ok_or_else(|| eyre!("empty command"))?;
        match execvp(program, &args).wrap_err("replacing process image")? {}
    }

    fn poll_ready(&mut self, streams: &[StreamId], timeout: Duration) -> Result<Vec<StreamId>> {
        if streams.is_empty() {
            // Nothing to watch; still honor the wait so the loop keeps its
            // heartbeat cadence instead of spinning.
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
            return Ok(Vec::new());
        }

        let fds = streams
            .iter()
            .map(|id| self.stream(*id))
            .collect::<Result<Vec<_>>>()?;
        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
            .collect();

        // The wait budget never exceeds the heartbeat interval; clamping to
        // the u16 poll range only ever wakes us early, which is safe.
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        loop {
            match poll(&mut poll_fds, PollTimeout::from(millis)) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(eyre!("poll failed: {errno}")),
            }
        }

        let mut ready = Vec::new();
        for (i, poll_fd) in poll_fds.iter().enumerate() {
            let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
            // POLLHUP arrives unrequested when the child closes its end, so
            // process exit wakes the loop promptly without leaving cores
            // idle until the next heartbeat.
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                ready.push(streams[i]);
            }
        }
        Ok(ready)
    }

    fn drain(&mut self, stream: StreamId, sink: &mut Vec<u8>) -> Result<()> {
        let fd = self.stream(stream)?;
        let mut chunk = [0u8; READ_CHUNK];
        // Keep reading until the kernel reports the pipe empty. Stopping on
        // the first short read instead can truncate a burst that lands split
        // across two kernel buffers.
        loop {
            match unistd::read(fd.as_fd(), &mut chunk) {
                Ok(0) => break,
                Ok(n) => sink.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(eyre!("reading child output: {errno}")),
            }
        }
        Ok(())
    }

    fn close(&mut self, stream: StreamId) -> Result<()> {
        match self.streams.remove(&stream) {
            Some(fd) => {
                drop(fd);
                Ok(())
            }
            None => Err(eyre!("stream {stream:?} closed twice")),
        }
    }

    fn reap(&mut self) -> Result<ReapEvent> {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(ReapEvent::None),
            Ok(WaitStatus::Exited(pid, code)) => Ok(ReapEvent::Child {
                pid: pid.as_raw(),
                exit: ExitKind::Code(code),
            }),
            Ok(WaitStatus::Signaled(pid, signal, _)) => Ok(ReapEvent::Child {
                pid: pid.as_raw(),
                exit: ExitKind::Signaled(signal as i32),
            }),
            // Stopped/continued children are still ours and still running.
            Ok(_) => Ok(ReapEvent::None),
            Err(Errno::ECHILD) => Ok(ReapEvent::NoChildren),
            Err(errno) => Err(eyre!("waitpid failed: {errno}")),
        }
    }

    fn kill(&mut self, pid: i32, signal: Signal) -> Result<()> {
        match nix::sys::signal::kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            // The child can exit between the timeout check and the signal.
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(eyre!("signalling pid {pid}: {errno}")),
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
