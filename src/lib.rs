//! A unix-oriented test-process dispatcher.
//!
//! One scheduler thread drives a pool of child processes with `poll(2)` and
//! `waitpid(2)`: children are spawned with their output redirected into
//! pipes, the read ends are multiplexed without any helper threads, overdue
//! children are escalated from SIGABRT to SIGKILL, and exits are collected
//! non-blockingly so no zombie is ever left behind.
//!
//! The scheduler core only talks to the OS through the [`ProcessBackend`]
//! capability trait, so everything above the syscall layer can be exercised
//! deterministically against a scripted in-memory backend.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod admission;
pub mod backend;
pub mod cli;
pub mod config;
pub mod scheduler;
pub mod task;
pub mod testcase;

pub use admission::{AdmissionPolicy, EncodeBarrier, RunState, Unrestricted};
pub use backend::{ExitKind, ProcessBackend, ReapEvent, Signal, SpawnedChild, StreamId, UnixBackend};
pub use config::Config;
pub use scheduler::Scheduler;
pub use testcase::{CommandBuilder, RunContext, StaticCommand, TestDescriptor, TestOutput};
