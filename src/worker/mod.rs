//! Process execution for scheduled jobs.
//!
//! A job's command is split on whitespace and started directly (no shell).
//! stdout and stderr are drained concurrently into one combined buffer by a
//! watcher task, which then reaps the child and publishes its exit code.
//!
//! # Components
//!
//! - [`ProcessRunner`]: starts a process and returns a [`ProcessHandle`]
//! - [`ProcessHandle`]: non-blocking [`poll`](ProcessHandle::poll), async
//!   [`wait`](ProcessHandle::wait) and one-shot
//!   [`collect_output`](ProcessHandle::collect_output)
//!
//! # Limitations
//!
//! There is no timeout: a hung process holds its worker slot until it exits.

pub mod process;

pub use process::{ProcessHandle, ProcessRunner, Termination};
