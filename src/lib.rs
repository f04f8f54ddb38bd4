//! Bounded-concurrency scheduler for sweeps of external program runs.
//!
//! Jobs are queued without limit, admitted in priority order up to a fixed
//! number of workers, and observed either by awaiting [`Scheduler::join`] or
//! by polling [`Scheduler::inquire`].

pub mod analysis;
pub mod config;
pub mod driver;
pub mod error;
pub mod output;
mod pattern;
pub mod scheduler;
pub mod shutdown;
pub mod template;
pub mod worker;

pub use config::{FailurePolicy, SchedulerConfig, SweepConfig};
pub use driver::Driver;
pub use error::{Result, SchedulerError};
pub use scheduler::{Inquiry, JobId, JobOutcome, JobSpec, Priority, Scheduler};
