pub mod dispatcher;
pub mod job;
pub mod registry;

pub use dispatcher::Scheduler;
pub use job::{Inquiry, JobId, JobInfo, JobOutcome, JobSpec, JobStatus, Priority};
pub use registry::JobRegistry;
