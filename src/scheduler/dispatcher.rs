use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Inquiry, JobId, JobInfo, JobOutcome, JobSpec, JobStatus};
use crate::scheduler::registry::{Admission, JobRegistry, Phase, Ticket};
use crate::worker::{ProcessHandle, ProcessRunner, Termination};

/// Bounded-concurrency job scheduler.
///
/// Jobs are queued without limit, admitted by [`schedule`](Self::schedule) in
/// priority order while fewer than `num_workers` are running, and finalised
/// by whichever of [`join`](Self::join) or [`inquire`](Self::inquire) first
/// observes their exit. Share it between tasks behind an `Arc`.
#[derive(Debug)]
pub struct Scheduler {
    registry: JobRegistry,
    runner: ProcessRunner,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: JobRegistry::new(config.num_workers),
            runner: ProcessRunner::new(),
        })
    }

    /// Submit a job. It stays queued until a later `schedule` admits it.
    pub fn queue(&self, spec: JobSpec) -> JobId {
        let priority = spec.priority;
        let id = self.registry.submit(spec);
        tracing::debug!(job_id = %id, priority = %priority, "Job queued");
        id
    }

    /// Admit queued jobs until the worker pool is full.
    ///
    /// Queued jobs are snapshotted once, ordered by priority (unset last,
    /// ties in submission order) and drained in that order. Jobs queued
    /// after the snapshot wait for the next call. Returns how many jobs were
    /// started. A launch failure stops the pass and is returned; the job in
    /// question is left `Failed`.
    pub fn schedule(&self) -> Result<usize> {
        if self.registry.running() >= self.registry.capacity() {
            return Ok(0);
        }

        let mut pending = self.registry.pending();
        if pending.is_empty() {
            return Ok(0);
        }
        pending.sort_by_key(|job| (job.priority, job.ticket.seq));

        let mut admitted = 0;
        for job in &pending {
            let admission = self.registry.admit(job, |spec| {
                self.runner
                    .launch(&spec.command, spec.cwd.as_deref(), &spec.env)
            });
            match admission {
                Ok(Admission::Admitted(handle)) => {
                    admitted += 1;
                    tracing::debug!(
                        job_id = %job.ticket.id,
                        priority = %job.priority,
                        pid = ?handle.pid(),
                        "Job scheduled"
                    );
                }
                Ok(Admission::AtCapacity) => break,
                Ok(Admission::Stale) => continue,
                Err(e) => {
                    tracing::error!(job_id = %job.ticket.id, error = %e, "Job launch failed");
                    return Err(e);
                }
            }
        }
        Ok(admitted)
    }

    /// Wait for a job to finish and post-process its output.
    ///
    /// Suspends twice: first until `schedule` has started the job, then
    /// until the process exits. On exit code 0 the job is released and `post`
    /// receives the full combined output. Any other exit yields
    /// [`JobOutcome::Failed`].
    pub async fn join<F, R>(&self, id: JobId, post: F) -> Result<JobOutcome<R>>
    where
        F: FnOnce(String) -> R,
    {
        let (ticket, mut started) = self.registry.subscribe(id)?;
        if started.wait_for(|running| *running).await.is_err() {
            return Err(SchedulerError::UnknownJob(id));
        }

        let handle = match self.registry.phase(ticket)? {
            Phase::Running(handle) => handle,
            Phase::Failed(code) => return Ok(JobOutcome::Failed { code }),
            Phase::Queued => return Err(SchedulerError::UnknownJob(id)),
        };

        let termination = handle.wait().await;
        Ok(self.finalize(ticket, &handle, termination)?.map(post))
    }

    /// Check a job without waiting.
    ///
    /// Queued and still-running jobs report [`Inquiry::NotReady`]. An id the
    /// registry does not track is an error.
    pub fn inquire(&self, id: JobId) -> Result<Inquiry> {
        let (ticket, phase) = self.registry.lookup(id)?;
        match phase {
            Phase::Queued => Ok(Inquiry::NotReady),
            Phase::Failed(code) => Ok(Inquiry::Completed(JobOutcome::Failed { code })),
            Phase::Running(handle) => match handle.poll() {
                None => Ok(Inquiry::NotReady),
                Some(termination) => Ok(Inquiry::Completed(
                    self.finalize(ticket, &handle, termination)?,
                )),
            },
        }
    }

    /// Apply an observed exit to the registry. Only one observer wins a
    /// successful job; a loser sees the id as unknown.
    fn finalize(
        &self,
        ticket: Ticket,
        handle: &ProcessHandle,
        termination: Termination,
    ) -> Result<JobOutcome<String>> {
        if termination.success() {
            if !self.registry.release(ticket) {
                return Err(SchedulerError::UnknownJob(ticket.id));
            }
            let output = handle.collect_output()?;
            tracing::debug!(job_id = %ticket.id, "Returned 0");
            return Ok(JobOutcome::Succeeded(output));
        }

        if self.registry.fail(ticket, termination.code) {
            tracing::error!(
                job_id = %ticket.id,
                exit_code = ?termination.code,
                "Job exited with failure"
            );
        }
        Ok(JobOutcome::Failed {
            code: termination.code,
        })
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.registry.status(id)
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.registry.jobs()
    }

    pub fn running(&self) -> usize {
        self.registry.running()
    }

    pub fn queued(&self) -> usize {
        self.registry.queued()
    }

    pub fn num_workers(&self) -> usize {
        self.registry.capacity()
    }

    /// True once every tracked job has been released. Failed jobs keep
    /// their ids, so this stays false after a failure.
    pub fn is_idle(&self) -> bool {
        self.registry.is_empty()
    }
}
