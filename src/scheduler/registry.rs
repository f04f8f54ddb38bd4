use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::{Result, RunnerError, SchedulerError};
use crate::scheduler::job::{JobId, JobInfo, JobSpec, JobStatus, Priority};
use crate::worker::ProcessHandle;

/// Names one particular job, not just its id slot. The sequence number is
/// assigned at submission and never reused, so a stale ticket cannot touch
/// a newer job that was handed the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub id: JobId,
    pub seq: u64,
}

/// Queued job as seen by the admission snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PendingJob {
    pub ticket: Ticket,
    pub priority: Priority,
}

/// Lifecycle state of a tracked job. Successful jobs are removed rather than
/// given a final phase.
#[derive(Debug, Clone)]
pub enum Phase {
    Queued,
    Running(ProcessHandle),
    Failed(Option<i32>),
}

/// Result of trying to admit one pending job.
#[derive(Debug)]
pub enum Admission {
    Admitted(ProcessHandle),
    AtCapacity,
    /// The job is no longer queued under that ticket.
    Stale,
}

#[derive(Debug)]
struct JobEntry {
    seq: u64,
    spec: Arc<JobSpec>,
    phase: Phase,
    /// Flips to `true` once the job leaves `Queued`.
    started: watch::Sender<bool>,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    jobs: BTreeMap<JobId, JobEntry>,
    running: usize,
    next_seq: u64,
}

impl RegistryState {
    /// Smallest id not held by a tracked job.
    fn free_id(&self) -> JobId {
        let mut candidate = 0;
        for id in self.jobs.keys() {
            if id.0 != candidate {
                break;
            }
            candidate += 1;
        }
        JobId(candidate)
    }

    fn entry(&self, ticket: Ticket) -> Result<&JobEntry> {
        self.jobs
            .get(&ticket.id)
            .filter(|e| e.seq == ticket.seq)
            .ok_or(SchedulerError::UnknownJob(ticket.id))
    }
}

/// Owns every job's state and the running counter behind one lock.
///
/// All mutations are single critical sections; the lock is never held while
/// waiting on a process.
#[derive(Debug)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
    capacity: usize,
}

impl JobRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new queued job under the smallest free id.
    pub fn submit(&self, spec: JobSpec) -> JobId {
        let mut state = self.lock();
        let id = state.free_id();
        let seq = state.next_seq;
        state.next_seq += 1;

        let (started, _) = watch::channel(false);
        state.jobs.insert(
            id,
            JobEntry {
                seq,
                spec: Arc::new(spec),
                phase: Phase::Queued,
                started,
                submitted_at: Utc::now(),
                started_at: None,
            },
        );
        id
    }

    /// Drop a successfully completed job and free its worker slot.
    /// Returns false if the ticket no longer names a running job.
    pub fn release(&self, ticket: Ticket) -> bool {
        let mut state = self.lock();
        let running = matches!(
            state.entry(ticket).map(|e| &e.phase),
            Ok(Phase::Running(_))
        );
        if !running {
            return false;
        }
        state.jobs.remove(&ticket.id);
        state.running -= 1;
        true
    }

    /// Mark a running job as failed. The worker slot is freed but the id
    /// stays reserved. Returns false if another observer got there first.
    pub fn fail(&self, ticket: Ticket, code: Option<i32>) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(&ticket.id).filter(|e| e.seq == ticket.seq) else {
            return false;
        };
        if !matches!(entry.phase, Phase::Running(_)) {
            return false;
        }
        entry.phase = Phase::Failed(code);
        state.running -= 1;
        true
    }

    /// Snapshot of queued jobs in no particular order.
    pub fn pending(&self) -> Vec<PendingJob> {
        self.lock()
            .jobs
            .iter()
            .filter(|(_, e)| matches!(e.phase, Phase::Queued))
            .map(|(id, e)| PendingJob {
                ticket: Ticket { id: *id, seq: e.seq },
                priority: e.spec.priority,
            })
            .collect()
    }

    /// Move a queued job to running, launching it with `launch` while the
    /// lock is held. On launch failure the slot is returned and the job is
    /// marked failed.
    pub fn admit<F>(&self, job: &PendingJob, launch: F) -> Result<Admission>
    where
        F: FnOnce(&JobSpec) -> std::result::Result<ProcessHandle, RunnerError>,
    {
        let mut state = self.lock();
        if state.running >= self.capacity {
            return Ok(Admission::AtCapacity);
        }
        let Some(entry) = state
            .jobs
            .get_mut(&job.ticket.id)
            .filter(|e| e.seq == job.ticket.seq && matches!(e.phase, Phase::Queued))
        else {
            return Ok(Admission::Stale);
        };

        match launch(&entry.spec) {
            Ok(handle) => {
                entry.phase = Phase::Running(handle.clone());
                entry.started_at = Some(Utc::now());
                entry.started.send_replace(true);
                state.running += 1;
                Ok(Admission::Admitted(handle))
            }
            Err(source) => {
                entry.phase = Phase::Failed(None);
                entry.started.send_replace(true);
                Err(SchedulerError::Launch {
                    id: job.ticket.id,
                    source,
                })
            }
        }
    }

    /// Current phase of the job holding `id`, with a ticket naming it.
    pub fn lookup(&self, id: JobId) -> Result<(Ticket, Phase)> {
        let state = self.lock();
        let entry = state.jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
        let ticket = Ticket { id, seq: entry.seq };
        Ok((ticket, entry.phase.clone()))
    }

    /// Current phase of the exact job named by `ticket`.
    pub fn phase(&self, ticket: Ticket) -> Result<Phase> {
        let state = self.lock();
        state.entry(ticket).map(|e| e.phase.clone())
    }

    /// Ticket plus a receiver that turns `true` once the job has left the
    /// queue.
    pub fn subscribe(&self, id: JobId) -> Result<(Ticket, watch::Receiver<bool>)> {
        let state = self.lock();
        let entry = state.jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
        Ok((Ticket { id, seq: entry.seq }, entry.started.subscribe()))
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.lock().jobs.get(&id).map(|e| status_of(&e.phase))
    }

    /// All tracked jobs, ordered by id.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.lock()
            .jobs
            .iter()
            .map(|(id, e)| JobInfo {
                id: *id,
                command: e.spec.command.clone(),
                priority: e.spec.priority,
                status: status_of(&e.phase),
                exit_code: match e.phase {
                    Phase::Failed(code) => code,
                    _ => None,
                },
                submitted_at: e.submitted_at,
                started_at: e.started_at,
            })
            .collect()
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs still waiting for admission.
    pub fn queued(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|e| matches!(e.phase, Phase::Queued))
            .count()
    }

    /// Number of tracked jobs in any state.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }
}

fn status_of(phase: &Phase) -> JobStatus {
    match phase {
        Phase::Queued => JobStatus::Queued,
        Phase::Running(_) => JobStatus::Running,
        Phase::Failed(_) => JobStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_fill_the_smallest_gap() {
        let registry = JobRegistry::new(1);
        let ids: Vec<JobId> = (0..4).map(|_| registry.submit(JobSpec::new("true"))).collect();
        assert_eq!(ids, vec![JobId(0), JobId(1), JobId(2), JobId(3)]);

        // Free id 1 by hand; the next submission must take it.
        registry.lock().jobs.remove(&JobId(1));
        assert_eq!(registry.submit(JobSpec::new("true")), JobId(1));
        assert_eq!(registry.submit(JobSpec::new("true")), JobId(4));
    }

    #[test]
    fn pending_snapshot_carries_priority() {
        let registry = JobRegistry::new(1);
        registry.submit(JobSpec::new("a").with_priority(5));
        registry.submit(JobSpec::new("b"));

        let mut pending = registry.pending();
        pending.sort_by_key(|p| p.ticket.seq);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].priority, Priority::Key(5));
        assert_eq!(pending[1].priority, Priority::Unset);
        assert_eq!(registry.queued(), 2);
    }

    #[test]
    fn stale_ticket_is_rejected() {
        let registry = JobRegistry::new(1);
        let id = registry.submit(JobSpec::new("true"));
        let (ticket, _) = registry.lookup(id).unwrap();

        registry.lock().jobs.remove(&id);
        let reused = registry.submit(JobSpec::new("true"));
        assert_eq!(reused, id);

        assert!(matches!(registry.phase(ticket), Err(SchedulerError::UnknownJob(_))));
        assert!(!registry.release(ticket));
        assert!(!registry.fail(ticket, Some(1)));
    }

    #[test]
    fn launch_failure_marks_job_failed() {
        let registry = JobRegistry::new(2);
        let id = registry.submit(JobSpec::new("missing"));
        let pending = registry.pending();

        let result = registry.admit(&pending[0], |_| Err(RunnerError::EmptyCommand));
        assert!(matches!(result, Err(SchedulerError::Launch { id: failed, .. }) if failed == id));
        assert_eq!(registry.running(), 0);
        assert_eq!(registry.status(id), Some(JobStatus::Failed));

        let (_, started) = registry.subscribe(id).unwrap();
        assert!(*started.borrow());
    }

    #[test]
    fn unknown_id_lookup() {
        let registry = JobRegistry::new(1);
        assert!(matches!(
            registry.lookup(JobId(9)),
            Err(SchedulerError::UnknownJob(JobId(9)))
        ));
        assert!(registry.status(JobId(9)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn phase_follows_job_lifecycle() {
        let registry = JobRegistry::new(1);
        let id = registry.submit(JobSpec::new("true"));
        assert!(matches!(registry.lookup(id), Ok((_, Phase::Queued))));

        let pending = registry.pending();
        let runner = crate::worker::ProcessRunner::new();
        let admission = registry
            .admit(&pending[0], |spec| runner.launch(&spec.command, None, &spec.env))
            .unwrap();
        assert!(matches!(admission, Admission::Admitted(_)));

        let (ticket, phase) = registry.lookup(id).unwrap();
        assert!(matches!(phase, Phase::Running(_)));
        assert_eq!(registry.status(id), Some(JobStatus::Running));

        assert!(registry.fail(ticket, Some(2)));
        assert!(matches!(registry.phase(ticket), Ok(Phase::Failed(Some(2)))));
        assert_eq!(registry.jobs()[0].exit_code, Some(2));
        assert_eq!(registry.running(), 0);
        assert_eq!(registry.len(), 1);
    }
}
