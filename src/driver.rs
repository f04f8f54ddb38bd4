use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::analysis::moving_average;
use crate::config::{FailurePolicy, SchedulerConfig, SweepConfig};
use crate::error::{AnalysisError, Result, SweepError, TemplateError};
use crate::output::{OutputGrammar, Record};
use crate::scheduler::{JobId, JobOutcome, JobSpec, Priority, Scheduler};
use crate::template::{build_spec, RunRequest};

/// Fields every sweep grammar must extract.
const REQUIRED_FIELDS: [&str; 1] = ["nfe"];

/// Feeds a [`Scheduler`] from a timer and collects results, applying the
/// configured [`FailurePolicy`].
pub struct Driver {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    policy: FailurePolicy,
}

/// Result of one job run through [`Driver::run_batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub id: JobId,
    pub command: String,
    pub outcome: JobOutcome<String>,
    pub finished_at: DateTime<Utc>,
}

/// One sweep: `runs` repetitions of `job` for every population size.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub job: String,
    pub populations: Vec<u64>,
    pub runs: usize,
    pub kwargs: BTreeMap<String, String>,
}

/// Aggregated results for one population size.
#[derive(Debug, Clone, Serialize)]
pub struct PopulationSummary {
    pub pop: u64,
    pub succeeded: usize,
    pub failed: usize,
    /// Runs that exited 0 but whose output did not fit the grammar.
    pub unmatched: usize,
    /// Mean of each field over the matched runs.
    pub means: BTreeMap<String, f64>,
}

impl PopulationSummary {
    fn new(pop: u64) -> Self {
        Self {
            pop,
            succeeded: 0,
            failed: 0,
            unmatched: 0,
            means: BTreeMap::new(),
        }
    }
}

/// Per-population results, ordered by population size.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub job: String,
    pub rows: Vec<PopulationSummary>,
}

impl SweepReport {
    /// Mean of `field` per population, NaN where no run matched.
    pub fn series(&self, field: &str) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.means.get(field).copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// `series(field)` smoothed with a centered moving average of width `k`.
    pub fn smoothed(&self, field: &str, k: usize) -> std::result::Result<Vec<f64>, AnalysisError> {
        moving_average(&self.series(field), k)
    }
}

impl Driver {
    pub fn new(scheduler: Arc<Scheduler>, config: &SchedulerConfig) -> Self {
        Self {
            scheduler,
            interval: Duration::from_millis(config.schedule_interval_ms),
            policy: config.failure_policy,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Spawn the admission loop: `schedule` on every tick until `token` is
    /// cancelled.
    ///
    /// A launch failure under [`FailurePolicy::Abort`] cancels `token` and
    /// ends the loop with the error; under `Continue` it is logged and the
    /// loop keeps going (the job itself reports as failed).
    pub fn spawn(&self, token: CancellationToken) -> JoinHandle<Result<()>> {
        let scheduler = Arc::clone(&self.scheduler);
        let period = self.interval;
        let policy = self.policy;
        tokio::spawn(async move { Self::schedule_loop(scheduler, period, policy, token).await })
    }

    async fn schedule_loop(
        scheduler: Arc<Scheduler>,
        period: Duration,
        policy: FailurePolicy,
        token: CancellationToken,
    ) -> Result<()> {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            num_workers = scheduler.num_workers(),
            interval_ms = period.as_millis() as u64,
            "Schedule loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Schedule loop stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match scheduler.schedule() {
                        Ok(0) => {}
                        Ok(admitted) => {
                            tracing::debug!(
                                admitted,
                                running = scheduler.running(),
                                queued = scheduler.queued(),
                                "Scheduler tick"
                            );
                        }
                        Err(e) if policy == FailurePolicy::Continue => {
                            tracing::warn!(error = %e, "Launch failed, continuing");
                        }
                        Err(e) => {
                            token.cancel();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Queue every spec, wait for all of them and return results in
    /// submission order.
    pub async fn run_batch(
        &self,
        specs: Vec<JobSpec>,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<BatchResult>, SweepError> {
        let jobs: Vec<(JobId, String)> = specs
            .into_iter()
            .map(|spec| {
                let command = spec.command.clone();
                (self.scheduler.queue(spec), command)
            })
            .collect();

        let ids = jobs.iter().map(|(id, _)| *id).collect();
        let outcomes = self.join_all(ids, |output| output, token).await?;

        Ok(jobs
            .into_iter()
            .zip(outcomes)
            .map(|((id, command), (outcome, finished_at))| BatchResult {
                id,
                command,
                outcome,
                finished_at,
            })
            .collect())
    }

    /// Run a parameter sweep and aggregate the parsed output per population.
    ///
    /// The job's output grammar must name an `nfe` field. Each run gets a
    /// random seed and its run index as priority, so the first repetition of
    /// every population is admitted before the second.
    pub async fn run_sweep(
        &self,
        config: &SweepConfig,
        plan: &SweepPlan,
        token: &CancellationToken,
    ) -> std::result::Result<SweepReport, SweepError> {
        let template = config
            .jobs
            .get(&plan.job)
            .ok_or_else(|| TemplateError::UnknownJob(plan.job.clone()))?;
        let grammar = Arc::new(OutputGrammar::parse(&template.io.stdout)?);
        if let Some(field) = REQUIRED_FIELDS.into_iter().find(|f| !grammar.has_field(f)) {
            tracing::error!(job = %plan.job, field = %field, "Output grammar lacks a required field");
            return Err(SweepError::MissingField {
                job: plan.job.clone(),
                field: field.to_string(),
            });
        }

        // Render every run before queueing any, so a template error leaves
        // nothing behind in the scheduler.
        let mut runs = Vec::new();
        for &pop in &plan.populations {
            for run in 0..plan.runs {
                let seed = rand::thread_rng().gen_range(0..=1000);
                let spec = build_spec(
                    config,
                    &RunRequest {
                        job: &plan.job,
                        kwargs: &plan.kwargs,
                        pop,
                        seed,
                        priority: Priority::Key(run as i64),
                    },
                )?;
                runs.push((pop, spec));
            }
        }

        let (pops, ids): (Vec<u64>, Vec<JobId>) = runs
            .into_iter()
            .map(|(pop, spec)| (pop, self.scheduler.queue(spec)))
            .unzip();
        tracing::info!(job = %plan.job, jobs = ids.len(), "Sweep queued");

        let outcomes = self
            .join_all(ids, move |output| grammar.extract(&output), token)
            .await?;

        let mut rows: BTreeMap<u64, (PopulationSummary, Vec<Record>)> = BTreeMap::new();
        for (pop, (outcome, _)) in pops.into_iter().zip(outcomes) {
            let (row, records) = rows
                .entry(pop)
                .or_insert_with(|| (PopulationSummary::new(pop), Vec::new()));
            match outcome {
                JobOutcome::Succeeded(Some(record)) => {
                    row.succeeded += 1;
                    records.push(record);
                }
                JobOutcome::Succeeded(None) => {
                    row.succeeded += 1;
                    row.unmatched += 1;
                }
                JobOutcome::Failed { .. } => row.failed += 1,
            }
        }

        let rows = rows
            .into_values()
            .map(|(mut row, records)| {
                row.means = mean_fields(&records);
                row
            })
            .collect();

        Ok(SweepReport {
            job: plan.job.clone(),
            rows,
        })
    }

    /// Join every id concurrently. Results come back in the order of `ids`.
    async fn join_all<T, F>(
        &self,
        ids: Vec<JobId>,
        post: F,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<(JobOutcome<T>, DateTime<Utc>)>, SweepError>
    where
        T: Send + 'static,
        F: Fn(String) -> T + Clone + Send + 'static,
    {
        let mut set = JoinSet::new();
        for (index, id) in ids.iter().copied().enumerate() {
            let scheduler = Arc::clone(&self.scheduler);
            let post = post.clone();
            set.spawn(async move { (index, id, scheduler.join(id, post).await) });
        }

        let mut results: Vec<Option<(JobOutcome<T>, DateTime<Utc>)>> =
            std::iter::repeat_with(|| None).take(ids.len()).collect();

        loop {
            let joined = tokio::select! {
                _ = token.cancelled() => {
                    set.abort_all();
                    return Err(SweepError::Cancelled);
                }
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (index, id, outcome) = joined?;
            let outcome = outcome?;
            if let JobOutcome::Failed { code } = &outcome {
                match self.policy {
                    FailurePolicy::Abort => {
                        tracing::error!(job_id = %id, exit_code = ?code, "Aborting run");
                        set.abort_all();
                        token.cancel();
                        return Err(SweepError::JobFailed { id, code: *code });
                    }
                    FailurePolicy::Continue => {
                        tracing::warn!(job_id = %id, exit_code = ?code, "Job failed, continuing");
                    }
                }
            }
            results[index] = Some((outcome, Utc::now()));
        }

        Ok(results.into_iter().flatten().collect())
    }
}

fn mean_fields(records: &[Record]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for record in records {
        for (field, value) in record {
            let entry = sums.entry(field.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(field, (sum, count))| (field, sum / count as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_fields_averages_per_field() {
        let mut a = Record::new();
        a.insert("nfe".to_string(), 10.0);
        a.insert("gen".to_string(), 2.0);
        let mut b = Record::new();
        b.insert("nfe".to_string(), 20.0);

        let means = mean_fields(&[a, b]);
        assert_eq!(means["nfe"], 15.0);
        assert_eq!(means["gen"], 2.0);
    }

    #[test]
    fn series_marks_missing_fields_as_nan() {
        let mut means = BTreeMap::new();
        means.insert("nfe".to_string(), 4.0);
        let report = SweepReport {
            job: "ga".to_string(),
            rows: vec![
                PopulationSummary {
                    failed: 1,
                    ..PopulationSummary::new(8)
                },
                PopulationSummary {
                    pop: 16,
                    succeeded: 1,
                    failed: 0,
                    unmatched: 0,
                    means,
                },
            ],
        };
        let series = report.series("nfe");
        assert!(series[0].is_nan());
        assert_eq!(series[1], 4.0);
    }

    #[test]
    fn smoothing_skips_leading_missing_population() {
        let row = |pop: u64, nfe: Option<f64>| {
            let mut summary = PopulationSummary::new(pop);
            if let Some(nfe) = nfe {
                summary.means.insert("nfe".to_string(), nfe);
            }
            summary
        };
        let report = SweepReport {
            job: "ga".to_string(),
            rows: vec![row(4, None), row(8, Some(1.0)), row(16, Some(2.0)), row(32, Some(3.0))],
        };

        let smoothed = report.smoothed("nfe", 3).unwrap();
        assert!(smoothed[0].is_nan());
        assert_eq!(&smoothed[1..], &[1.5, 2.0, 2.5]);
    }
}
