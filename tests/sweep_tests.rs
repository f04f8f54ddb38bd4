use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use sweep_scheduler::driver::SweepPlan;
use sweep_scheduler::error::{SweepError, TemplateError};
use sweep_scheduler::{Driver, FailurePolicy, JobOutcome, JobSpec, Scheduler, SchedulerConfig, SweepConfig};

/// Fake solver: prints "<pop> 42.5", fails for pop 16 and prints nothing
/// useful for pop 4.
const SOLVER: &str = r#"#!/bin/sh
case "$1" in
    16) exit 3 ;;
    4) echo "no result" ; exit 0 ;;
esac
echo "$1 42.5"
"#;

fn write_solver(dir: &Path) {
    let path = dir.join("solver.sh");
    std::fs::write(&path, SOLVER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn sweep_config(dir: &Path) -> SweepConfig {
    let config = json!({
        "basics": { "problem": "onemax" },
        "jobs": {
            "solver": {
                "bin": "solver.sh",
                "cwd": dir,
                "io": {
                    "argv": "pop --seed= seed",
                    "stdout": "{pop} {nfe}"
                }
            }
        }
    });
    serde_json::from_value(config).unwrap()
}

fn driver(policy: FailurePolicy) -> Driver {
    let config = SchedulerConfig {
        num_workers: 2,
        schedule_interval_ms: 5,
        failure_policy: policy,
    };
    Driver::new(Arc::new(Scheduler::new(&config).unwrap()), &config)
}

fn plan(populations: Vec<u64>, runs: usize) -> SweepPlan {
    SweepPlan {
        job: "solver".to_string(),
        populations,
        runs,
        kwargs: BTreeMap::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_aggregates_per_population() {
    let dir = tempfile::tempdir().unwrap();
    write_solver(dir.path());
    let config = sweep_config(dir.path());

    let driver = driver(FailurePolicy::Abort);
    let token = CancellationToken::new();
    let schedule_loop = driver.spawn(token.clone());

    let report = driver.run_sweep(&config, &plan(vec![32, 8], 3), &token).await.unwrap();
    token.cancel();
    schedule_loop.await.unwrap().unwrap();

    assert_eq!(report.job, "solver");
    let pops: Vec<u64> = report.rows.iter().map(|r| r.pop).collect();
    assert_eq!(pops, vec![8, 32]);
    for row in &report.rows {
        assert_eq!(row.succeeded, 3);
        assert_eq!(row.failed, 0);
        assert_eq!(row.unmatched, 0);
        assert_eq!(row.means["pop"], row.pop as f64);
        assert_eq!(row.means["nfe"], 42.5);
    }
    assert_eq!(report.series("nfe"), vec![42.5, 42.5]);
    assert!(driver.scheduler().is_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_aborts_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_solver(dir.path());
    let config = sweep_config(dir.path());

    let driver = driver(FailurePolicy::Abort);
    let token = CancellationToken::new();
    let schedule_loop = driver.spawn(token.clone());

    let result = driver.run_sweep(&config, &plan(vec![8, 16], 1), &token).await;
    match result {
        Err(SweepError::JobFailed { code, .. }) => assert_eq!(code, Some(3)),
        other => panic!("expected job failure, got {:?}", other.map(|r| r.rows.len())),
    }

    // Abort cancels the shared token, which also stops the schedule loop.
    assert!(token.is_cancelled());
    schedule_loop.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_continues_past_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_solver(dir.path());
    let config = sweep_config(dir.path());

    let driver = driver(FailurePolicy::Continue);
    let token = CancellationToken::new();
    let schedule_loop = driver.spawn(token.clone());

    let report = driver
        .run_sweep(&config, &plan(vec![4, 8, 16], 2), &token)
        .await
        .unwrap();
    token.cancel();
    schedule_loop.await.unwrap().unwrap();

    let row = |pop: u64| report.rows.iter().find(|r| r.pop == pop).unwrap();
    assert_eq!(row(4).succeeded, 2);
    assert_eq!(row(4).unmatched, 2);
    assert!(row(4).means.is_empty());
    assert_eq!(row(8).means["nfe"], 42.5);
    assert_eq!(row(16).failed, 2);
    assert_eq!(row(16).succeeded, 0);

    let series = report.series("nfe");
    assert!(series[0].is_nan());
    assert_eq!(series[1], 42.5);
    assert!(series[2].is_nan());

    // Failed runs keep their ids reserved.
    assert_eq!(driver.scheduler().jobs().len(), 2);
}

#[tokio::test]
async fn test_sweep_template_error_queues_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = sweep_config(dir.path());
    let driver = driver(FailurePolicy::Abort);
    let token = CancellationToken::new();

    let mut plan = plan(vec![8], 1);
    plan.job = "missing".to_string();
    let result = driver.run_sweep(&config, &plan, &token).await;

    assert!(matches!(
        result,
        Err(SweepError::Template(TemplateError::UnknownJob(name))) if name == "missing"
    ));
    assert!(driver.scheduler().is_idle());
}

#[tokio::test]
async fn test_sweep_requires_nfe_field() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sweep_config(dir.path());
    if let Some(job) = config.jobs.get_mut("solver") {
        job.io.stdout = "{gen} {lsnfe}".to_string();
    }
    let driver = driver(FailurePolicy::Abort);
    let token = CancellationToken::new();

    let result = driver.run_sweep(&config, &plan(vec![8], 1), &token).await;

    match result {
        Err(SweepError::MissingField { job, field }) => {
            assert_eq!(job, "solver");
            assert_eq!(field, "nfe");
        }
        other => panic!("expected missing field error, got {:?}", other.map(|r| r.rows.len())),
    }
    assert!(driver.scheduler().is_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_results_keep_submission_order() {
    let driver = driver(FailurePolicy::Continue);
    let token = CancellationToken::new();
    let schedule_loop = driver.spawn(token.clone());

    let specs = vec![
        JobSpec::new("sleep 0.2").with_priority(1),
        JobSpec::new("echo fast").with_priority(2),
        JobSpec::new("false"),
        JobSpec::new("echo last"),
    ];
    let results = driver.run_batch(specs, &token).await.unwrap();
    token.cancel();
    schedule_loop.await.unwrap().unwrap();

    let commands: Vec<&str> = results.iter().map(|r| r.command.as_str()).collect();
    assert_eq!(commands, vec!["sleep 0.2", "echo fast", "false", "echo last"]);
    assert_eq!(results[0].outcome, JobOutcome::Succeeded(String::new()));
    assert_eq!(results[1].outcome, JobOutcome::Succeeded("fast\n".to_string()));
    assert_eq!(results[2].outcome, JobOutcome::Failed { code: Some(1) });
    assert_eq!(results[3].outcome, JobOutcome::Succeeded("last\n".to_string()));
}

#[tokio::test]
async fn test_batch_cancellation() {
    // No schedule loop: the jobs stay queued until the token fires.
    let driver = driver(FailurePolicy::Abort);
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let result = driver.run_batch(vec![JobSpec::new("true")], &token).await;
    canceller.await.unwrap();
    assert!(matches!(result, Err(SweepError::Cancelled)));
    assert_eq!(driver.scheduler().queued(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launch_failure_stops_loop_under_abort() {
    let driver = driver(FailurePolicy::Abort);
    let token = CancellationToken::new();
    driver.scheduler().queue(JobSpec::new("/nonexistent/sweep-binary"));

    let schedule_loop = driver.spawn(token.clone());
    let result = tokio::time::timeout(Duration::from_secs(5), schedule_loop)
        .await
        .unwrap()
        .unwrap();

    assert!(result.is_err());
    assert!(token.is_cancelled());
}
