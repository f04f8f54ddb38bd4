use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sweep_scheduler::config::{default_workers, FailurePolicy, SchedulerConfig, SweepConfig};
use sweep_scheduler::driver::{BatchResult, Driver, SweepPlan, SweepReport};
use sweep_scheduler::error::SweepError;
use sweep_scheduler::scheduler::{JobOutcome, JobSpec, Scheduler};
use sweep_scheduler::shutdown::cancel_on_signal;
use sweep_scheduler::template::{build_spec, RunRequest};

#[derive(Parser, Debug)]
#[command(name = "sweep-scheduler")]
#[command(version)]
#[command(about = "Run external programs on a bounded worker pool")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a list of commands and print their output
    Exec(ExecArgs),

    /// Run a parameter sweep described by a config file
    Sweep(SweepArgs),

    /// Print the command line a sweep run would use, without running it
    Render(RenderArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PoolArgs {
    /// Maximum number of jobs running at once (default: CPUs - 1)
    #[arg(long, short = 'j')]
    workers: Option<usize>,

    /// Scheduling tick in milliseconds
    #[arg(long, default_value = "100")]
    interval_ms: u64,

    /// What to do when a job exits non-zero
    #[arg(long, value_enum, default_value = "abort")]
    on_failure: FailurePolicy,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl PoolArgs {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            num_workers: self.workers.unwrap_or_else(default_workers),
            schedule_interval_ms: self.interval_ms,
            failure_policy: self.on_failure,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct TemplateArgs {
    /// Sweep configuration (JSON)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Job template name from the config
    #[arg(long)]
    job: String,

    /// Keyword override for a template token, as key=value (repeatable)
    #[arg(long = "set", value_parser = parse_key_value)]
    kwargs: Vec<(String, String)>,
}

// =============================================================================
// Subcommand Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExecArgs {
    #[command(flatten)]
    pool: PoolArgs,

    /// Priorities for the commands, in order (comma-separated; missing
    /// entries are unprioritised)
    #[arg(long, short = 'p', value_delimiter = ',', allow_negative_numbers = true)]
    priorities: Vec<i64>,

    /// Working directory for every command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Commands to run; each is split on whitespace (no shell)
    #[arg(required = true)]
    commands: Vec<String>,
}

#[derive(Parser, Debug)]
struct SweepArgs {
    #[command(flatten)]
    pool: PoolArgs,

    #[command(flatten)]
    template: TemplateArgs,

    /// Population sizes to sweep (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    pop: Vec<u64>,

    /// Repetitions per population size
    #[arg(long, default_value = "1")]
    runs: usize,

    /// Field to smooth across population sizes
    #[arg(long, requires = "smooth_window")]
    smooth_field: Option<String>,

    /// Moving-average window (odd)
    #[arg(long, requires = "smooth_field")]
    smooth_window: Option<usize>,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    #[command(flatten)]
    template: TemplateArgs,

    /// Population size
    #[arg(long)]
    pop: u64,

    /// Seed
    #[arg(long, default_value = "0")]
    seed: u32,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SweepOutput<'a> {
    #[serde(flatten)]
    report: &'a SweepReport,
    smoothed: Option<Vec<f64>>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got \"{}\"", s))
}

fn start_driver(pool: &PoolArgs) -> Result<(Driver, CancellationToken), Box<dyn std::error::Error>> {
    let config = pool.scheduler_config();
    let scheduler = Arc::new(Scheduler::new(&config)?);
    let driver = Driver::new(scheduler, &config);

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());
    Ok((driver, token))
}

fn outcome_label<T>(outcome: &JobOutcome<T>) -> String {
    match outcome {
        JobOutcome::Succeeded(_) => "0".to_string(),
        JobOutcome::Failed { code: Some(code) } => code.to_string(),
        JobOutcome::Failed { code: None } => "-".to_string(),
    }
}

fn print_batch(results: &[BatchResult], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(results)?),
        OutputFormat::Table => {
            for result in results {
                println!("Job {} [exit {}]: {}", result.id, outcome_label(&result.outcome), result.command);
                if let JobOutcome::Succeeded(output) = &result.outcome {
                    for line in output.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_sweep(
    report: &SweepReport,
    smoothed: Option<Vec<f64>>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let output = SweepOutput { report, smoothed };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let fields: Vec<&String> = {
                let mut names: Vec<&String> = report.rows.iter().flat_map(|r| r.means.keys()).collect();
                names.sort();
                names.dedup();
                names
            };

            print!("{:<10} {:<4} {:<4} {:<4}", "POP", "OK", "FAIL", "MISS");
            for field in &fields {
                print!(" {:>14}", field);
            }
            if smoothed.is_some() {
                print!(" {:>14}", "SMOOTHED");
            }
            println!();
            println!("{}", "-".repeat(26 + 15 * (fields.len() + usize::from(smoothed.is_some()))));

            for (i, row) in report.rows.iter().enumerate() {
                print!("{:<10} {:<4} {:<4} {:<4}", row.pop, row.succeeded, row.failed, row.unmatched);
                for field in &fields {
                    match row.means.get(*field) {
                        Some(value) => print!(" {:>14.4}", value),
                        None => print!(" {:>14}", "-"),
                    }
                }
                if let Some(values) = &smoothed {
                    print!(" {:>14.4}", values[i]);
                }
                println!();
            }
        }
    }
    Ok(())
}

// =============================================================================
// Subcommand Handlers
// =============================================================================

async fn run_exec(args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (driver, token) = start_driver(&args.pool)?;

    let specs: Vec<JobSpec> = args
        .commands
        .iter()
        .enumerate()
        .map(|(i, command)| {
            let spec = JobSpec::new(command.clone()).with_priority(args.priorities.get(i).copied());
            match &args.cwd {
                Some(cwd) => spec.with_cwd(cwd.clone()),
                None => spec,
            }
        })
        .collect();

    let schedule_loop = driver.spawn(token.clone());
    let results = driver.run_batch(specs, &token).await;
    token.cancel();
    schedule_loop.await??;

    print_batch(&results?, &args.pool.output)
}

async fn run_sweep(args: SweepArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SweepConfig::load(&args.template.config)?;
    let plan = SweepPlan {
        job: args.template.job.clone(),
        populations: args.pop.clone(),
        runs: args.runs,
        kwargs: args.template.kwargs.iter().cloned().collect(),
    };

    let (driver, token) = start_driver(&args.pool)?;
    let schedule_loop = driver.spawn(token.clone());
    let report = driver.run_sweep(&config, &plan, &token).await;
    token.cancel();
    schedule_loop.await??;
    let report = report?;

    let smoothed = match (&args.smooth_field, args.smooth_window) {
        (Some(field), Some(k)) => Some(report.smoothed(field, k).map_err(SweepError::from)?),
        _ => None,
    };
    print_sweep(&report, smoothed, &args.pool.output)
}

fn run_render(args: RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SweepConfig::load(&args.template.config)?;
    let kwargs: BTreeMap<String, String> = args.template.kwargs.into_iter().collect();
    let spec = build_spec(
        &config,
        &RunRequest {
            job: &args.template.job,
            kwargs: &kwargs,
            pop: args.pop,
            seed: args.seed,
            priority: Default::default(),
        },
    )?;

    if let Some(cwd) = &spec.cwd {
        println!("cd {}", cwd.display());
    }
    for (key, value) in &spec.env {
        println!("{}={}", key, value);
    }
    println!("{}", spec.command);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Commands::Exec(exec_args) => run_exec(exec_args).await,
        Commands::Sweep(sweep_args) => run_sweep(sweep_args).await,
        Commands::Render(render_args) => run_render(render_args),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Run failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
