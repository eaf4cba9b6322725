use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobmatrix::config::RunnerConfig;
use jobmatrix::execution::ExecutionResult;
use jobmatrix::plan::{run_plan, ExecutionMeta, ExecutionObserver};
use jobmatrix::AbortOperation;

#[derive(Parser)]
#[command(
    name = "jobmatrix",
    about = "Run a matrix of test files against disposable runtimes",
    version,
    long_about = None
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of the plan
    Run {
        /// Config file (default: $JOBMATRIX_CONFIG, then ./jobmatrix.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum number of jobs in flight
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print the report and summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the jobs the plan would run, without running them
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Prints one line per settled job.
struct ProgressPrinter;

impl ExecutionObserver for ProgressPrinter {
    fn before_execution(&mut self, meta: &ExecutionMeta) {
        tracing::debug!(
            file = %meta.file_key,
            runtime = %meta.runtime_label,
            n = meta.execution_number,
            of = meta.execution_count,
            "execution started"
        );
    }

    fn after_execution(&mut self, meta: &ExecutionMeta, result: &ExecutionResult) {
        eprintln!(
            "[{}/{}] {:<12} {} on {} ({:.0}ms)",
            meta.execution_number,
            meta.execution_count,
            result.status.to_string().to_uppercase(),
            meta.file_key,
            meta.runtime_label,
            result.duration_ms()
        );
        for error in &result.errors {
            eprintln!("    {}", error);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<RunnerConfig> {
    match path {
        Some(path) => RunnerConfig::load(&path),
        None => Ok(RunnerConfig::load_or_default()),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            concurrency,
            json,
        } => {
            let config = load_config(config)?;
            let plan = config.build_plan().context("invalid plan")?;
            let mut options = config.plan_options();
            if let Some(limit) = concurrency {
                options.concurrency_limit = limit;
            }

            let batch = Arc::new(AbortOperation::root());
            options.signal = Some(batch.signal());
            let interrupt = {
                let batch = batch.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupted, aborting remaining executions");
                        batch.abort();
                    }
                })
            };

            tracing::info!(jobs = plan.len(), concurrency = options.concurrency_limit, "running plan");
            let output = run_plan(&plan, options, &mut ProgressPrinter).await;
            interrupt.abort();

            if json {
                let value = serde_json::json!({
                    "report": output.report,
                    "summary": output.summary,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", output.summary.describe());
            }

            if !output.kept_runtimes.is_empty() {
                tracing::info!(
                    count = output.kept_runtimes.len(),
                    "runtimes kept running, press Ctrl-C to stop them"
                );
                let _ = tokio::signal::ctrl_c().await;
                for kept in &output.kept_runtimes {
                    let outcome = kept.stop().await;
                    tracing::info!(file = %kept.file_key, runtime = %kept.runtime, ?outcome, "runtime stopped");
                }
            }

            if !output.summary.passed() {
                std::process::exit(1);
            }
        }
        Commands::Plan { config } => {
            let config = load_config(config)?;
            let plan = config.build_plan().context("invalid plan")?;
            for job in plan.flatten() {
                println!(
                    "{:>3}  {}  [{}]  allocated={}{}",
                    job.index + 1,
                    job.file_key,
                    job.runtime_label,
                    job.spec.allocated,
                    if job.spec.keep_running { "  keep-running" } else { "" }
                );
            }
            println!("{} job(s)", plan.len());
        }
    }

    Ok(())
}
