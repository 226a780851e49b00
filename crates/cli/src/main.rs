//! Conductor CLI - run dependency-aware task plans.

mod plan;
mod runner;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use conductor_core::TaskStatus;
use conductor_support::map_bounded;
use plan::Plan;
use runner::PlanReport;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Run dependency-aware task plans", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more plans
    Run {
        /// Plan files (JSON)
        #[arg(required = true)]
        plans: Vec<PathBuf>,
        /// How many plans to run at once
        #[arg(long, default_value = "1")]
        parallel: NonZeroUsize,
        /// Override the concurrency of every plan
        #[arg(long)]
        concurrency: Option<NonZeroUsize>,
        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a plan without running it
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            plans,
            parallel,
            concurrency,
            json,
        } => {
            debug!("Running {} plans, {} at a time", plans.len(), parallel);

            let reports = map_bounded(plans, parallel, |path| async move {
                let plan = Plan::load(&path)?;
                runner::execute(&plan, concurrency).await
            })
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_report(report);
                }
            }

            let unfinished: usize = reports.iter().map(PlanReport::unfinished).sum();
            if unfinished > 0 {
                bail!("{} tasks did not complete", unfinished);
            }
        }
        Commands::Validate { plan } => {
            let loaded = Plan::load(&plan)?;
            let issues = loaded.validate();

            if issues.is_empty() {
                println!("{}: {} tasks, no issues", loaded.display_name(), loaded.tasks.len());
            } else {
                println!("{}: {} issues", loaded.display_name(), issues.len());
                for issue in &issues {
                    println!("  - {}", issue);
                }
                bail!("plan {} is invalid", plan.display());
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &PlanReport) {
    println!("Plan: {} ({}ms)", report.plan, report.elapsed_ms);
    for task in &report.tasks {
        let detail = match (&task.output, &task.error) {
            (_, Some(error)) => error.clone(),
            (Some(output), None) => output.to_string(),
            (None, None) => String::new(),
        };
        println!("  {} | {} | {}", task.id, format_status(task.status), detail);
    }

    let metrics = &report.stats.metrics;
    println!(
        "  added {}, completed {}, failed {}, cancelled {}, avg {:?}",
        metrics.tasks_added,
        metrics.tasks_completed,
        metrics.tasks_failed,
        metrics.tasks_cancelled,
        metrics.average_processing_time(),
    );
}

fn format_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Waiting => "WAITING",
        TaskStatus::Pending => "PENDING",
        TaskStatus::Running => "RUNNING",
        TaskStatus::Completed => "COMPLETED",
        TaskStatus::Failed => "FAILED",
        TaskStatus::Cancelled => "CANCELLED",
    }
}
