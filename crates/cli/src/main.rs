//! `driftflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `check`    — validate a flow definition JSON file.
//! - `preview`  — print a schedule's upcoming run times.

mod definition;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use engine::{CronSchedule, IntervalSchedule, OneShotSchedule, Schedule};
use settings::{Overrides, Settings};

use crate::definition::FlowDefinition;

#[derive(Parser)]
#[command(
    name = "driftflow",
    about = "Workflow orchestration engine for DAGs of retryable tasks",
    version
)]
struct Cli {
    /// Driftflow home directory (default: ~/.driftflow).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Config file path (default: <home>/driftflow.toml).
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// Log level filter, e.g. "info" or "engine=debug".
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow definition JSON file.
    Check {
        /// Path to the flow definition.
        path: PathBuf,
    },
    /// Print a schedule's next run times.
    Preview {
        #[command(flatten)]
        spec: ScheduleSpec,

        /// How many run times to print.
        #[arg(long, default_value_t = 5)]
        count: usize,

        /// Compute runs after this instant (RFC 3339; default: now).
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ScheduleSpec {
    /// Five-field cron expression, e.g. "0 */6 * * *".
    #[arg(long)]
    cron: Option<String>,

    /// Fixed period in seconds, anchored at --after (or now).
    #[arg(long)]
    every: Option<u64>,

    /// A single run time (RFC 3339).
    #[arg(long)]
    at: Option<DateTime<Utc>>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Settings::load(Overrides {
        home: cli.home.clone(),
        config_file: cli.config_file.clone(),
        log_level: cli.log_level.clone(),
        ..Overrides::default()
    })
    .context("failed to load settings")?;
    settings::init_logging(&config);

    match cli.command {
        Command::Check { path } => check(&path),
        Command::Preview { spec, count, after } => preview(spec, count, after),
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let parsed: FlowDefinition =
        serde_json::from_str(&content).context("invalid flow definition JSON")?;

    let flow = parsed.build()?;
    let order = flow.validate()?;
    info!(flow = flow.name(), tasks = order.len(), "flow definition validated");
    println!("flow '{}' is valid; execution order: {order:?}", flow.name());
    Ok(())
}

fn preview(
    spec: ScheduleSpec,
    count: usize,
    after: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let schedule: Arc<dyn Schedule> = if let Some(expression) = spec.cron {
        Arc::new(CronSchedule::parse(&expression)?)
    } else if let Some(seconds) = spec.every {
        let anchor = after.unwrap_or_else(Utc::now);
        Arc::new(IntervalSchedule::new(
            anchor,
            std::time::Duration::from_secs(seconds),
        )?)
    } else if let Some(at) = spec.at {
        Arc::new(OneShotSchedule::new(at))
    } else {
        bail!("one of --cron, --every or --at is required");
    };

    let after = after.unwrap_or_else(Utc::now);
    let runs = schedule.next_runs(after, count);
    if runs.is_empty() {
        println!("no upcoming runs after {after}");
        return Ok(());
    }
    for run in runs {
        println!("{run}");
    }
    Ok(())
}
