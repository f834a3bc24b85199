//! metrics-etl command line: runs imports and prints engine reads as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use metrics_etl::config::EngineSettings;
use metrics_etl::errors::AppError;
use metrics_etl::jobs::{FetchFuture, Fetcher};
use metrics_etl::models::{ImportSource, ListSignalsFilters, Period, PeriodType};
use metrics_etl::signals::Baseline;
use metrics_etl::sources::sheet::SheetOptions;
use metrics_etl::{init_tracing, MetricsEngine};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "metrics-etl")]
#[command(about = "Branch metrics ETL, aggregation and occupancy engine")]
#[command(version)]
struct Args {
    /// Engine configuration file
    #[arg(short, long, env = "METRICS_ETL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a payload file (sheet rows or sync payload, JSON)
    Import {
        #[arg(long, value_enum)]
        source: SourceArg,
        file: PathBuf,
        /// Defaults to the file name
        #[arg(long)]
        file_id: Option<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Show one import run, or the latest runs
    Status {
        run_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Queue an import job that reads the file, and wait for it
    Job {
        #[arg(long, value_enum)]
        source: SourceArg,
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Merged daily facts, or derived values for derived metrics
    Merged {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        metric: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Aggregate for the week or month containing a date
    Aggregate {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        metric: String,
        #[arg(long, value_enum)]
        period: PeriodArg,
        #[arg(long)]
        date: NaiveDate,
        /// Print the month report instead (month periods only)
        #[arg(long)]
        report: bool,
    },
    /// Record signals for one metric, or every metric of the branch
    Detect {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long, value_enum)]
        period: PeriodArg,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_enum, default_value = "prior-period")]
        baseline: BaselineArg,
        /// Run only the cash reconciliation
        #[arg(long, conflicts_with = "metric")]
        cash_control: bool,
    },
    /// List recorded signals
    Signals {
        #[arg(long)]
        branch: String,
        #[arg(long, value_enum)]
        period: Option<PeriodArg>,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Occupancy grid for a staff group
    Grid {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        group: String,
        #[arg(long, value_enum, default_value = "month")]
        period: PeriodArg,
        #[arg(long)]
        date: NaiveDate,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SourceArg {
    ManualSheet,
    BookingSync,
}

impl From<SourceArg> for ImportSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::ManualSheet => ImportSource::ManualSheet,
            SourceArg::BookingSync => ImportSource::BookingSync,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PeriodArg {
    Week,
    Month,
}

impl From<PeriodArg> for PeriodType {
    fn from(value: PeriodArg) -> Self {
        match value {
            PeriodArg::Week => PeriodType::Week,
            PeriodArg::Month => PeriodType::Month,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BaselineArg {
    PriorPeriod,
    Plan,
}

impl From<BaselineArg> for Baseline {
    fn from(value: BaselineArg) -> Self {
        match value {
            BaselineArg::PriorPeriod => Baseline::PriorPeriod,
            BaselineArg::Plan => Baseline::Plan,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = EngineSettings::resolve_path(args.config.as_deref());
    let settings = EngineSettings::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    init_tracing(settings.log_dir.as_deref()).context("Failed to initialize logging")?;

    let engine = MetricsEngine::open(settings).context("Failed to open metrics engine")?;
    run(&engine, args.command).await
}

async fn run(engine: &MetricsEngine, command: Command) -> Result<()> {
    match command {
        Command::Import {
            source,
            file,
            file_id,
            from,
            to,
        } => {
            let payload = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let file_id = file_id.unwrap_or_else(|| file_name(&file));
            let options = SheetOptions {
                date_from: from,
                date_to: to,
            };
            let outcome = engine
                .import(source.into(), &file_id, &payload, &options)
                .context("Import failed")?;
            print_json(&outcome)
        }
        Command::Status { run_id: Some(run_id), .. } => {
            print_json(&engine.import_run(&run_id).context("Failed to read import run")?)
        }
        Command::Status { run_id: None, limit } => {
            print_json(&engine.list_import_runs(None, limit).context("Failed to list import runs")?)
        }
        Command::Job { source, file, priority } => {
            engine.start_jobs();
            let file_id = file_name(&file);
            let fetcher: Fetcher = Arc::new(move || -> FetchFuture {
                let file = file.clone();
                Box::pin(async move { tokio::fs::read(&file).await.map_err(AppError::from) })
            });
            let job = engine
                .submit_import_job(source.into(), &file_id, priority, fetcher)
                .await
                .context("Failed to queue import job")?;
            let imports = engine.settings().imports;
            let budget = (imports.fetch_timeout_ms + imports.retry_backoff_ms) * (u64::from(imports.max_retries) + 1);
            let job = engine
                .wait_for_job(&job.id, Duration::from_millis(budget) + Duration::from_secs(30))
                .await
                .context("Failed to poll import job")?;
            print_json(&job)
        }
        Command::Merged {
            branch,
            metric,
            from,
            to,
        } => {
            let definition = engine
                .database()
                .get_metric(&metric)
                .context("Failed to read metric")?
                .with_context(|| format!("Unknown metric {}", metric))?;
            if definition.is_derived {
                print_json(&engine.read_derived(&branch, &metric, from, to)?)
            } else {
                print_json(&engine.read_merged(&branch, &metric, from, to)?)
            }
        }
        Command::Aggregate {
            branch,
            metric,
            period,
            date,
            report,
        } => {
            if report {
                let month = Period::month_containing(date);
                return print_json(&engine.month_report(&branch, &metric, month.start)?);
            }
            print_json(&engine.aggregate(&branch, &metric, Period::containing(period.into(), date))?)
        }
        Command::Detect {
            branch,
            metric,
            period,
            date,
            baseline,
            cash_control,
        } => {
            let period = Period::containing(period.into(), date);
            if cash_control {
                return print_json(&engine.detect_cash_control(&branch, period)?);
            }
            match metric {
                Some(metric) => print_json(&engine.detect(&branch, &metric, period, baseline.into())?),
                None => print_json(&engine.detect_branch(&branch, period, baseline.into())?),
            }
        }
        Command::Signals {
            branch,
            period,
            metric,
            from,
            to,
        } => {
            let filters = ListSignalsFilters {
                period_type: period.map(Into::into),
                from,
                to,
                metric_code: metric,
            };
            print_json(&engine.list_signals(&branch, &filters)?)
        }
        Command::Grid {
            branch,
            group,
            period,
            date,
        } => match period {
            PeriodArg::Week => print_json(&engine.week_grid(&branch, &group, date)?),
            PeriodArg::Month => print_json(&engine.month_grid(&branch, &group, date)?),
        },
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}
