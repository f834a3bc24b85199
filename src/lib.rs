pub mod aggregate;
pub mod config;
pub mod db;
pub mod derived;
pub mod errors;
pub mod ingest;
pub mod jobs;
pub mod merge;
pub mod models;
pub mod occupancy;
pub mod scheduler;
pub mod signals;
pub mod sources;

use crate::config::EngineSettings;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::jobs::{Fetcher, JobQueue};
use crate::models::{
    Aggregate, DailyFact, DailySeries, DerivedFact, FactSource, ImportJob, ImportOutcome, ImportRun, ImportSource,
    ListSignalsFilters, MergedFact, MonthGroup, MonthReport, Period, PlanValue, Signal, WeekGroup,
};
use crate::signals::Baseline;
use crate::sources::sheet::SheetOptions;
use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// The engine as external callers see it: imports in, merged facts, aggregates, signals and grids out.
#[derive(Clone)]
pub struct MetricsEngine {
    db: Arc<Database>,
    settings: Arc<EngineSettings>,
    jobs: JobQueue,
}

impl MetricsEngine {
    /// Opens the store, loads reference rows and fails imports a previous process left running.
    pub fn open(settings: EngineSettings) -> AppResult<Self> {
        settings.validate()?;
        let db = Arc::new(Database::new(&settings.db_path)?);
        db.load_reference(&settings.reference)?;
        let interrupted = db.recover_interrupted_imports()?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "marked interrupted imports as failed on startup");
        }

        let settings = Arc::new(settings);
        let jobs = JobQueue::new(db.clone(), settings.clone());
        Ok(Self { db, settings, jobs })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Starts the import job scheduler. Needs a running tokio runtime.
    pub fn start_jobs(&self) {
        self.jobs.start();
    }

    // ─── Imports ────────────────────────────────────────────────────────────

    pub fn import(
        &self,
        source: ImportSource,
        file_id: &str,
        payload: &[u8],
        options: &SheetOptions,
    ) -> AppResult<ImportOutcome> {
        ingest::import(&self.db, &self.settings, source, file_id, payload, options)
    }

    pub fn import_run(&self, run_id: &str) -> AppResult<ImportRun> {
        self.db
            .get_import_run(run_id)?
            .ok_or_else(|| AppError::NotFound(format!("import run {}", run_id)))
    }

    pub fn list_import_runs(&self, source: Option<ImportSource>, limit: u32) -> AppResult<Vec<ImportRun>> {
        self.db.list_import_runs(source.map(ImportSource::as_str), limit)
    }

    pub async fn submit_import_job(
        &self,
        source: ImportSource,
        file_id: &str,
        priority: i32,
        fetcher: Fetcher,
    ) -> AppResult<ImportJob> {
        self.jobs.submit(source, file_id, priority, fetcher).await
    }

    pub fn job_status(&self, job_id: &str) -> AppResult<ImportJob> {
        self.jobs.status(job_id)
    }

    pub async fn wait_for_job(&self, job_id: &str, timeout: Duration) -> AppResult<ImportJob> {
        self.jobs.wait(job_id, timeout).await
    }

    // ─── Facts ──────────────────────────────────────────────────────────────

    pub fn upsert_daily(
        &self,
        source: FactSource,
        branch_code: &str,
        metric_code: &str,
        date: NaiveDate,
        value: f64,
    ) -> AppResult<DailyFact> {
        self.db.upsert_daily(source, branch_code, metric_code, date, value)
    }

    pub fn upsert_plan(&self, branch_code: &str, metric_code: &str, month_start: NaiveDate, value: f64) -> AppResult<PlanValue> {
        self.db.upsert_plan(branch_code, metric_code, month_start, value)
    }

    pub fn read_merged(&self, branch_code: &str, metric_code: &str, from: NaiveDate, to: NaiveDate) -> AppResult<Vec<MergedFact>> {
        merge::read_merged(&self.db, branch_code, metric_code, from, to)
    }

    pub fn read_derived(
        &self,
        branch_code: &str,
        metric_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<DerivedFact>> {
        derived::read_derived(&self.db, branch_code, metric_code, from, to)
    }

    // ─── Aggregates & signals ───────────────────────────────────────────────

    pub fn aggregate(&self, branch_code: &str, metric_code: &str, period: Period) -> AppResult<Aggregate> {
        aggregate::aggregate(&self.db, branch_code, metric_code, period)
    }

    pub fn month_report(&self, branch_code: &str, metric_code: &str, month_start: NaiveDate) -> AppResult<MonthReport> {
        aggregate::month_report(&self.db, branch_code, metric_code, month_start)
    }

    pub fn detect(&self, branch_code: &str, metric_code: &str, period: Period, baseline: Baseline) -> AppResult<Signal> {
        signals::detect(&self.db, &self.settings.signals, branch_code, metric_code, period, baseline)
    }

    pub fn detect_branch(&self, branch_code: &str, period: Period, baseline: Baseline) -> AppResult<Vec<Signal>> {
        signals::detect_branch(&self.db, &self.settings.signals, branch_code, period, baseline)
    }

    pub fn detect_cash_control(&self, branch_code: &str, period: Period) -> AppResult<Signal> {
        signals::detect_cash_control(&self.db, &self.settings.signals, branch_code, period)
    }

    pub fn list_signals(&self, branch_code: &str, filters: &ListSignalsFilters) -> AppResult<Vec<Signal>> {
        self.db.list_signals(branch_code, filters)
    }

    // ─── Occupancy ──────────────────────────────────────────────────────────

    pub fn month_grid(&self, branch_code: &str, group_id: &str, month_start: NaiveDate) -> AppResult<MonthGroup> {
        occupancy::build_month_grid(&self.db, branch_code, group_id, month_start, self.settings.occupancy)
    }

    pub fn week_grid(&self, branch_code: &str, group_id: &str, date: NaiveDate) -> AppResult<WeekGroup> {
        occupancy::build_week_grid(&self.db, branch_code, group_id, date, self.settings.occupancy)
    }

    pub fn daily_load(&self, branch_code: &str, group_id: &str, from: NaiveDate, to: NaiveDate) -> AppResult<DailySeries> {
        occupancy::daily_load_series(&self.db, branch_code, group_id, from, to, self.settings.occupancy)
    }
}

/// JSON logs filtered by `RUST_LOG` (default `info`). Written to a daily file under `log_dir`, else stderr.
pub fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| AppError::Internal(error.to_string()));
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "metrics-etl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
