use super::{parse_time, Database};
use crate::config::ImportSettings;
use crate::errors::{AppError, AppResult};
use crate::models::{ImportCounters, ImportJob, ImportRun, ImportSource, ImportStatus, JobState};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use uuid::Uuid;

const RUN_COLUMNS: &str =
    "id, source, file_id, content_hash, status, started_at, finished_at, error, rows_written, rows_skipped";
const JOB_COLUMNS: &str = "id, source, file_id, state, priority, queued_at, attempts, max_retries, retry_backoff_ms,
     timeout_ms, last_error, import_run_id, started_at, finished_at";

impl Database {
    // ─── Import ledger ──────────────────────────────────────────────────────

    /// Opens a `running` ledger row, or records a failed row and rejects the attempt.
    ///
    /// The checks and the insert share one IMMEDIATE transaction, so two callers racing
    /// on the same hash or source serialize on the write lock and the second one sees
    /// the first one's row. The partial unique indexes on `import_runs` back this up.
    pub fn begin_import(&self, source: &str, file_id: &str, content_hash: &str) -> AppResult<ImportRun> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run_id = Uuid::new_v4().to_string();

        let rejection = if let Some(existing_run_id) = live_run_with_hash(&tx, content_hash, "success")? {
            Some(AppError::DuplicateImport {
                run_id: run_id.clone(),
                content_hash: content_hash.to_string(),
                existing_run_id,
            })
        } else if let Some(active_run_id) = running_run_for_source(&tx, source)? {
            Some(AppError::ConcurrentImport {
                run_id: run_id.clone(),
                source_name: source.to_string(),
                active_run_id,
            })
        } else if let Some(existing_run_id) = live_run_with_hash(&tx, content_hash, "running")? {
            Some(AppError::DuplicateImport {
                run_id: run_id.clone(),
                content_hash: content_hash.to_string(),
                existing_run_id,
            })
        } else {
            None
        };

        let now = Utc::now();
        let (status, finished_at, error_text) = match &rejection {
            Some(error) => (ImportStatus::Failed, Some(now), Some(error.to_string())),
            None => (ImportStatus::Running, None, None),
        };
        tx.execute(
            "INSERT INTO import_runs (id, source, file_id, content_hash, status, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                source,
                file_id,
                content_hash,
                status.as_str(),
                now.to_rfc3339(),
                finished_at.map(|at| at.to_rfc3339()),
                error_text,
            ],
        )?;
        tx.commit()?;

        if let Some(error) = rejection {
            tracing::warn!(run_id = %run_id, source, content_hash, error = %error, "import rejected");
            return Err(error);
        }

        tracing::info!(run_id = %run_id, source, file_id, "import run started");
        Ok(ImportRun {
            id: run_id,
            source: source.to_string(),
            file_id: file_id.to_string(),
            content_hash: content_hash.to_string(),
            status,
            started_at: now,
            finished_at,
            error: error_text,
            rows_written: 0,
            rows_skipped: 0,
        })
    }

    /// Moves a running ledger row to a terminal state.
    pub fn complete_import(
        &self,
        run_id: &str,
        status: ImportStatus,
        error: Option<&str>,
        counters: &ImportCounters,
    ) -> AppResult<ImportRun> {
        if status == ImportStatus::Running {
            return Err(AppError::Validation("an import can only complete as success or failed".to_string()));
        }

        {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE import_runs
                 SET status = ?1, finished_at = ?2, error = ?3, rows_written = ?4, rows_skipped = ?5
                 WHERE id = ?6 AND status = 'running'",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    error,
                    counters.rows_written as i64,
                    counters.rows_skipped as i64,
                    run_id,
                ],
            )?;
            if changed == 0 {
                let exists: i64 =
                    conn.query_row("SELECT COUNT(1) FROM import_runs WHERE id = ?1", [run_id], |row| row.get(0))?;
                return Err(if exists == 0 {
                    AppError::NotFound(format!("import run {}", run_id))
                } else {
                    AppError::Validation(format!("import run {} is already finished", run_id))
                });
            }
        }

        tracing::info!(
            run_id,
            status = status.as_str(),
            rows_written = counters.rows_written,
            rows_skipped = counters.rows_skipped,
            "import run finished"
        );
        self.get_import_run(run_id)?
            .ok_or_else(|| AppError::NotFound(format!("import run {}", run_id)))
    }

    pub fn get_import_run(&self, run_id: &str) -> AppResult<Option<ImportRun>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM import_runs WHERE id = ?1", RUN_COLUMNS),
            [run_id],
            parse_run_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_import_runs(&self, source: Option<&str>, limit: u32) -> AppResult<Vec<ImportRun>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM import_runs
             WHERE (?1 IS NULL OR source = ?1)
             ORDER BY started_at DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![source, limit.clamp(1, 500)], parse_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Import jobs ────────────────────────────────────────────────────────

    pub fn insert_import_job(
        &self,
        source: ImportSource,
        file_id: &str,
        priority: i32,
        settings: &ImportSettings,
    ) -> AppResult<ImportJob> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO import_jobs (id, source, file_id, state, priority, queued_at, attempts, max_retries, retry_backoff_ms, timeout_ms)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, 0, ?6, ?7, ?8)",
            params![
                id,
                source.as_str(),
                file_id,
                priority,
                now.to_rfc3339(),
                settings.max_retries,
                settings.retry_backoff_ms as i64,
                settings.fetch_timeout_ms as i64,
            ],
        )?;
        Ok(ImportJob {
            id,
            source,
            file_id: file_id.to_string(),
            state: JobState::Queued,
            priority,
            queued_at: now,
            attempts: 0,
            max_retries: settings.max_retries,
            retry_backoff_ms: settings.retry_backoff_ms,
            timeout_ms: settings.fetch_timeout_ms,
            last_error: None,
            import_run_id: None,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn mark_job_running(&self, job_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE import_jobs SET state = 'running', started_at = ?1 WHERE id = ?2 AND state = 'queued'",
            params![Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    }

    /// Counts one fetch attempt; `error` is kept as the job's last error when present.
    pub fn record_job_attempt(&self, job_id: &str, error: Option<&str>) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE import_jobs SET attempts = attempts + 1, last_error = COALESCE(?1, last_error) WHERE id = ?2",
            params![error, job_id],
        )?;
        Ok(())
    }

    pub fn mark_job_finished(
        &self,
        job_id: &str,
        failed: bool,
        import_run_id: Option<&str>,
        last_error: Option<&str>,
    ) -> AppResult<()> {
        let state = if failed { JobState::Failed } else { JobState::Completed };
        let conn = self.lock()?;
        conn.execute(
            "UPDATE import_jobs
             SET state = ?1, finished_at = ?2, import_run_id = COALESCE(?3, import_run_id),
                 last_error = COALESCE(?4, last_error)
             WHERE id = ?5 AND state IN ('queued', 'running')",
            params![state.as_str(), Utc::now().to_rfc3339(), import_run_id, last_error, job_id],
        )?;
        Ok(())
    }

    pub fn get_import_job(&self, job_id: &str) -> AppResult<Option<ImportJob>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM import_jobs WHERE id = ?1", JOB_COLUMNS),
            [job_id],
            parse_job_row,
        )
        .optional()
        .map_err(AppError::from)
    }
}

fn live_run_with_hash(tx: &Transaction<'_>, content_hash: &str, status: &str) -> AppResult<Option<String>> {
    tx.query_row(
        "SELECT id FROM import_runs WHERE content_hash = ?1 AND status = ?2 LIMIT 1",
        params![content_hash, status],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}

fn running_run_for_source(tx: &Transaction<'_>, source: &str) -> AppResult<Option<String>> {
    tx.query_row(
        "SELECT id FROM import_runs WHERE source = ?1 AND status = 'running' LIMIT 1",
        [source],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportRun> {
    Ok(ImportRun {
        id: row.get(0)?,
        source: row.get(1)?,
        file_id: row.get(2)?,
        content_hash: row.get(3)?,
        status: parse_status(&row.get::<_, String>(4)?),
        started_at: parse_time(&row.get::<_, String>(5)?)?,
        finished_at: row.get::<_, Option<String>>(6)?.map(|raw| parse_time(&raw)).transpose()?,
        error: row.get(7)?,
        rows_written: row.get::<_, i64>(8)?.max(0) as u64,
        rows_skipped: row.get::<_, i64>(9)?.max(0) as u64,
    })
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportJob> {
    Ok(ImportJob {
        id: row.get(0)?,
        source: parse_source(&row.get::<_, String>(1)?),
        file_id: row.get(2)?,
        state: parse_job_state(&row.get::<_, String>(3)?),
        priority: row.get(4)?,
        queued_at: parse_time(&row.get::<_, String>(5)?)?,
        attempts: row.get(6)?,
        max_retries: row.get(7)?,
        retry_backoff_ms: row.get::<_, i64>(8)?.max(0) as u64,
        timeout_ms: row.get::<_, i64>(9)?.max(0) as u64,
        last_error: row.get(10)?,
        import_run_id: row.get(11)?,
        started_at: row.get::<_, Option<String>>(12)?.map(|raw| parse_time(&raw)).transpose()?,
        finished_at: row.get::<_, Option<String>>(13)?.map(|raw| parse_time(&raw)).transpose()?,
    })
}

fn parse_status(raw: &str) -> ImportStatus {
    match raw {
        "running" => ImportStatus::Running,
        "success" => ImportStatus::Success,
        _ => ImportStatus::Failed,
    }
}

fn parse_source(raw: &str) -> ImportSource {
    match raw {
        "booking_sync" => ImportSource::BookingSync,
        _ => ImportSource::ManualSheet,
    }
}

fn parse_job_state(raw: &str) -> JobState {
    match raw {
        "queued" => JobState::Queued,
        "running" => JobState::Running,
        "completed" => JobState::Completed,
        _ => JobState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ImportSettings;
    use crate::db::{test_support, Database};
    use crate::errors::AppError;
    use crate::models::{ImportCounters, ImportSource, ImportStatus, JobState};

    #[test]
    fn duplicate_hash_is_rejected_after_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);

        let first = db.begin_import("manual_sheet", "march.xlsx", "abc").expect("begin");
        db.complete_import(&first.id, ImportStatus::Success, None, &ImportCounters::default())
            .expect("complete");

        let error = db.begin_import("manual_sheet", "march.xlsx", "abc").expect_err("duplicate");
        let AppError::DuplicateImport { run_id, existing_run_id, .. } = &error else {
            panic!("unexpected error: {error}");
        };
        assert_eq!(existing_run_id, &first.id);

        let rejected = db.get_import_run(run_id).expect("get").expect("recorded");
        assert_eq!(rejected.status, ImportStatus::Failed);
        assert!(rejected.error.expect("error").starts_with("DUPLICATE_IMPORT"));

        db.begin_import("manual_sheet", "march-v2.xlsx", "def").expect("new hash");
    }

    #[test]
    fn second_running_import_for_source_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);

        let active = db.begin_import("booking_sync", "day-1", "h1").expect("begin");
        let error = db.begin_import("booking_sync", "day-2", "h2").expect_err("busy");
        assert_eq!(error.code(), "CONCURRENT_IMPORT");

        // Another source is independent.
        db.begin_import("manual_sheet", "sheet", "h3").expect("other source");

        db.complete_import(&active.id, ImportStatus::Failed, Some("boom"), &ImportCounters::default())
            .expect("fail");
        // A failed hash may be retried.
        db.begin_import("booking_sync", "day-1", "h1").expect("retry after failure");
    }

    #[test]
    fn completing_twice_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);

        let run = db.begin_import("manual_sheet", "f", "x").expect("begin");
        let counters = ImportCounters {
            rows_written: 4,
            rows_skipped: 1,
            ..ImportCounters::default()
        };
        let done = db
            .complete_import(&run.id, ImportStatus::Success, None, &counters)
            .expect("complete");
        assert_eq!(done.rows_written, 4);
        assert!(done.finished_at.is_some());

        let again = db.complete_import(&run.id, ImportStatus::Failed, None, &counters);
        assert!(matches!(again, Err(AppError::Validation(_))));
        let missing = db.complete_import("nope", ImportStatus::Failed, None, &counters);
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[test]
    fn restart_recovery_fails_running_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);

        let run = db.begin_import("manual_sheet", "f", "x").expect("begin");
        assert_eq!(db.recover_interrupted_imports().expect("recover"), 1);
        let recovered = db.get_import_run(&run.id).expect("get").expect("row");
        assert_eq!(recovered.status, ImportStatus::Failed);
        db.begin_import("manual_sheet", "f", "x").expect("source free again");
    }

    #[test]
    fn job_lifecycle_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);

        let job = db
            .insert_import_job(ImportSource::BookingSync, "day-1", 0, &ImportSettings::default())
            .expect("insert");
        db.mark_job_running(&job.id).expect("running");
        db.record_job_attempt(&job.id, Some("EXTERNAL_TIMEOUT: slow")).expect("attempt");
        db.record_job_attempt(&job.id, None).expect("attempt");
        db.mark_job_finished(&job.id, false, None, None).expect("finish");

        let stored = db.get_import_job(&job.id).expect("get").expect("job");
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.source, ImportSource::BookingSync);
        assert_eq!(stored.last_error.as_deref(), Some("EXTERNAL_TIMEOUT: slow"));
        assert!(db.get_import_job("missing").expect("get").is_none());
    }

    #[test]
    fn racing_connections_admit_one_run_per_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("race.db");
        let handles: Vec<Database> = (0..8).map(|_| Database::new(&path).expect("db")).collect();
        let barrier = std::sync::Barrier::new(handles.len());

        for round in 0..10 {
            let results: Vec<_> = std::thread::scope(|scope| {
                let workers: Vec<_> = handles
                    .iter()
                    .enumerate()
                    .map(|(worker, db)| {
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            db.begin_import("booking_sync", "day", &format!("hash-{}-{}", round, worker))
                        })
                    })
                    .collect();
                workers.into_iter().map(|worker| worker.join().expect("worker")).collect()
            });

            let admitted: Vec<_> = results.iter().filter_map(|result| result.as_ref().ok()).collect();
            assert_eq!(admitted.len(), 1, "round {}", round);
            assert!(results
                .iter()
                .filter_map(|result| result.as_ref().err())
                .all(|error| error.code() == "CONCURRENT_IMPORT"));
            handles[0]
                .complete_import(&admitted[0].id, ImportStatus::Success, None, &ImportCounters::default())
                .expect("complete");
        }
    }
}
