//! Import pipeline: ledger gate, source reader, reference filter, fact writes.

use crate::config::{EngineSettings, ImportSettings};
use crate::db::{Database, FactRow};
use crate::errors::{AppError, AppResult};
use crate::models::{AttendanceRecord, FactSource, ImportCounters, ImportOutcome, ImportRun, ImportSource, ImportStatus};
use crate::sources::sheet::{SheetOptions, SheetReader};
use crate::sources::sync::SyncPayload;
use crate::sources::Row;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;

pub fn content_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Runs a whole import: ledger row, processing and completion.
pub fn import(
    db: &Database,
    settings: &EngineSettings,
    source: ImportSource,
    file_id: &str,
    payload: &[u8],
    options: &SheetOptions,
) -> AppResult<ImportOutcome> {
    let run = begin(db, source, file_id, payload)?;
    process(db, settings, run, source, payload, options)
}

/// Opens the ledger row. Duplicate or busy attempts are recorded and rejected here.
pub fn begin(db: &Database, source: ImportSource, file_id: &str, payload: &[u8]) -> AppResult<ImportRun> {
    if file_id.trim().is_empty() {
        return Err(AppError::Validation("file id is required".to_string()));
    }
    db.begin_import(source.as_str(), file_id, &content_hash(payload))
}

/// Reads and writes the payload of a running import, then closes its ledger row.
///
/// Any error fails the run with the error text and is returned to the caller.
/// A panic inside a reader is caught and fails the run the same way, so the
/// source is never left busy. Rows already written by a failed run stay in place.
pub fn process(
    db: &Database,
    settings: &EngineSettings,
    run: ImportRun,
    source: ImportSource,
    payload: &[u8],
    options: &SheetOptions,
) -> AppResult<ImportOutcome> {
    let result = catch_panic(|| match source {
        ImportSource::ManualSheet => apply_sheet(db, settings, &run, payload, options),
        ImportSource::BookingSync => apply_sync(db, &settings.imports, &run, payload),
    });
    finish(db, run, source, result)
}

fn catch_panic<T>(work: impl FnOnce() -> AppResult<T>) -> AppResult<T> {
    std::panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(AppError::Internal(format!("import panicked: {}", message)))
    })
}

fn finish(db: &Database, run: ImportRun, source: ImportSource, result: AppResult<ImportCounters>) -> AppResult<ImportOutcome> {
    match result {
        Ok(counters) => {
            let run = db.complete_import(&run.id, ImportStatus::Success, None, &counters)?;
            Ok(ImportOutcome { run, counters })
        }
        Err(error) => {
            let message = error.to_string();
            if let Err(complete_error) =
                db.complete_import(&run.id, ImportStatus::Failed, Some(&message), &ImportCounters::default())
            {
                tracing::error!(run_id = %run.id, error = %complete_error, "failed to close import run");
            }
            tracing::warn!(run_id = %run.id, source = source.as_str(), error = %message, "import failed");
            Err(error)
        }
    }
}

fn apply_sheet(
    db: &Database,
    settings: &EngineSettings,
    run: &ImportRun,
    payload: &[u8],
    options: &SheetOptions,
) -> AppResult<ImportCounters> {
    let rows: Vec<Row> = serde_json::from_slice(payload)?;
    let parse = SheetReader::new(&settings.reference).read(&rows, options)?;
    check_bad_rows(parse.stats.malformed_rows, &settings.imports)?;

    let filter = ReferenceFilter::load(db)?;
    let (facts, dropped) = filter.facts(parse.records);
    let rows_written = db.write_daily_batch(FactSource::Manual, &facts, Some(&run.id))?;

    let missing_references = dropped + parse.stats.unknown_labels;
    Ok(ImportCounters {
        rows_written,
        rows_skipped: parse.stats.malformed_rows + missing_references,
        malformed_rows: parse.stats.malformed_rows,
        missing_references,
    })
}

fn apply_sync(db: &Database, settings: &ImportSettings, run: &ImportRun, payload: &[u8]) -> AppResult<ImportCounters> {
    let parse = SyncPayload::from_slice(payload)?.normalize();
    for reason in &parse.malformed {
        tracing::debug!(run_id = %run.id, reason = %reason, "malformed sync entry");
    }
    check_bad_rows(parse.stats.malformed, settings)?;

    let filter = ReferenceFilter::load(db)?;
    let (facts, dropped_facts) = filter.facts(parse.facts);
    let (attendance, dropped_attendance) = filter.attendance(parse.attendance);

    let mut rows_written = db.write_daily_batch(FactSource::Automated, &facts, Some(&run.id))?;
    rows_written += db.upsert_attendance(&attendance, Some(&run.id))?;

    let missing_references = dropped_facts + dropped_attendance;
    Ok(ImportCounters {
        rows_written,
        rows_skipped: parse.stats.malformed + missing_references,
        malformed_rows: parse.stats.malformed,
        missing_references,
    })
}

fn check_bad_rows(malformed: u64, settings: &ImportSettings) -> AppResult<()> {
    if malformed > u64::from(settings.max_bad_rows) {
        return Err(AppError::Validation(format!(
            "{} malformed rows exceed the limit of {}",
            malformed, settings.max_bad_rows
        )));
    }
    Ok(())
}

/// Known branches and storable metrics, loaded once per import.
struct ReferenceFilter {
    branches: HashSet<String>,
    metrics: HashSet<String>,
    derived: HashSet<String>,
}

impl ReferenceFilter {
    fn load(db: &Database) -> AppResult<Self> {
        let branches = db.list_branches()?.into_iter().map(|branch| branch.code).collect();
        let mut metrics = HashSet::new();
        let mut derived = HashSet::new();
        for metric in db.list_metrics()? {
            if metric.is_derived {
                derived.insert(metric.code);
            } else {
                metrics.insert(metric.code);
            }
        }
        Ok(Self {
            branches,
            metrics,
            derived,
        })
    }

    /// Keeps rows whose branch and metric exist. Returns the kept rows and the dropped count.
    fn facts(&self, rows: Vec<FactRow>) -> (Vec<FactRow>, u64) {
        let mut missing = BTreeSet::new();
        let total = rows.len();
        let kept: Vec<FactRow> = rows
            .into_iter()
            .filter(|row| {
                let problem = if !self.branches.contains(&row.branch_code) {
                    Some("unknown branch")
                } else if self.derived.contains(&row.metric_code) {
                    Some("derived metric")
                } else if !self.metrics.contains(&row.metric_code) {
                    Some("unknown metric")
                } else {
                    None
                };
                if let Some(problem) = problem {
                    missing.insert((row.branch_code.clone(), row.metric_code.clone(), problem));
                }
                problem.is_none()
            })
            .collect();
        for (branch, metric, problem) in &missing {
            let error = AppError::MissingReference(format!("{} for {}/{}", problem, branch, metric));
            tracing::warn!(branch = %branch, metric = %metric, error = %error, "fact rows dropped");
        }
        let dropped = (total - kept.len()) as u64;
        (kept, dropped)
    }

    fn attendance(&self, records: Vec<AttendanceRecord>) -> (Vec<AttendanceRecord>, u64) {
        let total = records.len();
        let (kept, dropped): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| self.branches.contains(&record.branch_code));
        let unknown: BTreeSet<&str> = dropped.iter().map(|record| record.branch_code.as_str()).collect();
        for branch in unknown {
            let error = AppError::MissingReference(format!("unknown branch {}", branch));
            tracing::warn!(branch, error = %error, "attendance records dropped");
        }
        let dropped = (total - kept.len()) as u64;
        (kept, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::{begin, catch_panic, content_hash, finish, import};
    use crate::config::EngineSettings;
    use crate::db::test_support;
    use crate::errors::AppError;
    use crate::models::{FactSource, ImportSource, ImportStatus};
    use crate::sources::sheet::SheetOptions;
    use chrono::NaiveDate;

    const SHEET: &str = r#"[
        ["B1", "Статья", "2025-03-03", "2025-03-04"],
        ["B1", null, null, null],
        [null, "Визиты", 12, "1 000"],
        [null, "Чеки", "n/a", 4],
        ["B7", null, null, null],
        [null, "Визиты", 3, 3]
    ]"#;

    fn settings() -> EngineSettings {
        EngineSettings {
            reference: test_support::reference(),
            ..EngineSettings::default()
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).expect("date")
    }

    #[test]
    fn hash_is_stable_hex() {
        assert_eq!(content_hash(b"abc").len(), 64);
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }

    #[test]
    fn sheet_import_writes_manual_facts_and_counts_skips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let settings = settings();

        let outcome = import(
            &db,
            &settings,
            ImportSource::ManualSheet,
            "march.json",
            SHEET.as_bytes(),
            &SheetOptions::default(),
        )
        .expect("import");
        assert_eq!(outcome.run.status, ImportStatus::Success);
        assert_eq!(outcome.counters.rows_written, 3);
        assert_eq!(outcome.counters.malformed_rows, 1);
        assert_eq!(outcome.counters.missing_references, 2);
        assert_eq!(outcome.run.rows_skipped, 3);

        let fact = db
            .get_daily_fact(FactSource::Manual, "B1", "visits", date(4))
            .expect("get")
            .expect("fact");
        assert_eq!(fact.value, 1000.0);
        assert_eq!(fact.import_run_id.as_deref(), Some(outcome.run.id.as_str()));

        let again = import(
            &db,
            &settings,
            ImportSource::ManualSheet,
            "march-copy.json",
            SHEET.as_bytes(),
            &SheetOptions::default(),
        )
        .expect_err("duplicate");
        assert!(matches!(again, AppError::DuplicateImport { .. }));
    }

    #[test]
    fn too_many_bad_rows_fail_the_run_before_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let mut settings = settings();
        settings.imports.max_bad_rows = 0;

        let error = import(
            &db,
            &settings,
            ImportSource::ManualSheet,
            "march.json",
            SHEET.as_bytes(),
            &SheetOptions::default(),
        )
        .expect_err("threshold");
        assert!(matches!(error, AppError::Validation(_)));

        let runs = db.list_import_runs(Some("manual_sheet"), 10).expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ImportStatus::Failed);
        assert!(runs[0].error.as_deref().is_some_and(|text| text.starts_with("VALIDATION")));
        assert!(db
            .get_daily_fact(FactSource::Manual, "B1", "visits", date(3))
            .expect("get")
            .is_none());

        // Failed content may be imported again once the limit allows it.
        settings.imports.max_bad_rows = 5;
        import(
            &db,
            &settings,
            ImportSource::ManualSheet,
            "march.json",
            SHEET.as_bytes(),
            &SheetOptions::default(),
        )
        .expect("retry");
    }

    #[test]
    fn sync_import_writes_automated_facts_and_attendance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let payload = r#"{
            "bookings": [
                {"id": 1, "staffId": "S1", "branchCode": "B1", "datetime": "2025-03-03T10:00:00",
                 "seanceLength": 3600, "attendance": 1},
                {"id": 2, "staffId": "S1", "branchCode": "ZZ", "datetime": "2025-03-03T11:00:00",
                 "seanceLength": 3600, "attendance": 1}
            ],
            "facts": [
                {"branchCode": "B1", "metricCode": "visits", "date": "2025-03-03", "value": 7},
                {"branchCode": "B1", "metricCode": "avg_check", "date": "2025-03-03", "value": 7}
            ]
        }"#;

        let outcome = import(
            &db,
            &settings(),
            ImportSource::BookingSync,
            "sync-2025-03-03",
            payload.as_bytes(),
            &SheetOptions::default(),
        )
        .expect("import");
        assert_eq!(outcome.counters.rows_written, 2);
        assert_eq!(outcome.counters.missing_references, 2);

        let fact = db
            .get_daily_fact(FactSource::Automated, "B1", "visits", date(3))
            .expect("get")
            .expect("fact");
        assert_eq!(fact.value, 7.0);
        let start = date(3).and_hms_opt(0, 0, 0).expect("start");
        let end = date(4).and_hms_opt(0, 0, 0).expect("end");
        assert_eq!(db.attendance_overlapping("B1", start, end).expect("records").len(), 1);
    }

    #[test]
    fn unreadable_payload_fails_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let error = import(
            &db,
            &settings(),
            ImportSource::BookingSync,
            "broken",
            b"{not json",
            &SheetOptions::default(),
        )
        .expect_err("broken");
        assert_eq!(error.code(), "VALIDATION");
        let runs = db.list_import_runs(None, 10).expect("runs");
        assert_eq!(runs[0].status, ImportStatus::Failed);
    }

    #[test]
    fn panicking_reader_fails_the_run_and_frees_the_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let run = begin(&db, ImportSource::BookingSync, "sync-bad", b"payload").expect("begin");
        let run_id = run.id.clone();

        let result = catch_panic(|| -> crate::errors::AppResult<crate::models::ImportCounters> {
            panic!("reader exploded")
        });
        let error = finish(&db, run, ImportSource::BookingSync, result).expect_err("panic");
        assert_eq!(error.code(), "INTERNAL");
        assert!(error.to_string().contains("reader exploded"));

        let closed = db.get_import_run(&run_id).expect("get").expect("run");
        assert_eq!(closed.status, ImportStatus::Failed);
        begin(&db, ImportSource::BookingSync, "sync-next", b"other payload").expect("source is free");
    }
}
