mod attendance;
mod facts;
mod imports;
mod signals;

use crate::config::ReferenceConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{AggregationMethod, Branch, FormulaSpec, MetricDefinition, RosterMember, StaffGroup};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use facts::FactRow;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Reference rows ─────────────────────────────────────────────────────

    /// Upserts branches, metrics and staff rosters. Must run before any fact references them.
    pub fn load_reference(&self, reference: &ReferenceConfig) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for branch in &reference.branches {
            tx.execute(
                "INSERT INTO branches (code, name) VALUES (?1, ?2)
                 ON CONFLICT(code) DO UPDATE SET name = excluded.name",
                params![branch.code, branch.name],
            )?;
        }

        for metric in &reference.metrics {
            let formula_json = metric
                .formula
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO metrics (code, label, unit, group_tag, source_labels_json, is_derived, aggregation, formula_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(code) DO UPDATE SET
                   label = excluded.label,
                   unit = excluded.unit,
                   group_tag = excluded.group_tag,
                   source_labels_json = excluded.source_labels_json,
                   is_derived = excluded.is_derived,
                   aggregation = excluded.aggregation,
                   formula_json = excluded.formula_json",
                params![
                    metric.code,
                    metric.label,
                    metric.unit,
                    metric.group,
                    serde_json::to_string(&metric.source_labels)?,
                    metric.is_derived as i32,
                    metric.aggregation.as_str(),
                    formula_json,
                ],
            )?;
        }

        for group in &reference.staff_groups {
            tx.execute(
                "INSERT INTO staff_groups (branch_code, group_id, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(branch_code, group_id) DO UPDATE SET name = excluded.name",
                params![group.branch_code, group.group_id, group.name],
            )?;
            tx.execute(
                "DELETE FROM staff_roster WHERE branch_code = ?1 AND group_id = ?2",
                params![group.branch_code, group.group_id],
            )?;
            for member in &group.members {
                tx.execute(
                    "INSERT INTO staff_roster (branch_code, group_id, staff_id, active_from, active_until)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        group.branch_code,
                        group.group_id,
                        member.staff_id,
                        member.from.map(format_date),
                        member.until.map(format_date),
                    ],
                )?;
            }
        }

        tx.commit()?;
        tracing::info!(
            branches = reference.branches.len(),
            metrics = reference.metrics.len(),
            staff_groups = reference.staff_groups.len(),
            "reference rows loaded"
        );
        Ok(())
    }

    pub fn list_branches(&self) -> AppResult<Vec<Branch>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT code, name FROM branches ORDER BY code ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Branch {
                    code: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn branch_exists(&self, code: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM branches WHERE code = ?1", [code], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn get_metric(&self, code: &str) -> AppResult<Option<MetricDefinition>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT code, label, unit, group_tag, source_labels_json, is_derived, aggregation, formula_json
             FROM metrics WHERE code = ?1",
            [code],
            parse_metric_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_metrics(&self) -> AppResult<Vec<MetricDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT code, label, unit, group_tag, source_labels_json, is_derived, aggregation, formula_json
             FROM metrics ORDER BY code ASC",
        )?;
        let rows = stmt
            .query_map([], parse_metric_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_staff_group(&self, branch_code: &str, group_id: &str) -> AppResult<Option<StaffGroup>> {
        let conn = self.lock()?;
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM staff_groups WHERE branch_code = ?1 AND group_id = ?2",
                params![branch_code, group_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT staff_id, active_from, active_until FROM staff_roster
             WHERE branch_code = ?1 AND group_id = ?2 ORDER BY staff_id ASC",
        )?;
        let members = stmt
            .query_map(params![branch_code, group_id], |row| {
                Ok(RosterMember {
                    staff_id: row.get(0)?,
                    from: row.get::<_, Option<String>>(1)?.map(|raw| parse_date(&raw)).transpose()?,
                    until: row.get::<_, Option<String>>(2)?.map(|raw| parse_date(&raw)).transpose()?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StaffGroup {
            branch_code: branch_code.to_string(),
            group_id: group_id.to_string(),
            name,
            members,
        }))
    }

    // ─── Startup recovery ───────────────────────────────────────────────────

    /// Fails runs and jobs left `running` by a process that exited mid-import.
    pub fn recover_interrupted_imports(&self) -> AppResult<u64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let runs = conn.execute(
            "UPDATE import_runs
             SET status = 'failed', finished_at = ?1, error = 'INTERNAL: interrupted by restart'
             WHERE status = 'running'",
            [now.as_str()],
        )?;
        conn.execute(
            "UPDATE import_jobs
             SET state = 'failed', finished_at = ?1, last_error = 'INTERNAL: interrupted by restart'
             WHERE state IN ('queued', 'running')",
            [now.as_str()],
        )?;
        if runs > 0 {
            tracing::warn!(runs, "marked interrupted import runs as failed");
        }
        Ok(runs as u64)
    }
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricDefinition> {
    let labels_raw: String = row.get(4)?;
    let formula: Option<FormulaSpec> = row
        .get::<_, Option<String>>(7)?
        .map(|raw| serde_json::from_str(&raw).map_err(|error| conversion_error(error.to_string())))
        .transpose()?;
    Ok(MetricDefinition {
        code: row.get(0)?,
        label: row.get(1)?,
        unit: row.get(2)?,
        group: row.get(3)?,
        source_labels: serde_json::from_str::<Vec<String>>(&labels_raw)
            .map_err(|error| conversion_error(error.to_string()))?,
        is_derived: row.get::<_, i32>(5)? != 0,
        aggregation: parse_aggregation(&row.get::<_, String>(6)?),
        formula,
    })
}

fn parse_aggregation(raw: &str) -> AggregationMethod {
    match raw {
        "average" => AggregationMethod::Average,
        "last" => AggregationMethod::Last,
        _ => AggregationMethod::Sum,
    }
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn format_datetime(at: NaiveDateTime) -> String {
    at.format(DATETIME_FORMAT).to_string()
}

pub(crate) fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| conversion_error(error.to_string()))
}

pub(crate) fn parse_datetime(raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT).map_err(|error| conversion_error(error.to_string()))
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use crate::config::ReferenceConfig;
    use crate::models::{AggregationMethod, Branch, FormulaKind, FormulaSpec, MetricDefinition, RosterMember, StaffGroup};

    pub fn metric(code: &str, aggregation: AggregationMethod) -> MetricDefinition {
        MetricDefinition {
            code: code.to_string(),
            label: code.to_string(),
            unit: String::new(),
            group: String::new(),
            source_labels: Vec::new(),
            is_derived: false,
            aggregation,
            formula: None,
        }
    }

    pub fn derived(code: &str, kind: FormulaKind, inputs: &[&str], aggregation: AggregationMethod) -> MetricDefinition {
        MetricDefinition {
            is_derived: true,
            formula: Some(FormulaSpec {
                kind,
                inputs: inputs.iter().map(|input| input.to_string()).collect(),
            }),
            ..metric(code, aggregation)
        }
    }

    pub fn reference() -> ReferenceConfig {
        let mut visits = metric("visits", AggregationMethod::Sum);
        visits.source_labels = vec!["Визиты".to_string()];
        let mut revenue = metric("coffee_revenue_total", AggregationMethod::Sum);
        revenue.source_labels = vec!["Кофейня".to_string()];
        let mut checks = metric("coffee_checks", AggregationMethod::Sum);
        checks.source_labels = vec!["Чеки".to_string()];
        ReferenceConfig {
            branches: vec![
                Branch {
                    code: "B1".to_string(),
                    name: "Branch One".to_string(),
                },
                Branch {
                    code: "B2".to_string(),
                    name: "Branch Two".to_string(),
                },
            ],
            metrics: vec![
                visits,
                revenue,
                checks,
                metric("load_percent", AggregationMethod::Average),
                metric("cash_balance_end_day", AggregationMethod::Last),
                metric("revenue_cash", AggregationMethod::Sum),
                metric("deposit_total", AggregationMethod::Sum),
                metric("withdrawals_total", AggregationMethod::Sum),
                derived(
                    "avg_check",
                    FormulaKind::Ratio,
                    &["coffee_revenue_total", "coffee_checks"],
                    AggregationMethod::Average,
                ),
            ],
            staff_groups: vec![StaffGroup {
                branch_code: "B1".to_string(),
                group_id: "hair".to_string(),
                name: "Hairdressers".to_string(),
                members: vec![
                    RosterMember {
                        staff_id: "S1".to_string(),
                        from: None,
                        until: None,
                    },
                    RosterMember {
                        staff_id: "S2".to_string(),
                        from: None,
                        until: None,
                    },
                ],
            }],
            ..ReferenceConfig::default()
        }
    }

    pub fn database(dir: &tempfile::TempDir) -> Database {
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        db.load_reference(&reference()).expect("reference");
        db
    }
}
