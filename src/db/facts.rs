use super::{format_date, parse_date, parse_time, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{DailyFact, DailySeries, FactSource, PlanValue};
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

/// One normalized (branch, metric, date, value) tuple bound for a fact table.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub branch_code: String,
    pub metric_code: String,
    pub date: NaiveDate,
    pub value: f64,
}

impl Database {
    /// Overwrites one fact in the table of `source` and stamps `updated_at`.
    pub fn upsert_daily(
        &self,
        source: FactSource,
        branch_code: &str,
        metric_code: &str,
        date: NaiveDate,
        value: f64,
    ) -> AppResult<DailyFact> {
        if !value.is_finite() {
            return Err(AppError::Validation(format!("value for {} on {} is not finite", metric_code, date)));
        }
        if !self.branch_exists(branch_code)? {
            return Err(AppError::MissingReference(format!("unknown branch {}", branch_code)));
        }
        let metric = self
            .get_metric(metric_code)?
            .ok_or_else(|| AppError::MissingReference(format!("unknown metric {}", metric_code)))?;
        if metric.is_derived {
            return Err(AppError::Validation(format!("metric {} is derived and cannot be stored", metric_code)));
        }

        let row = FactRow {
            branch_code: branch_code.to_string(),
            metric_code: metric_code.to_string(),
            date,
            value,
        };
        self.write_daily_batch(source, std::slice::from_ref(&row), None)?;
        Ok(DailyFact {
            branch_code: row.branch_code,
            metric_code: row.metric_code,
            date,
            value,
            source,
            updated_at: Utc::now(),
            import_run_id: None,
        })
    }

    /// Writes pre-validated rows in one transaction. Later rows for the same key win.
    pub fn write_daily_batch(&self, source: FactSource, rows: &[FactRow], import_run_id: Option<&str>) -> AppResult<u64> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (branch_code, metric_code, date, value, source_tag, updated_at, import_run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(branch_code, metric_code, date) DO UPDATE SET
                   value = excluded.value,
                   source_tag = excluded.source_tag,
                   updated_at = excluded.updated_at,
                   import_run_id = excluded.import_run_id",
                source.table()
            ))?;
            for row in rows {
                stmt.execute(params![
                    row.branch_code,
                    row.metric_code,
                    format_date(row.date),
                    row.value,
                    source.as_str(),
                    now,
                    import_run_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    /// Present values of one source in `[from, to]`.
    pub fn read_source_facts(
        &self,
        source: FactSource,
        branch_code: &str,
        metric_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<DailySeries> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT date, value FROM {}
             WHERE branch_code = ?1 AND metric_code = ?2 AND date >= ?3 AND date <= ?4",
            source.table()
        ))?;
        let rows = stmt
            .query_map(
                params![branch_code, metric_code, format_date(from), format_date(to)],
                |row| Ok((parse_date(&row.get::<_, String>(0)?)?, row.get::<_, f64>(1)?)),
            )?
            .collect::<Result<DailySeries, _>>()?;
        Ok(rows)
    }

    pub fn get_daily_fact(
        &self,
        source: FactSource,
        branch_code: &str,
        metric_code: &str,
        date: NaiveDate,
    ) -> AppResult<Option<DailyFact>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT branch_code, metric_code, date, value, updated_at, import_run_id FROM {}
                 WHERE branch_code = ?1 AND metric_code = ?2 AND date = ?3",
                source.table()
            ),
            params![branch_code, metric_code, format_date(date)],
            |row| {
                Ok(DailyFact {
                    branch_code: row.get(0)?,
                    metric_code: row.get(1)?,
                    date: parse_date(&row.get::<_, String>(2)?)?,
                    value: row.get(3)?,
                    source,
                    updated_at: parse_time(&row.get::<_, String>(4)?)?,
                    import_run_id: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    // ─── Plans ──────────────────────────────────────────────────────────────

    pub fn upsert_plan(&self, branch_code: &str, metric_code: &str, month_start: NaiveDate, value: f64) -> AppResult<PlanValue> {
        if month_start.day() != 1 {
            return Err(AppError::Validation(format!("plan month {} must be the first day of a month", month_start)));
        }
        if !value.is_finite() {
            return Err(AppError::Validation("plan value is not finite".to_string()));
        }
        if !self.branch_exists(branch_code)? {
            return Err(AppError::MissingReference(format!("unknown branch {}", branch_code)));
        }
        if self.get_metric(metric_code)?.is_none() {
            return Err(AppError::MissingReference(format!("unknown metric {}", metric_code)));
        }

        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO plans_monthly (branch_code, metric_code, month_start, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(branch_code, metric_code, month_start) DO UPDATE SET
               value = excluded.value, updated_at = excluded.updated_at",
            params![branch_code, metric_code, format_date(month_start), value, now.to_rfc3339()],
        )?;
        Ok(PlanValue {
            branch_code: branch_code.to_string(),
            metric_code: metric_code.to_string(),
            month_start,
            value,
            updated_at: now,
        })
    }

    pub fn get_plan(&self, branch_code: &str, metric_code: &str, month_start: NaiveDate) -> AppResult<Option<PlanValue>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value, updated_at FROM plans_monthly
             WHERE branch_code = ?1 AND metric_code = ?2 AND month_start = ?3",
            params![branch_code, metric_code, format_date(month_start)],
            |row| {
                Ok(PlanValue {
                    branch_code: branch_code.to_string(),
                    metric_code: metric_code.to_string(),
                    month_start,
                    value: row.get(0)?,
                    updated_at: parse_time(&row.get::<_, String>(1)?)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }
}
