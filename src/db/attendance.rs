use super::{format_datetime, parse_datetime, Database};
use crate::errors::AppResult;
use crate::models::{AttendanceRecord, AttendanceStatus};
use chrono::{NaiveDateTime, Utc};
use rusqlite::params;

impl Database {
    /// Upserts records by (branch, record id). Returns the number of rows written.
    pub fn upsert_attendance(&self, records: &[AttendanceRecord], import_run_id: Option<&str>) -> AppResult<u64> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO attendance_records (branch_code, record_id, staff_id, start_at, end_at, status, updated_at, import_run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(branch_code, record_id) DO UPDATE SET
                   staff_id = excluded.staff_id,
                   start_at = excluded.start_at,
                   end_at = excluded.end_at,
                   status = excluded.status,
                   updated_at = excluded.updated_at,
                   import_run_id = excluded.import_run_id",
            )?;
            for record in records {
                stmt.execute(params![
                    record.branch_code,
                    record.record_id,
                    record.staff_id,
                    format_datetime(record.start_at),
                    format_datetime(record.end_at),
                    record.status.code(),
                    now,
                    import_run_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len() as u64)
    }

    /// Records of a branch whose interval overlaps `[from, to)`.
    pub fn attendance_overlapping(
        &self,
        branch_code: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> AppResult<Vec<AttendanceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT branch_code, record_id, staff_id, start_at, end_at, status
             FROM attendance_records
             WHERE branch_code = ?1 AND start_at < ?3 AND end_at > ?2
             ORDER BY start_at ASC, record_id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![branch_code, format_datetime(from), format_datetime(to)],
                |row| {
                    let code: i64 = row.get(5)?;
                    let status = AttendanceStatus::from_code(code).ok_or_else(|| {
                        rusqlite::Error::IntegralValueOutOfRange(5, code)
                    })?;
                    Ok(AttendanceRecord {
                        branch_code: row.get(0)?,
                        record_id: row.get(1)?,
                        staff_id: row.get(2)?,
                        start_at: parse_datetime(&row.get::<_, String>(3)?)?,
                        end_at: parse_datetime(&row.get::<_, String>(4)?)?,
                        status,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
