use super::{conversion_error, format_date, parse_date, parse_time, Database};
use crate::errors::AppResult;
use crate::models::{ListSignalsFilters, Period, PeriodType, Signal, SignalStatus, SignalType};
use rusqlite::params;

impl Database {
    /// Signals are append-only; nothing updates or deletes a stored row.
    pub fn insert_signal(&self, signal: &Signal) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO signals (
               id, branch_code, metric_code, signal_type, period_type, period_start, period_end,
               delta_percent, status, needs_review, details_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                signal.id,
                signal.branch_code,
                signal.metric_code,
                signal.signal_type.as_str(),
                signal.period.kind.as_str(),
                format_date(signal.period.start),
                format_date(signal.period.end),
                signal.delta_percent,
                signal.status.as_str(),
                signal.needs_review as i32,
                serde_json::to_string(&signal.details)?,
                signal.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Signals of a branch whose period overlaps `[from, to]`, oldest first.
    pub fn list_signals(&self, branch_code: &str, filters: &ListSignalsFilters) -> AppResult<Vec<Signal>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, branch_code, metric_code, signal_type, period_type, period_start, period_end,
                    delta_percent, status, needs_review, details_json, created_at
             FROM signals
             WHERE branch_code = ?1
               AND (?2 IS NULL OR period_type = ?2)
               AND (?3 IS NULL OR period_end >= ?3)
               AND (?4 IS NULL OR period_start <= ?4)
               AND (?5 IS NULL OR metric_code = ?5)
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    branch_code,
                    filters.period_type.map(PeriodType::as_str),
                    filters.from.map(format_date),
                    filters.to.map(format_date),
                    filters.metric_code,
                ],
                parse_signal_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_signal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signal> {
    let details_raw: String = row.get(10)?;
    Ok(Signal {
        id: row.get(0)?,
        branch_code: row.get(1)?,
        metric_code: row.get(2)?,
        signal_type: match row.get::<_, String>(3)?.as_str() {
            "plan-vs-actual" => SignalType::PlanVsActual,
            "cash-control" => SignalType::CashControl,
            _ => SignalType::PeriodOverPeriod,
        },
        period: Period {
            kind: match row.get::<_, String>(4)?.as_str() {
                "month" => PeriodType::Month,
                _ => PeriodType::Week,
            },
            start: parse_date(&row.get::<_, String>(5)?)?,
            end: parse_date(&row.get::<_, String>(6)?)?,
        },
        delta_percent: row.get(7)?,
        status: match row.get::<_, String>(8)?.as_str() {
            "critical" => SignalStatus::Critical,
            "warning" => SignalStatus::Warning,
            _ => SignalStatus::Ok,
        },
        needs_review: row.get::<_, i32>(9)? != 0,
        details: serde_json::from_str(&details_raw).map_err(|error| conversion_error(error.to_string()))?,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}
