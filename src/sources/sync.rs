//! Booking-system sync payload: attendance records plus automated daily facts.

use crate::db::FactRow;
use crate::errors::AppResult;
use crate::models::{AttendanceRecord, AttendanceStatus};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const LOCAL_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"];

/// Identifiers arrive as numbers from the booking system and as strings from exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{}", value),
            Self::Text(value) => f.write_str(value.trim()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub id: Option<ExternalId>,
    pub staff_id: Option<ExternalId>,
    pub branch_code: Option<String>,
    #[serde(alias = "date")]
    pub datetime: Option<String>,
    /// Duration in seconds.
    #[serde(alias = "length")]
    pub seance_length: Option<i64>,
    pub attendance: Option<i64>,
    pub visit_attendance: Option<i64>,
    pub last_change_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedFact {
    pub branch_code: Option<String>,
    pub metric_code: Option<String>,
    pub date: Option<String>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub bookings: Vec<BookingRecord>,
    #[serde(default)]
    pub facts: Vec<AutomatedFact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub bookings: u64,
    pub facts: u64,
    pub malformed: u64,
    pub superseded: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncParse {
    pub attendance: Vec<AttendanceRecord>,
    pub facts: Vec<FactRow>,
    pub malformed: Vec<String>,
    pub stats: SyncStats,
}

impl SyncPayload {
    pub fn from_slice(bytes: &[u8]) -> AppResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Normalizes the payload. Bad entries are collected, not fatal.
    pub fn normalize(&self) -> SyncParse {
        let mut parse = SyncParse::default();
        let mut latest: HashMap<(String, String), (usize, Option<NaiveDateTime>)> = HashMap::new();

        for (index, booking) in self.bookings.iter().enumerate() {
            match normalize_booking(booking) {
                Ok(record) => {
                    let changed = booking.last_change_date.as_deref().and_then(parse_local_datetime);
                    let key = (record.branch_code.clone(), record.record_id.clone());
                    // Later change date wins; ties go to the later entry.
                    match latest.get(&key).copied() {
                        Some((_, seen)) if changed < seen => parse.stats.superseded += 1,
                        Some((slot, _)) => {
                            parse.attendance[slot] = record;
                            latest.insert(key, (slot, changed));
                            parse.stats.superseded += 1;
                        }
                        None => {
                            latest.insert(key, (parse.attendance.len(), changed));
                            parse.attendance.push(record);
                        }
                    }
                }
                Err(reason) => parse.malformed.push(format!("booking #{}: {}", index, reason)),
            }
        }

        for (index, fact) in self.facts.iter().enumerate() {
            match normalize_fact(fact) {
                Ok(row) => parse.facts.push(row),
                Err(reason) => parse.malformed.push(format!("fact #{}: {}", index, reason)),
            }
        }

        parse.stats.bookings = parse.attendance.len() as u64;
        parse.stats.facts = parse.facts.len() as u64;
        parse.stats.malformed = parse.malformed.len() as u64;
        parse
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing {}", field))
}

fn normalize_booking(booking: &BookingRecord) -> Result<AttendanceRecord, String> {
    let record_id = booking.id.as_ref().map(ToString::to_string);
    let record_id = required(record_id.as_deref(), "id")?.to_string();
    let staff_id = booking.staff_id.as_ref().map(ToString::to_string);
    let staff_id = required(staff_id.as_deref(), "staffId")?.to_string();
    let branch_code = required(booking.branch_code.as_deref(), "branchCode")?.to_string();

    let code = booking
        .attendance
        .or(booking.visit_attendance)
        .ok_or_else(|| "missing attendance".to_string())?;
    let status = AttendanceStatus::from_code(code).ok_or_else(|| format!("unknown attendance code {}", code))?;

    let raw_start = required(booking.datetime.as_deref(), "datetime")?;
    let start_at = parse_local_datetime(raw_start).ok_or_else(|| format!("bad datetime {:?}", raw_start))?;
    let seconds = booking.seance_length.unwrap_or(0);
    if seconds < 0 {
        return Err(format!("negative duration {}", seconds));
    }
    let end_at = TimeDelta::try_seconds(seconds)
        .and_then(|length| start_at.checked_add_signed(length))
        .ok_or_else(|| format!("duration out of range {}", seconds))?;

    Ok(AttendanceRecord {
        branch_code,
        record_id,
        staff_id,
        start_at,
        end_at,
        status,
    })
}

fn normalize_fact(fact: &AutomatedFact) -> Result<FactRow, String> {
    let branch_code = required(fact.branch_code.as_deref(), "branchCode")?.to_string();
    let metric_code = required(fact.metric_code.as_deref(), "metricCode")?.to_string();
    let raw_date = required(fact.date.as_deref(), "date")?;
    let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d").map_err(|_| format!("bad date {:?}", raw_date))?;
    let value = fact
        .value
        .filter(|value| value.is_finite())
        .ok_or_else(|| "missing value".to_string())?;
    Ok(FactRow {
        branch_code,
        metric_code,
        date,
        value,
    })
}

/// Wall-clock time at the branch. Offsets are dropped, not converted.
pub fn parse_local_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.naive_local());
    }
    LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}
