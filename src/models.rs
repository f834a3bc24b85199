use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Present values of one metric keyed by date. A missing key means "absent".
pub type DailySeries = BTreeMap<NaiveDate, f64>;

// ─── Reference ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMethod {
    #[default]
    Sum,
    Average,
    Last,
}

impl AggregationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Last => "last",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormulaKind {
    /// inputs[0] / inputs[1]
    Ratio,
    /// inputs[0] / (inputs[0] + inputs[1])
    Share,
    /// Sum of every input.
    Sum,
    /// inputs[0] minus every following input.
    Difference,
}

impl FormulaKind {
    /// Exact input count, or `None` when any non-zero count is accepted.
    pub fn arity(self) -> Option<usize> {
        match self {
            Self::Ratio | Self::Share => Some(2),
            Self::Sum | Self::Difference => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ratio => "ratio",
            Self::Share => "share",
            Self::Sum => "sum",
            Self::Difference => "difference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaSpec {
    pub kind: FormulaKind,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub code: String,
    pub label: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub group: String,
    /// Spreadsheet article labels that resolve to this metric.
    #[serde(default)]
    pub source_labels: Vec<String>,
    #[serde(default)]
    pub is_derived: bool,
    #[serde(default)]
    pub aggregation: AggregationMethod,
    #[serde(default)]
    pub formula: Option<FormulaSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterMember {
    pub staff_id: String,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub until: Option<NaiveDate>,
}

impl RosterMember {
    pub fn active_on(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| from <= date) && self.until.map_or(true, |until| date <= until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffGroup {
    pub branch_code: String,
    pub group_id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<RosterMember>,
}

// ─── Facts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactSource {
    Manual,
    Automated,
}

impl FactSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automated => "automated",
        }
    }

    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Manual => "manual_daily_facts",
            Self::Automated => "automated_daily_facts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyFact {
    pub branch_code: String,
    pub metric_code: String,
    pub date: NaiveDate,
    pub value: f64,
    pub source: FactSource,
    pub updated_at: DateTime<Utc>,
    pub import_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedFact {
    pub date: NaiveDate,
    pub value: f64,
    pub source: FactSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFact {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanValue {
    pub branch_code: String,
    pub metric_code: String,
    pub month_start: NaiveDate,
    pub value: f64,
    pub updated_at: DateTime<Utc>,
}

// ─── Imports ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportSource {
    ManualSheet,
    BookingSync,
}

impl ImportSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManualSheet => "manual_sheet",
            Self::BookingSync => "booking_sync",
        }
    }

    pub fn fact_source(self) -> FactSource {
        match self {
            Self::ManualSheet => FactSource::Manual,
            Self::BookingSync => FactSource::Automated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStatus {
    Running,
    Success,
    Failed,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub id: String,
    pub source: String,
    pub file_id: String,
    pub content_hash: String,
    pub status: ImportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub rows_written: u64,
    pub rows_skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounters {
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub malformed_rows: u64,
    pub missing_references: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub run: ImportRun,
    pub counters: ImportCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub source: ImportSource,
    pub file_id: String,
    pub state: JobState,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub timeout_ms: u64,
    pub last_error: Option<String>,
    pub import_run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ─── Aggregates & Signals ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeriodType {
    Week,
    Month,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

/// Inclusive date range of one week (Monday–Sunday) or one calendar month, or a leading part of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub kind: PeriodType,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub branch_code: String,
    pub metric_code: String,
    pub period: Period,
    pub method: AggregationMethod,
    pub value: Option<f64>,
    pub present_days: u32,
    pub total_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekTotal {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthReport {
    pub branch_code: String,
    pub metric_code: String,
    pub month_start: NaiveDate,
    pub weeks: Vec<WeekTotal>,
    pub month_value: Option<f64>,
    pub filled_days: u32,
    pub days_in_month: u32,
    pub forecast: Option<f64>,
    pub forecast_pct: Option<f64>,
    pub plan: Option<f64>,
    pub plan_pct: Option<f64>,
    pub plan_delta: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    PeriodOverPeriod,
    PlanVsActual,
    /// Closing cash balance disagrees with the day's cash movements.
    CashControl,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeriodOverPeriod => "period-over-period",
            Self::PlanVsActual => "plan-vs-actual",
            Self::CashControl => "cash-control",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalStatus {
    Ok,
    Warning,
    Critical,
}

impl SignalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub branch_code: String,
    pub metric_code: Option<String>,
    pub signal_type: SignalType,
    pub period: Period,
    pub delta_percent: Option<f64>,
    pub status: SignalStatus,
    pub needs_review: bool,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSignalsFilters {
    pub period_type: Option<PeriodType>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub metric_code: Option<String>,
}

// ─── Occupancy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceStatus {
    NoShow,
    Pending,
    Visited,
    Confirmed,
}

impl AttendanceStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::NoShow),
            0 => Some(Self::Pending),
            1 => Some(Self::Visited),
            2 => Some(Self::Confirmed),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::NoShow => -1,
            Self::Pending => 0,
            Self::Visited => 1,
            Self::Confirmed => 2,
        }
    }

    pub fn counts_as_busy(self) -> bool {
        matches!(self, Self::Visited | Self::Confirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub branch_code: String,
    pub record_id: String,
    pub staff_id: String,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyCell {
    pub hour: u32,
    pub load_pct: f64,
    pub busy_count: u32,
    pub staff_total: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrayFlags {
    pub early: bool,
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRow {
    pub date: NaiveDate,
    /// ISO weekday, Monday = 1.
    pub dow: u32,
    pub cells: Vec<OccupancyCell>,
    pub day_avg: f64,
    pub gray: GrayFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekGroup {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub days: Vec<DayRow>,
    pub week_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthGroup {
    pub branch_code: String,
    pub group_id: String,
    pub month_start: NaiveDate,
    pub hours: Vec<u32>,
    pub weeks: Vec<WeekGroup>,
    pub month_avg: f64,
}
