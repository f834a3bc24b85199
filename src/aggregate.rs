use crate::db::Database;
use crate::derived;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Aggregate, AggregationMethod, DailySeries, MetricDefinition, MonthReport, Period, PeriodType, WeekTotal,
};
use chrono::{Datelike, Days, Duration, Months, NaiveDate};

impl Period {
    /// The Monday–Sunday week that contains `date`.
    pub fn week_containing(date: NaiveDate) -> Self {
        let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            kind: PeriodType::Week,
            start,
            end: start + Duration::days(6),
        }
    }

    pub fn month_containing(date: NaiveDate) -> Self {
        let start = date.with_day(1).unwrap_or(date);
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(start);
        Self {
            kind: PeriodType::Month,
            start,
            end,
        }
    }

    pub fn containing(kind: PeriodType, date: NaiveDate) -> Self {
        match kind {
            PeriodType::Week => Self::week_containing(date),
            PeriodType::Month => Self::month_containing(date),
        }
    }

    /// The period of the same kind immediately before this one.
    pub fn previous(&self) -> Self {
        Self::containing(self.kind, self.start - Duration::days(1))
    }

    /// The first `days` days of this period, clipped to its end.
    pub fn head(&self, days: u32) -> Self {
        let end = self
            .start
            .checked_add_days(Days::new(u64::from(days.max(1) - 1)))
            .map_or(self.end, |end| end.min(self.end));
        Self { end, ..*self }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn total_days(&self) -> u32 {
        ((self.end - self.start).num_days() + 1).max(0) as u32
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |date| *date <= end)
    }
}

/// Reduces the values of `series` that fall inside `[from, to]`. No present value means no result.
pub fn reduce(method: AggregationMethod, series: &DailySeries, from: NaiveDate, to: NaiveDate) -> Option<f64> {
    let mut window = series.range(from..=to).peekable();
    window.peek()?;
    match method {
        AggregationMethod::Sum => Some(window.map(|(_, value)| value).sum()),
        AggregationMethod::Average => {
            let (total, count) = window.fold((0.0, 0u32), |(total, count), (_, value)| (total + value, count + 1));
            Some(total / f64::from(count))
        }
        AggregationMethod::Last => window.last().map(|(_, value)| *value),
    }
}

fn require_metric(db: &Database, branch_code: &str, metric_code: &str) -> AppResult<MetricDefinition> {
    if !db.branch_exists(branch_code)? {
        return Err(AppError::MissingReference(format!("unknown branch {}", branch_code)));
    }
    db.get_metric(metric_code)?
        .ok_or_else(|| AppError::MissingReference(format!("unknown metric {}", metric_code)))
}

/// Recomputed from current daily facts on every call; nothing is persisted.
pub fn aggregate(db: &Database, branch_code: &str, metric_code: &str, period: Period) -> AppResult<Aggregate> {
    if period.start > period.end {
        return Err(AppError::Validation(format!("period start {} is after end {}", period.start, period.end)));
    }
    let metric = require_metric(db, branch_code, metric_code)?;
    let series = derived::metric_series(db, &metric, branch_code, period.start, period.end)?;

    Ok(Aggregate {
        branch_code: branch_code.to_string(),
        metric_code: metric_code.to_string(),
        period,
        method: metric.aggregation,
        value: reduce(metric.aggregation, &series, period.start, period.end),
        present_days: series.range(period.start..=period.end).count() as u32,
        total_days: period.total_days(),
    })
}

/// Windows for a prior-period comparison: `(current, baseline)`.
///
/// Both start on their period's first day and span the same number of days. The
/// current side runs up to its last filled day, and neither side outgrows the
/// previous period. A month filled through the 15th compares against the 1st to
/// the 15th of the month before.
pub fn comparison_windows(period: Period, last_filled: Option<NaiveDate>) -> (Period, Period) {
    let previous = period.previous();
    let filled = last_filled
        .filter(|date| period.contains(*date))
        .map_or(period.total_days(), |date| ((date - period.start).num_days() + 1) as u32);
    let days = filled.min(previous.total_days());
    (period.head(days), previous.head(days))
}

/// The last day inside `period` with a value for the metric.
pub fn last_filled(db: &Database, branch_code: &str, metric_code: &str, period: Period) -> AppResult<Option<NaiveDate>> {
    let metric = require_metric(db, branch_code, metric_code)?;
    let series = derived::metric_series(db, &metric, branch_code, period.start, period.end)?;
    Ok(series.range(period.start..=period.end).next_back().map(|(date, _)| *date))
}

/// Week slices of a month: each ends on a Sunday or on the month's last day.
pub fn month_weeks(month: Period) -> Vec<(NaiveDate, NaiveDate)> {
    let mut weeks = Vec::new();
    let mut start = month.start;
    while start <= month.end {
        let end = Period::week_containing(start).end.min(month.end);
        weeks.push((start, end));
        start = end + Duration::days(1);
    }
    weeks
}

pub fn month_report(db: &Database, branch_code: &str, metric_code: &str, month_start: NaiveDate) -> AppResult<MonthReport> {
    if month_start.day() != 1 {
        return Err(AppError::Validation(format!("month {} must start on day 1", month_start)));
    }
    let metric = require_metric(db, branch_code, metric_code)?;
    let month = Period::month_containing(month_start);
    let series = derived::metric_series(db, &metric, branch_code, month.start, month.end)?;
    let method = metric.aggregation;

    let weeks = month_weeks(month)
        .into_iter()
        .map(|(start, end)| WeekTotal {
            start,
            end,
            value: reduce(method, &series, start, end),
        })
        .collect();

    let month_value = reduce(method, &series, month.start, month.end);
    let filled_days = series.range(month.start..=month.end).count() as u32;
    let days_in_month = month.total_days();

    let forecast = match (method, month_value) {
        (_, None) => None,
        (AggregationMethod::Sum, Some(total)) => Some(total / f64::from(filled_days) * f64::from(days_in_month)),
        (_, Some(value)) => Some(value),
    };

    let plan = db.get_plan(branch_code, metric_code, month.start)?.map(|plan| plan.value);
    let percent_of_plan = |value: Option<f64>| match (value, plan) {
        (Some(value), Some(plan)) if plan != 0.0 => Some(value * 100.0 / plan),
        _ => None,
    };

    Ok(MonthReport {
        branch_code: branch_code.to_string(),
        metric_code: metric_code.to_string(),
        month_start: month.start,
        weeks,
        month_value,
        filled_days,
        days_in_month,
        forecast,
        forecast_pct: percent_of_plan(forecast),
        plan,
        plan_pct: percent_of_plan(month_value),
        plan_delta: match (month_value, plan) {
            (Some(value), Some(plan)) => Some(value - plan),
            _ => None,
        },
    })
}
