use crate::aggregate::month_weeks;
use crate::config::OccupancySettings;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AttendanceRecord, DailySeries, DayRow, GrayFlags, MonthGroup, OccupancyCell, Period, PeriodType, StaffGroup,
    WeekGroup,
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (total, count) = values
        .into_iter()
        .fold((0.0, 0u32), |(total, count), value| (total + value, count + 1));
    if count == 0 {
        0.0
    } else {
        total / f64::from(count)
    }
}

fn check_window(window: OccupancySettings) -> AppResult<()> {
    if window.open_hour >= window.close_hour || window.close_hour > 24 {
        return Err(AppError::Validation(format!(
            "hour window [{}, {}) is empty or exceeds the day",
            window.open_hour, window.close_hour
        )));
    }
    Ok(())
}

fn at_hour(date: NaiveDate, hour: u32) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(hour))
}

fn overlaps(record: &AttendanceRecord, from: NaiveDateTime, to: NaiveDateTime) -> bool {
    record.start_at < to && record.end_at > from
}

/// One date of the grid. Only busy statuses of staff on the date's roster count.
pub fn build_day_row(
    date: NaiveDate,
    group: &StaffGroup,
    records: &[AttendanceRecord],
    window: OccupancySettings,
) -> AppResult<DayRow> {
    check_window(window)?;

    let roster: HashSet<&str> = group
        .members
        .iter()
        .filter(|member| member.active_on(date))
        .map(|member| member.staff_id.as_str())
        .collect();
    let staff_total = roster.len() as u32;

    let busy: Vec<&AttendanceRecord> = records
        .iter()
        .filter(|record| record.status.counts_as_busy() && roster.contains(record.staff_id.as_str()))
        .collect();

    let mut cells = Vec::with_capacity((window.close_hour - window.open_hour) as usize);
    for hour in window.open_hour..window.close_hour {
        let from = at_hour(date, hour);
        let to = from + Duration::hours(1);
        let busy_count = busy
            .iter()
            .filter(|record| overlaps(record, from, to))
            .map(|record| record.staff_id.as_str())
            .collect::<HashSet<_>>()
            .len() as u32;
        if busy_count > staff_total {
            return Err(AppError::Computation(format!(
                "busy count {} exceeds staff total {} on {} hour {}",
                busy_count, staff_total, date, hour
            )));
        }
        let load_pct = if staff_total == 0 {
            0.0
        } else {
            round2(100.0 * f64::from(busy_count) / f64::from(staff_total))
        };
        cells.push(OccupancyCell {
            hour,
            load_pct,
            busy_count,
            staff_total,
        });
    }

    let day_start = at_hour(date, 0);
    let gray = GrayFlags {
        early: busy
            .iter()
            .any(|record| overlaps(record, day_start, at_hour(date, window.open_hour))),
        late: busy
            .iter()
            .any(|record| overlaps(record, at_hour(date, window.close_hour), at_hour(date, 24))),
    };

    Ok(DayRow {
        date,
        dow: date.weekday().number_from_monday(),
        day_avg: round2(mean(cells.iter().map(|cell| cell.load_pct))),
        cells,
        gray,
    })
}

fn build_week(
    start: NaiveDate,
    end: NaiveDate,
    group: &StaffGroup,
    records: &[AttendanceRecord],
    window: OccupancySettings,
) -> AppResult<WeekGroup> {
    let days = Period {
        kind: PeriodType::Week,
        start,
        end,
    }
    .days()
    .map(|date| build_day_row(date, group, records, window))
    .collect::<AppResult<Vec<_>>>()?;
    let week_avg = round2(mean(days.iter().flat_map(|day| day.cells.iter().map(|cell| cell.load_pct))));
    Ok(WeekGroup {
        week_start: start,
        week_end: end,
        days,
        week_avg,
    })
}

struct GridInputs {
    group: StaffGroup,
    records: Vec<AttendanceRecord>,
}

fn load_inputs(db: &Database, branch_code: &str, group_id: &str, from: NaiveDate, to: NaiveDate) -> AppResult<GridInputs> {
    let group = db
        .get_staff_group(branch_code, group_id)?
        .ok_or_else(|| AppError::MissingReference(format!("unknown staff group {}/{}", branch_code, group_id)))?;
    let records = db.attendance_overlapping(branch_code, at_hour(from, 0), at_hour(to, 24))?;
    Ok(GridInputs { group, records })
}

/// The Monday–Sunday week containing `date`.
pub fn build_week_grid(
    db: &Database,
    branch_code: &str,
    group_id: &str,
    date: NaiveDate,
    window: OccupancySettings,
) -> AppResult<WeekGroup> {
    let week = Period::week_containing(date);
    let inputs = load_inputs(db, branch_code, group_id, week.start, week.end)?;
    build_week(week.start, week.end, &inputs.group, &inputs.records, window)
}

/// Calendar month grid; weeks are clipped to the month.
pub fn build_month_grid(
    db: &Database,
    branch_code: &str,
    group_id: &str,
    month_start: NaiveDate,
    window: OccupancySettings,
) -> AppResult<MonthGroup> {
    check_window(window)?;
    let month = Period::month_containing(month_start);
    let inputs = load_inputs(db, branch_code, group_id, month.start, month.end)?;

    let weeks = month_weeks(month)
        .into_iter()
        .map(|(start, end)| build_week(start, end, &inputs.group, &inputs.records, window))
        .collect::<AppResult<Vec<_>>>()?;
    let month_avg = round2(mean(weeks.iter().flat_map(|week| {
        week.days
            .iter()
            .flat_map(|day| day.cells.iter().map(|cell| cell.load_pct))
    })));

    Ok(MonthGroup {
        branch_code: branch_code.to_string(),
        group_id: group_id.to_string(),
        month_start: month.start,
        hours: (window.open_hour..window.close_hour).collect(),
        weeks,
        month_avg,
    })
}

/// `day_avg` per date in `[from, to]`, usable as a load metric series.
pub fn daily_load_series(
    db: &Database,
    branch_code: &str,
    group_id: &str,
    from: NaiveDate,
    to: NaiveDate,
    window: OccupancySettings,
) -> AppResult<DailySeries> {
    if from > to {
        return Err(AppError::Validation(format!("range start {} is after end {}", from, to)));
    }
    let inputs = load_inputs(db, branch_code, group_id, from, to)?;
    from.iter_days()
        .take_while(|date| *date <= to)
        .map(|date| build_day_row(date, &inputs.group, &inputs.records, window).map(|row| (date, row.day_avg)))
        .collect()
}
