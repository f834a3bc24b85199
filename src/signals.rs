use crate::aggregate;
use crate::config::{CashControlSettings, SignalSettings, Thresholds};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::merge;
use crate::models::{DailySeries, Period, PeriodType, Signal, SignalStatus, SignalType};
use chrono::{Days, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Baseline {
    /// The same leading days of the previous week or calendar month.
    PriorPeriod,
    /// The monthly plan value. Month periods only.
    Plan,
}

impl Baseline {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriorPeriod => "prior-period",
            Self::Plan => "plan",
        }
    }
}

pub fn classify(delta_percent: f64, thresholds: Thresholds) -> SignalStatus {
    let magnitude = delta_percent.abs();
    if magnitude >= thresholds.critical_pct {
        SignalStatus::Critical
    } else if magnitude >= thresholds.warning_pct {
        SignalStatus::Warning
    } else {
        SignalStatus::Ok
    }
}

/// Fails with a short reason when the comparison is undefined.
pub fn delta_percent(current: Option<f64>, baseline: Option<f64>) -> Result<f64, &'static str> {
    match (current, baseline) {
        (None, _) => Err("current value missing"),
        (_, None) => Err("baseline missing"),
        (Some(_), Some(base)) if base == 0.0 => Err("baseline is zero"),
        (Some(current), Some(base)) => Ok(100.0 * (current - base) / base),
    }
}

/// Compares one metric's aggregate against its baseline and appends the resulting signal.
pub fn detect(
    db: &Database,
    settings: &SignalSettings,
    branch_code: &str,
    metric_code: &str,
    period: Period,
    baseline: Baseline,
) -> AppResult<Signal> {
    let signal = evaluate(db, settings, branch_code, metric_code, period, baseline)?;
    db.insert_signal(&signal)?;
    tracing::info!(
        branch = branch_code,
        metric = metric_code,
        status = signal.status.as_str(),
        needs_review = signal.needs_review,
        "signal recorded"
    );
    Ok(signal)
}

/// Runs `detect` for every metric that has data on either side of the comparison,
/// plus the cash reconciliation when it is configured and has balances to check.
pub fn detect_branch(
    db: &Database,
    settings: &SignalSettings,
    branch_code: &str,
    period: Period,
    baseline: Baseline,
) -> AppResult<Vec<Signal>> {
    let mut signals = Vec::new();
    for metric in db.list_metrics()? {
        let signal = evaluate(db, settings, branch_code, &metric.code, period, baseline)?;
        let empty = signal.details["current"].is_null() && signal.details["baseline"].is_null();
        if empty {
            continue;
        }
        db.insert_signal(&signal)?;
        signals.push(signal);
    }
    if let Some(cash) = &settings.cash_control {
        let signal = reconcile_cash(db, cash, branch_code, period)?;
        if !signal.needs_review {
            db.insert_signal(&signal)?;
            signals.push(signal);
        }
    }
    tracing::info!(branch = branch_code, count = signals.len(), "branch signals recorded");
    Ok(signals)
}

/// Checks each day's closing balance against the previous day's balance and the
/// day's cash movements, and appends one signal for the period.
///
/// Days without both balances are skipped. Missing movements count as zero.
pub fn detect_cash_control(
    db: &Database,
    settings: &SignalSettings,
    branch_code: &str,
    period: Period,
) -> AppResult<Signal> {
    let cash = settings
        .cash_control
        .as_ref()
        .ok_or_else(|| AppError::Config("cash control is not configured".to_string()))?;
    if !db.branch_exists(branch_code)? {
        return Err(AppError::MissingReference(format!("unknown branch {}", branch_code)));
    }
    let signal = reconcile_cash(db, cash, branch_code, period)?;
    db.insert_signal(&signal)?;
    tracing::info!(
        branch = branch_code,
        status = signal.status.as_str(),
        discrepancies = signal.details["discrepancies"].as_array().map_or(0, Vec::len),
        "cash control recorded"
    );
    Ok(signal)
}

fn reconcile_cash(db: &Database, cash: &CashControlSettings, branch_code: &str, period: Period) -> AppResult<Signal> {
    let opening = period.start.checked_sub_days(Days::new(1)).unwrap_or(period.start);
    let balance = merge::merged_series(db, branch_code, &cash.balance_metric, opening, period.end)?;
    let movement = |metric_code: &str| merge::merged_series(db, branch_code, metric_code, period.start, period.end);
    let revenue = movement(&cash.cash_revenue_metric)?;
    let deposits = movement(&cash.deposits_metric)?;
    let withdrawals = movement(&cash.withdrawals_metric)?;

    let mut checked_days = 0u32;
    let mut discrepancies = Vec::new();
    let mut max_diff = 0.0f64;
    for date in period.days() {
        let previous = date.checked_sub_days(Days::new(1)).and_then(|previous| balance.get(&previous));
        let (Some(actual), Some(previous)) = (balance.get(&date), previous) else {
            continue;
        };
        checked_days += 1;
        let day = |series: &DailySeries| series.get(&date).copied().unwrap_or(0.0);
        let expected = previous + day(&revenue) + day(&deposits) - day(&withdrawals);
        let diff = actual - expected;
        if diff.abs() >= cash.tolerance {
            max_diff = max_diff.max(diff.abs());
            discrepancies.push(json!({
                "date": date,
                "expected": expected,
                "actual": actual,
                "diff": diff,
            }));
        }
    }

    let (status, needs_review) = match (checked_days, discrepancies.is_empty()) {
        (0, _) => (SignalStatus::Warning, true),
        (_, true) => (SignalStatus::Ok, false),
        (_, false) => (SignalStatus::Critical, false),
    };
    let mut details = json!({
        "checkedDays": checked_days,
        "tolerance": cash.tolerance,
        "maxDiff": max_diff,
        "discrepancies": discrepancies,
    });
    if needs_review {
        details["reviewReason"] = json!("no consecutive closing balances");
    }

    Ok(Signal {
        id: Uuid::new_v4().to_string(),
        branch_code: branch_code.to_string(),
        metric_code: Some(cash.balance_metric.clone()),
        signal_type: SignalType::CashControl,
        period,
        delta_percent: None,
        status,
        needs_review,
        details,
        created_at: Utc::now(),
    })
}

fn evaluate(
    db: &Database,
    settings: &SignalSettings,
    branch_code: &str,
    metric_code: &str,
    period: Period,
    baseline: Baseline,
) -> AppResult<Signal> {
    let (signal_type, window, baseline_period) = match (baseline, period.kind) {
        (Baseline::Plan, PeriodType::Week) => {
            return Err(AppError::Validation("plan baselines are monthly; use a month period".to_string()));
        }
        (Baseline::Plan, PeriodType::Month) => (SignalType::PlanVsActual, period, None),
        (Baseline::PriorPeriod, _) => {
            let last_filled = aggregate::last_filled(db, branch_code, metric_code, period)?;
            let (window, previous) = aggregate::comparison_windows(period, last_filled);
            (SignalType::PeriodOverPeriod, window, Some(previous))
        }
    };

    let current = aggregate::aggregate(db, branch_code, metric_code, window)?;
    let baseline_value = match baseline_period {
        Some(previous) => aggregate::aggregate(db, branch_code, metric_code, previous)?.value,
        None => db.get_plan(branch_code, metric_code, period.start)?.map(|plan| plan.value),
    };

    let thresholds = settings.thresholds_for(metric_code);
    let mut details = json!({
        "baselineKind": baseline.as_str(),
        "current": current.value,
        "baseline": baseline_value,
        "method": current.method.as_str(),
        "presentDays": current.present_days,
        "totalDays": current.total_days,
        "warningPct": thresholds.warning_pct,
        "criticalPct": thresholds.critical_pct,
    });
    if let Some(previous) = baseline_period {
        details["window"] = json!({ "start": window.start, "end": window.end });
        details["baselinePeriod"] = json!({ "start": previous.start, "end": previous.end });
    }

    let (delta, status, needs_review) = match delta_percent(current.value, baseline_value) {
        Ok(delta) => (Some(delta), classify(delta, thresholds), false),
        Err(reason) => {
            details["reviewReason"] = json!(reason);
            (None, SignalStatus::Warning, true)
        }
    };

    Ok(Signal {
        id: Uuid::new_v4().to_string(),
        branch_code: branch_code.to_string(),
        metric_code: Some(metric_code.to_string()),
        signal_type,
        period,
        delta_percent: delta,
        status,
        needs_review,
        details,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::{classify, delta_percent, detect, detect_branch, detect_cash_control, Baseline};
    use crate::config::{CashControlSettings, SignalSettings, Thresholds};
    use crate::db::test_support;
    use crate::errors::AppError;
    use crate::models::{FactSource, ListSignalsFilters, Period, PeriodType, SignalStatus, SignalType};
    use chrono::NaiveDate;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).expect("date")
    }

    #[test]
    fn thresholds_map_magnitude() {
        let thresholds = Thresholds::default();
        assert_eq!(classify(5.0, thresholds), SignalStatus::Ok);
        assert_eq!(classify(-10.0, thresholds), SignalStatus::Warning);
        assert_eq!(classify(30.0, thresholds), SignalStatus::Critical);
        assert_eq!(delta_percent(Some(5.0), Some(0.0)), Err("baseline is zero"));
        assert_eq!(delta_percent(Some(120.0), Some(100.0)), Ok(20.0));
    }

    #[test]
    fn week_over_week_signal_is_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        db.upsert_daily(FactSource::Manual, "B1", "visits", date(3, 4), 100.0).expect("prev");
        db.upsert_daily(FactSource::Manual, "B1", "visits", date(3, 11), 130.0).expect("curr");

        let settings = SignalSettings::default();
        let period = Period::week_containing(date(3, 11));
        let signal = detect(&db, &settings, "B1", "visits", period, Baseline::PriorPeriod).expect("detect");
        assert_eq!(signal.signal_type, SignalType::PeriodOverPeriod);
        assert_eq!(signal.delta_percent, Some(30.0));
        assert_eq!(signal.status, SignalStatus::Critical);
        assert!(!signal.needs_review);

        detect(&db, &settings, "B1", "visits", period, Baseline::PriorPeriod).expect("again");
        let stored = db.list_signals("B1", &ListSignalsFilters::default()).expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, signal.id);
    }

    #[test]
    fn month_over_month_compares_matching_days() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let settings = SignalSettings::default();
        let march = Period::month_containing(date(3, 1));
        let flat = |month: u32, last_day: u32| {
            for day in 1..=last_day {
                db.upsert_daily(FactSource::Manual, "B1", "visits", date(month, day), 10.0)
                    .expect("fact");
            }
        };

        // Half a month in, against a complete February.
        flat(2, 28);
        flat(3, 15);
        let partial = detect(&db, &settings, "B1", "visits", march, Baseline::PriorPeriod).expect("detect");
        assert_eq!(partial.delta_percent, Some(0.0));
        assert_eq!(partial.status, SignalStatus::Ok);
        assert_eq!(partial.details["window"]["end"], "2025-03-15");
        assert_eq!(partial.details["baselinePeriod"]["end"], "2025-02-15");
        assert_eq!(partial.period, march);

        // A complete flat March against a shorter February is still flat.
        flat(3, 31);
        let full = detect(&db, &settings, "B1", "visits", march, Baseline::PriorPeriod).expect("detect");
        assert_eq!(full.delta_percent, Some(0.0));
        assert_eq!(full.details["current"], 280.0);
        assert_eq!(full.details["baseline"], 280.0);
    }

    #[test]
    fn zero_or_missing_baseline_needs_review() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        db.upsert_daily(FactSource::Manual, "B1", "visits", date(3, 4), 0.0).expect("prev");
        db.upsert_daily(FactSource::Manual, "B1", "visits", date(3, 11), 10.0).expect("curr");

        let settings = SignalSettings::default();
        let zero = detect(
            &db,
            &settings,
            "B1",
            "visits",
            Period::week_containing(date(3, 11)),
            Baseline::PriorPeriod,
        )
        .expect("detect");
        assert_eq!(zero.delta_percent, None);
        assert!(zero.needs_review);
        assert_eq!(zero.details["reviewReason"], "baseline is zero");

        let month = Period::month_containing(date(3, 1));
        let no_plan = detect(&db, &settings, "B1", "visits", month, Baseline::Plan).expect("detect");
        assert!(no_plan.needs_review);
        assert_eq!(no_plan.signal_type, SignalType::PlanVsActual);
    }

    #[test]
    fn plan_baseline_uses_month_plan_and_rejects_weeks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        db.upsert_daily(FactSource::Manual, "B1", "visits", date(3, 4), 90.0).expect("fact");
        db.upsert_plan("B1", "visits", date(3, 1), 100.0).expect("plan");

        let mut settings = SignalSettings::default();
        settings.overrides.insert(
            "visits".to_string(),
            Thresholds {
                warning_pct: 5.0,
                critical_pct: 50.0,
            },
        );
        let month = Period::month_containing(date(3, 1));
        let signal = detect(&db, &settings, "B1", "visits", month, Baseline::Plan).expect("detect");
        assert_eq!(signal.delta_percent, Some(-10.0));
        assert_eq!(signal.status, SignalStatus::Warning);

        let week = Period::week_containing(date(3, 4));
        let error = detect(&db, &settings, "B1", "visits", week, Baseline::Plan).expect_err("week plan");
        assert!(matches!(error, AppError::Validation(_)));

        let filtered = db
            .list_signals(
                "B1",
                &ListSignalsFilters {
                    period_type: Some(PeriodType::Week),
                    ..ListSignalsFilters::default()
                },
            )
            .expect("list");
        assert!(filtered.is_empty());
    }

    #[test]
    fn cash_control_flags_unexplained_balance_moves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = test_support::database(&dir);
        let facts = [
            ("cash_balance_end_day", date(2, 28), 5000.0),
            ("cash_balance_end_day", date(3, 1), 7000.0),
            ("revenue_cash", date(3, 1), 2000.0),
            ("cash_balance_end_day", date(3, 2), 6000.0),
            ("deposit_total", date(3, 2), 1000.0),
            ("withdrawals_total", date(3, 2), 500.0),
            ("cash_balance_end_day", date(3, 3), 6500.0),
            ("revenue_cash", date(3, 3), 800.0),
            ("cash_balance_end_day", date(3, 5), 9999.0),
        ];
        for (metric, day, value) in facts {
            db.upsert_daily(FactSource::Manual, "B1", metric, day, value).expect("fact");
        }

        let unconfigured = SignalSettings::default();
        let march = Period::month_containing(date(3, 1));
        let error = detect_cash_control(&db, &unconfigured, "B1", march).expect_err("not configured");
        assert_eq!(error.code(), "CONFIG_INVALID");

        let settings = SignalSettings {
            cash_control: Some(CashControlSettings::default()),
            ..SignalSettings::default()
        };
        let signal = detect_cash_control(&db, &settings, "B1", march).expect("cash control");
        assert_eq!(signal.signal_type, SignalType::CashControl);
        assert_eq!(signal.metric_code.as_deref(), Some("cash_balance_end_day"));
        assert_eq!(signal.status, SignalStatus::Critical);
        assert!(!signal.needs_review);
        assert_eq!(signal.details["checkedDays"], 3);
        assert_eq!(signal.details["maxDiff"], 1500.0);
        let discrepancies = signal.details["discrepancies"].as_array().expect("list");
        assert_eq!(discrepancies.len(), 1);
        assert_eq!(discrepancies[0]["date"], "2025-03-02");
        assert_eq!(discrepancies[0]["expected"], 7500.0);
        assert_eq!(discrepancies[0]["diff"], -1500.0);

        let stored = db.list_signals("B1", &ListSignalsFilters::default()).expect("list");
        assert_eq!(stored.last().map(|signal| signal.signal_type), Some(SignalType::CashControl));

        let quiet_week = Period::week_containing(date(3, 12));
        let quiet = detect_branch(&db, &settings, "B1", quiet_week, Baseline::PriorPeriod).expect("branch");
        assert!(quiet.iter().all(|signal| signal.signal_type != SignalType::CashControl));

        let branch = detect_branch(&db, &settings, "B1", march, Baseline::PriorPeriod).expect("branch");
        assert!(branch.iter().any(|signal| signal.signal_type == SignalType::CashControl));
        assert!(branch.iter().all(|signal| signal.metric_code.as_deref() != Some("avg_check")));
    }
}
