use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{DailySeries, FactSource, MergedFact};
use chrono::NaiveDate;

/// Manual wins over automated for the same key regardless of which was written last.
pub fn resolve_precedence(manual: Option<f64>, automated: Option<f64>) -> Option<(f64, FactSource)> {
    match (manual, automated) {
        (Some(value), _) => Some((value, FactSource::Manual)),
        (None, Some(value)) => Some((value, FactSource::Automated)),
        (None, None) => None,
    }
}

/// Projects two per-source series onto one. Dates absent from both stay absent.
pub fn merge_series(manual: &DailySeries, automated: &DailySeries) -> Vec<MergedFact> {
    let mut dates: Vec<NaiveDate> = manual.keys().chain(automated.keys()).copied().collect();
    dates.sort_unstable();
    dates.dedup();

    dates
        .into_iter()
        .filter_map(|date| {
            resolve_precedence(manual.get(&date).copied(), automated.get(&date).copied())
                .map(|(value, source)| MergedFact { date, value, source })
        })
        .collect()
}

pub fn read_merged(
    db: &Database,
    branch_code: &str,
    metric_code: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> AppResult<Vec<MergedFact>> {
    if from > to {
        return Err(AppError::Validation(format!("range start {} is after end {}", from, to)));
    }
    let manual = db.read_source_facts(FactSource::Manual, branch_code, metric_code, from, to)?;
    let automated = db.read_source_facts(FactSource::Automated, branch_code, metric_code, from, to)?;
    Ok(merge_series(&manual, &automated))
}

/// Merged values as a plain series.
pub fn merged_series(
    db: &Database,
    branch_code: &str,
    metric_code: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> AppResult<DailySeries> {
    Ok(read_merged(db, branch_code, metric_code, from, to)?
        .into_iter()
        .map(|fact| (fact.date, fact.value))
        .collect())
}
