use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::merge;
use crate::models::{DailySeries, DerivedFact, FormulaKind, FormulaSpec, MetricDefinition};
use chrono::NaiveDate;

/// Applies a formula to one date's inputs. `None` when the result is undefined, e.g. a zero divisor.
pub fn evaluate(kind: FormulaKind, inputs: &[f64]) -> AppResult<Option<f64>> {
    if let Some(arity) = kind.arity() {
        if inputs.len() != arity {
            return Err(AppError::Computation(format!(
                "{} expects {} inputs, got {}",
                kind.as_str(),
                arity,
                inputs.len()
            )));
        }
    }
    let Some((first, rest)) = inputs.split_first() else {
        return Err(AppError::Computation(format!("{} has no inputs", kind.as_str())));
    };

    let value = match kind {
        FormulaKind::Ratio => divide(*first, rest[0]),
        FormulaKind::Share => divide(*first, first + rest[0]),
        FormulaKind::Sum => Some(inputs.iter().sum()),
        FormulaKind::Difference => Some(first - rest.iter().sum::<f64>()),
    };
    Ok(value.filter(|value| value.is_finite()))
}

fn divide(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}

/// Present values of any metric over `[from, to]`: merged facts for stored metrics,
/// computed values for derived ones.
pub fn metric_series(
    db: &Database,
    metric: &MetricDefinition,
    branch_code: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> AppResult<DailySeries> {
    let mut visiting = Vec::new();
    series_for(db, metric, branch_code, from, to, &mut visiting)
}

fn series_for(
    db: &Database,
    metric: &MetricDefinition,
    branch_code: &str,
    from: NaiveDate,
    to: NaiveDate,
    visiting: &mut Vec<String>,
) -> AppResult<DailySeries> {
    if !metric.is_derived {
        return merge::merged_series(db, branch_code, &metric.code, from, to);
    }
    let formula: &FormulaSpec = metric
        .formula
        .as_ref()
        .ok_or_else(|| AppError::Computation(format!("derived metric {} has no formula", metric.code)))?;

    if visiting.contains(&metric.code) {
        return Err(AppError::Computation(format!(
            "derived metric cycle: {} -> {}",
            visiting.join(" -> "),
            metric.code
        )));
    }
    visiting.push(metric.code.clone());

    let mut inputs = Vec::with_capacity(formula.inputs.len());
    for code in &formula.inputs {
        let input = db
            .get_metric(code)?
            .ok_or_else(|| AppError::MissingReference(format!("unknown metric {} in formula of {}", code, metric.code)))?;
        inputs.push(series_for(db, &input, branch_code, from, to, visiting)?);
    }
    visiting.pop();

    combine(formula.kind, &inputs)
}

/// Dates on which every input is present, mapped through the formula.
pub fn combine(kind: FormulaKind, inputs: &[DailySeries]) -> AppResult<DailySeries> {
    let Some((first, rest)) = inputs.split_first() else {
        return Ok(DailySeries::new());
    };

    let mut out = DailySeries::new();
    let mut values = Vec::with_capacity(inputs.len());
    for (date, value) in first {
        values.clear();
        values.push(*value);
        for series in rest {
            match series.get(date) {
                Some(value) => values.push(*value),
                None => break,
            }
        }
        if values.len() != inputs.len() {
            continue;
        }
        if let Some(result) = evaluate(kind, &values)? {
            out.insert(*date, result);
        }
    }
    Ok(out)
}

/// One entry per date in `[from, to]`; dates with any absent input carry `None`.
pub fn read_derived(
    db: &Database,
    branch_code: &str,
    metric_code: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> AppResult<Vec<DerivedFact>> {
    if from > to {
        return Err(AppError::Validation(format!("range start {} is after end {}", from, to)));
    }
    let metric = db
        .get_metric(metric_code)?
        .ok_or_else(|| AppError::MissingReference(format!("unknown metric {}", metric_code)))?;
    if !metric.is_derived {
        return Err(AppError::Validation(format!("metric {} is not derived", metric_code)));
    }

    let series = metric_series(db, &metric, branch_code, from, to)?;
    Ok(from
        .iter_days()
        .take_while(|date| *date <= to)
        .map(|date| DerivedFact {
            date,
            value: series.get(&date).copied(),
        })
        .collect())
}
