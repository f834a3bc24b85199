//! Manual spreadsheet export: one article label per row, one column per date,
//! branch blocks introduced by header rows carrying only a branch code.

use super::{is_empty, parse_number, CellParse, RawCell, Row};
use crate::config::ReferenceConfig;
use crate::db::FactRow;
use crate::errors::{AppError, AppResult};
use chrono::{Datelike, Days, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

const ARTICLE_HEADERS: [&str; 2] = ["статья", "article"];
const HEADER_SCAN_ROWS: usize = 12;
const FALLBACK_HEADER_ROW: usize = 3;
const SERIAL_THRESHOLD: f64 = 20_000.0;
const MANUAL_SOURCE: &str = "manual";
const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%d.%m.%y", "%d/%m/%y"];

static RU_SHORT_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})\s+([а-яё.]+)").expect("valid short date regex"));

const RU_MONTHS: [(&str, u32); 13] = [
    ("янв", 1),
    ("фев", 2),
    ("мар", 3),
    ("апр", 4),
    ("май", 5),
    ("мая", 5),
    ("июн", 6),
    ("июл", 7),
    ("авг", 8),
    ("сен", 9),
    ("окт", 10),
    ("ноя", 11),
    ("дек", 12),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnRole {
    Article,
    MetricCode,
    Source,
    BranchCode,
    Date(NaiveDate),
    Ignored,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SheetOptions {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetStats {
    pub rows: u64,
    pub date_columns: u64,
    pub records: u64,
    pub unknown_labels: u64,
    pub unknown_branches: u64,
    pub skipped_empty: u64,
    pub malformed_cells: u64,
    pub malformed_rows: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCell {
    pub row: usize,
    pub column: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct SheetParse {
    pub records: Vec<FactRow>,
    pub malformed: Vec<MalformedCell>,
    pub stats: SheetStats,
}

pub struct SheetReader {
    known_branches: HashSet<String>,
    ignored_branches: HashSet<String>,
    ignored_labels: HashSet<String>,
    labels: HashMap<String, String>,
}

impl SheetReader {
    pub fn new(reference: &ReferenceConfig) -> Self {
        let mut labels = HashMap::new();
        for metric in reference.metrics.iter().filter(|metric| !metric.is_derived) {
            labels.entry(metric.label.trim().to_string()).or_insert_with(|| metric.code.clone());
            for label in &metric.source_labels {
                labels.insert(label.trim().to_string(), metric.code.clone());
            }
        }
        Self {
            known_branches: reference.branches.iter().map(|branch| branch.code.clone()).collect(),
            ignored_branches: reference.ignore_branch_codes.iter().cloned().collect(),
            ignored_labels: reference.ignore_labels.iter().cloned().collect(),
            labels,
        }
    }

    pub fn read(&self, rows: &[Row], options: &SheetOptions) -> AppResult<SheetParse> {
        if rows.is_empty() {
            return Err(AppError::Validation("sheet has no rows".to_string()));
        }
        let header_index = find_header_row(rows);
        let header = rows
            .get(header_index)
            .ok_or_else(|| AppError::Validation(format!("sheet has no header row {}", header_index)))?;
        let roles = column_roles(header, options);
        let date_columns: Vec<(usize, NaiveDate)> = roles
            .iter()
            .enumerate()
            .filter_map(|(index, role)| match role {
                ColumnRole::Date(date) => Some((index, *date)),
                _ => None,
            })
            .collect();
        if date_columns.is_empty() {
            return Err(AppError::Validation(format!(
                "no date columns detected in header row {}",
                header_index
            )));
        }

        let column = |role: ColumnRole| roles.iter().position(|candidate| *candidate == role);
        let article_col = column(ColumnRole::Article);
        let metric_col = column(ColumnRole::MetricCode);
        let source_col = column(ColumnRole::Source);
        let branch_col = column(ColumnRole::BranchCode);

        let mut parse = SheetParse::default();
        parse.stats.date_columns = date_columns.len() as u64;
        let mut current_branch: Option<String> = None;

        for (offset, row) in rows.iter().enumerate().skip(header_index + 1) {
            parse.stats.rows += 1;
            if row.iter().all(|cell| is_empty(cell.as_ref())) {
                parse.stats.skipped_empty += 1;
                continue;
            }

            if let Some(branch) = self.branch_header(row, article_col, metric_col) {
                if !self.known_branches.contains(&branch) && !self.ignored_branches.contains(&branch) {
                    parse.stats.unknown_branches += 1;
                }
                current_branch = Some(branch);
                continue;
            }

            let branch_code = text_at(row, branch_col).or_else(|| current_branch.clone());
            let Some(branch_code) = branch_code else {
                continue;
            };
            if self.ignored_branches.contains(&branch_code)
                || current_branch.as_ref().is_some_and(|branch| self.ignored_branches.contains(branch))
            {
                continue;
            }

            let label = text_at(row, article_col);
            if label.as_ref().is_some_and(|label| self.ignored_labels.contains(label)) {
                continue;
            }
            let metric_code = text_at(row, metric_col).or_else(|| label.as_ref().and_then(|label| self.labels.get(label).cloned()));
            let Some(metric_code) = metric_code else {
                parse.stats.unknown_labels += 1;
                continue;
            };

            let source = text_at(row, source_col).map(|source| source.to_lowercase());
            if source.is_some_and(|source| source != MANUAL_SOURCE) {
                continue;
            }

            let mut row_malformed = false;
            for (col, date) in &date_columns {
                match parse_number(row.get(*col).and_then(Option::as_ref)) {
                    CellParse::Value(value) => parse.records.push(FactRow {
                        branch_code: branch_code.clone(),
                        metric_code: metric_code.clone(),
                        date: *date,
                        value,
                    }),
                    CellParse::Empty => {}
                    CellParse::Malformed(reason) => {
                        row_malformed = true;
                        parse.malformed.push(MalformedCell {
                            row: offset,
                            column: *col,
                            reason,
                        });
                    }
                }
            }
            if row_malformed {
                parse.stats.malformed_rows += 1;
            }
        }

        parse.stats.records = parse.records.len() as u64;
        parse.stats.malformed_cells = parse.malformed.len() as u64;
        Ok(parse)
    }

    /// A row with no article or metric code whose text names a branch.
    fn branch_header(&self, row: &Row, article_col: Option<usize>, metric_col: Option<usize>) -> Option<String> {
        if !is_empty(cell_at(row, article_col)) || !is_empty(cell_at(row, metric_col)) {
            return None;
        }
        let named = row
            .iter()
            .filter_map(|cell| cell.as_ref().and_then(RawCell::as_text))
            .find(|text| self.known_branches.contains(*text) || self.ignored_branches.contains(*text));
        if let Some(code) = named {
            return Some(code.to_string());
        }
        row.first()
            .and_then(|cell| cell.as_ref())
            .and_then(RawCell::as_text)
            .filter(|text| !text.is_empty())
            .map(ToString::to_string)
    }
}

fn cell_at(row: &Row, col: Option<usize>) -> Option<&RawCell> {
    col.and_then(|col| row.get(col)).and_then(Option::as_ref)
}

fn text_at(row: &Row, col: Option<usize>) -> Option<String> {
    cell_at(row, col)
        .filter(|cell| !cell.is_blank())
        .map(RawCell::to_code)
}

fn find_header_row(rows: &[Row]) -> usize {
    rows.iter()
        .take(HEADER_SCAN_ROWS)
        .position(|row| {
            row.iter()
                .filter_map(|cell| cell.as_ref().and_then(RawCell::as_text))
                .any(|text| ARTICLE_HEADERS.contains(&text.to_lowercase().as_str()))
        })
        .unwrap_or(FALLBACK_HEADER_ROW)
}

fn column_roles(header: &Row, options: &SheetOptions) -> Vec<ColumnRole> {
    let year_hint = find_year_hint(header);
    header
        .iter()
        .map(|cell| {
            let Some(cell) = cell.as_ref() else {
                return ColumnRole::Ignored;
            };
            if let Some(text) = cell.as_text() {
                let lowered = text.to_lowercase();
                if ARTICLE_HEADERS.contains(&lowered.as_str()) {
                    return ColumnRole::Article;
                }
                match lowered.as_str() {
                    "metric_code" => return ColumnRole::MetricCode,
                    "source" => return ColumnRole::Source,
                    "branch_code" => return ColumnRole::BranchCode,
                    _ => {}
                }
            }
            match parse_date_header(cell, year_hint) {
                Some(date) if in_window(date, options) => ColumnRole::Date(date),
                _ => ColumnRole::Ignored,
            }
        })
        .collect()
}

fn in_window(date: NaiveDate, options: &SheetOptions) -> bool {
    options.date_from.map_or(true, |from| date >= from) && options.date_to.map_or(true, |to| date <= to)
}

fn plausible_year(year: i32) -> bool {
    (2000..=2100).contains(&year)
}

fn find_year_hint(header: &Row) -> Option<i32> {
    header.iter().flatten().find_map(|cell| match cell {
        RawCell::Number(value) if value.fract() == 0.0 && plausible_year(*value as i32) => Some(*value as i32),
        RawCell::Text(text) => {
            let text = text.trim();
            (text.len() == 4 && text.chars().all(|ch| ch.is_ascii_digit()))
                .then(|| text.parse::<i32>().ok())
                .flatten()
                .filter(|year| plausible_year(*year))
        }
        _ => None,
    })
}

pub fn parse_date_header(cell: &RawCell, year_hint: Option<i32>) -> Option<NaiveDate> {
    match cell {
        RawCell::Number(serial) if *serial > SERIAL_THRESHOLD => {
            // Serials past any representable date saturate and fail the checked add.
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
            epoch
                .checked_add_days(Days::new(serial.round() as u64))
                .filter(|date| plausible_year(date.year()))
        }
        RawCell::Number(_) => None,
        RawCell::Text(text) => {
            let text = text.trim();
            DATE_FORMATS
                .iter()
                .filter_map(|format| NaiveDate::parse_from_str(text, format).ok())
                .find(|date| plausible_year(date.year()))
                .or_else(|| parse_ru_short_date(text, year_hint?))
        }
    }
}

fn parse_ru_short_date(text: &str, year: i32) -> Option<NaiveDate> {
    let lowered = text.to_lowercase();
    let captures = RU_SHORT_DATE.captures(&lowered)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month_raw = captures.get(2)?.as_str().trim_matches('.');
    let month = RU_MONTHS
        .iter()
        .find(|(prefix, _)| month_raw.starts_with(prefix))
        .map(|(_, month)| *month)?;
    NaiveDate::from_ymd_opt(year, month, day)
}
