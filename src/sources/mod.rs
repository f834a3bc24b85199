pub mod sheet;
pub mod sync;

use serde::{Deserialize, Serialize};

/// A spreadsheet cell as the external reader hands it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawCell {
    Number(f64),
    Text(String),
}

impl RawCell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.trim()),
            Self::Number(_) => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(text) if text.trim().is_empty())
    }

    /// Display form used for codes that may arrive as numbers.
    pub fn to_code(&self) -> String {
        match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Number(value) if value.fract() == 0.0 => format!("{}", *value as i64),
            Self::Number(value) => value.to_string(),
        }
    }
}

pub type Row = Vec<Option<RawCell>>;

pub(crate) fn is_empty(cell: Option<&RawCell>) -> bool {
    cell.map_or(true, RawCell::is_blank)
}

/// Outcome of reading one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellParse<T> {
    Value(T),
    Empty,
    Malformed(String),
}

/// Reads a numeric cell. Text accepts spaces as thousand separators and `,` as decimal mark.
pub fn parse_number(cell: Option<&RawCell>) -> CellParse<f64> {
    match cell {
        None => CellParse::Empty,
        Some(RawCell::Number(value)) if value.is_finite() => CellParse::Value(*value),
        Some(RawCell::Number(value)) => CellParse::Malformed(format!("non-finite number {}", value)),
        Some(RawCell::Text(text)) => {
            let compact: String = text
                .chars()
                .filter(|ch| !ch.is_whitespace())
                .map(|ch| if ch == ',' { '.' } else { ch })
                .collect();
            if compact.is_empty() {
                return CellParse::Empty;
            }
            match compact.parse::<f64>() {
                Ok(value) if value.is_finite() => CellParse::Value(value),
                _ => CellParse::Malformed(format!("not a number: {:?}", text.trim())),
            }
        }
    }
}
