//! Raw sheet rows -> canonical container records.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use mastersync_core::{
    header_key, CanonicalRecord, ColumnKind, FieldValue, Fields, HeaderRules, SheetData, SheetRow,
    SyncError, CONTAINER_NO_HEADER, ETA_HEADER, ETD_HEADER,
};
use tracing::warn;

/// Applies the column coercion rules for one pass. `year` fills in the year that
/// `DD-Mon` date cells leave out.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    rules: Arc<HeaderRules>,
    year: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedSheet {
    pub records: Vec<CanonicalRecord>,
    pub rejected_rows: usize,
}

impl RowNormalizer {
    pub fn new(rules: Arc<HeaderRules>, year: i32) -> Self {
        Self { rules, year }
    }

    /// Header cells that take part in normalization: non-blank and not ignored.
    pub fn active_headers(&self, header: &[String]) -> Vec<String> {
        header
            .iter()
            .filter(|h| !h.trim().is_empty() && !self.rules.is_ignored(h))
            .cloned()
            .collect()
    }

    pub fn normalize_sheet(&self, data: &SheetData) -> NormalizedSheet {
        let headers = self.active_headers(&data.header);
        let mut out = NormalizedSheet::default();
        for row in &data.rows {
            match self.normalize(row, &headers) {
                Some(record) => out.records.push(record),
                None => out.rejected_rows += 1,
            }
        }
        out
    }

    /// `None` when the row is not a container record: no container number, or neither ETA nor ETD.
    pub fn normalize(&self, row: &SheetRow, headers: &[String]) -> Option<CanonicalRecord> {
        let container_no = cell_by_key(row, &header_key(CONTAINER_NO_HEADER))?.trim();
        if container_no.is_empty() {
            return None;
        }
        let has_date = [ETA_HEADER, ETD_HEADER].iter().any(|h| {
            cell_by_key(row, &header_key(h)).is_some_and(|v| !v.trim().is_empty())
        });
        if !has_date {
            return None;
        }

        let mut fields = Fields::new();
        for header in headers {
            let key = header_key(header);
            let raw = row.get(header).unwrap_or_default().trim();
            if raw.is_empty() {
                fields.insert(key, FieldValue::not_available());
                continue;
            }

            let value = match self.rules.kind_of(&key) {
                ColumnKind::Numeric => match parse_numeric(&key, raw) {
                    Ok(n) => FieldValue::Number(n),
                    Err(err) => {
                        warn!(container_no, %err, "numeric cell defaulted to 0");
                        FieldValue::Number(0.0)
                    }
                },
                ColumnKind::Date => match parse_sheet_date(&key, raw, self.year) {
                    Ok(date) => FieldValue::Date(date),
                    Err(err) => {
                        warn!(container_no, %err, "date cell skipped");
                        continue;
                    }
                },
                ColumnKind::Boolean => FieldValue::Boolean(parse_boolean(raw)),
                ColumnKind::Text => FieldValue::string(raw),
            };
            fields.insert(key, value);
        }

        Some(CanonicalRecord {
            container_no: container_no.to_string(),
            fields,
        })
    }
}

fn cell_by_key<'a>(row: &'a SheetRow, key: &str) -> Option<&'a str> {
    row.cells()
        .iter()
        .find(|(h, _)| header_key(h) == key)
        .map(|(_, v)| v.as_str())
}

/// `1,234.5` -> 1234.5. Thousands separators are stripped before parsing.
pub fn parse_numeric(column: &str, raw: &str) -> Result<f64, SyncError> {
    let cleaned = raw.replace(',', "");
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| SyncError::Parse {
            column: column.to_string(),
            message: format!("{raw:?} is not a number"),
        })
}

/// `25-Aug` -> midnight UTC on 25 August of `year`.
pub fn parse_sheet_date(column: &str, raw: &str, year: i32) -> Result<DateTime<Utc>, SyncError> {
    let date = NaiveDate::parse_from_str(&format!("{}-{year}", raw.trim()), "%d-%b-%Y").map_err(
        |err| SyncError::Parse {
            column: column.to_string(),
            message: format!("{raw:?} is not a DD-Mon date: {err}"),
        },
    )?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| SyncError::Parse {
        column: column.to_string(),
        message: format!("{raw:?} has no midnight"),
    })?;
    Ok(Utc.from_utc_datetime(&midnight))
}

pub fn parse_boolean(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("yes")
}
