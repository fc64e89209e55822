//! Core domain model for the MASTER sheet sync: rows, canonical records, checkpoint and errors.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mastersync-core";

/// Sentinel written for empty cells so stale document fields get overwritten.
pub const NOT_AVAILABLE: &str = "N/A";

pub const CONTAINER_NO_HEADER: &str = "CONTAINER NO";
pub const ETA_HEADER: &str = "ETA";
pub const ETD_HEADER: &str = "ETD";

pub const CONTAINERS_COLLECTION: &str = "containers";
pub const DEALERS_COLLECTION: &str = "dealers";
pub const BOOKINGS_COLLECTION: &str = "bookings";
pub const SYNC_METADATA_COLLECTION: &str = "syncMetadata";
pub const CHECKPOINT_DOCUMENT_ID: &str = "masterSheet";

pub const BOOKING_STATUS_APPROVED: &str = "Approved";
pub const SALES_STATUS_BLOCKED: &str = "Blocked";
pub const SALES_STATUS_AVAILABLE: &str = "Available";

/// Per-call write ceiling of the hosted document store is 500; 400 leaves headroom.
pub const FIRESTORE_MAX_BATCH_WRITES: usize = 400;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("access error: {0}")]
    Access(String),
    #[error("parse error in column {column}: {message}")]
    Parse { column: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Typed value of one document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
}

impl FieldValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn not_available() -> Self {
        Self::String(NOT_AVAILABLE.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Text form used when projecting a value back into a spreadsheet cell.
    pub fn to_cell_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Boolean(true) => "Yes".to_string(),
            Self::Boolean(false) => "No".to_string(),
            Self::Date(d) => d.format("%d-%b").to_string(),
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// A stored document: id within its collection plus its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_str)
    }
}

/// One spreadsheet row as an ordered header -> raw cell mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    cells: Vec<(String, String)>,
}

impl SheetRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zips a header row with a value row; short rows are padded with empty cells.
    pub fn from_header_and_values(header: &[String], values: &[String]) -> Self {
        let cells = header
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), values.get(i).cloned().unwrap_or_default()))
            .collect();
        Self { cells }
    }

    pub fn with(mut self, header: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(header, value);
        self
    }

    pub fn insert(&mut self, header: impl Into<String>, value: impl Into<String>) {
        let header = header.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(h, _)| *h == header) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((header, value)),
        }
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(h, _)| h.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Full contents of one spreadsheet tab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetData {
    pub header: Vec<String>,
    pub rows: Vec<SheetRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetMetadata {
    pub name: String,
    pub modified_at: DateTime<Utc>,
}

/// Normalized representation of one container row, keyed by container number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub container_no: String,
    pub fields: Fields,
}

/// Derives a document field name from a sheet header: trim, whitespace runs -> `_`, lower-case.
pub fn header_key(header: &str) -> String {
    header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Per-column coercion rules. Header names are stored as derived keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRules {
    ignored: BTreeSet<String>,
    numeric: BTreeSet<String>,
    date: BTreeSet<String>,
    boolean: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeaderRulesFile {
    #[serde(default)]
    pub ignored: Vec<String>,
    #[serde(default)]
    pub numeric: Vec<String>,
    #[serde(default)]
    pub date: Vec<String>,
    #[serde(default)]
    pub boolean: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Date,
    Boolean,
    Text,
}

impl HeaderRules {
    pub fn new<S: AsRef<str>>(ignored: &[S], numeric: &[S], date: &[S], boolean: &[S]) -> Self {
        fn keys<S: AsRef<str>>(headers: &[S]) -> BTreeSet<String> {
            headers.iter().map(|h| header_key(h.as_ref())).collect()
        }
        Self {
            ignored: keys(ignored),
            numeric: keys(numeric),
            date: keys(date),
            boolean: keys(boolean),
        }
    }

    pub fn is_ignored(&self, header: &str) -> bool {
        self.ignored.contains(&header_key(header))
    }

    pub fn kind_of(&self, key: &str) -> ColumnKind {
        if self.numeric.contains(key) {
            ColumnKind::Numeric
        } else if self.date.contains(key) {
            ColumnKind::Date
        } else if self.boolean.contains(key) {
            ColumnKind::Boolean
        } else {
            ColumnKind::Text
        }
    }

    pub fn to_file(&self) -> HeaderRulesFile {
        HeaderRulesFile {
            ignored: self.ignored.iter().cloned().collect(),
            numeric: self.numeric.iter().cloned().collect(),
            date: self.date.iter().cloned().collect(),
            boolean: self.boolean.iter().cloned().collect(),
        }
    }
}

impl Default for HeaderRules {
    fn default() -> Self {
        Self::new(
            &["S NO", "INTERNAL NOTES"],
            &["QTY", "PRICE", "CBM", "WEIGHT", "UNITS"],
            &[ETA_HEADER, ETD_HEADER],
            &["PAID", "DOCS RECEIVED", "CLEARED"],
        )
    }
}

impl From<HeaderRulesFile> for HeaderRules {
    fn from(file: HeaderRulesFile) -> Self {
        Self::new(&file.ignored, &file.numeric, &file.date, &file.boolean)
    }
}

/// Persisted marker of the last fully committed reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub last_sync: DateTime<Utc>,
    pub sheet_title: String,
}

impl SyncCheckpoint {
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("lastSync".to_string(), FieldValue::Date(self.last_sync)),
            (
                "sheetTitle".to_string(),
                FieldValue::String(self.sheet_title.clone()),
            ),
        ])
    }

    pub fn from_fields(fields: &Fields) -> Option<Self> {
        let last_sync = fields.get("lastSync").and_then(FieldValue::as_date)?;
        let sheet_title = fields
            .get("sheetTitle")
            .and_then(FieldValue::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            last_sync,
            sheet_title,
        })
    }
}

/// Before/after snapshots carried by a document write event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange<T> {
    pub id: String,
    #[serde(default)]
    pub before: Option<T>,
    #[serde(default)]
    pub after: Option<T>,
}

impl<T> DocumentChange<T> {
    pub fn is_delete(&self) -> bool {
        self.after.is_none()
    }
}

fn text_field(fields: &Fields, name: &str) -> String {
    fields
        .get(name)
        .map(FieldValue::to_cell_text)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DealerRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub status: String,
}

impl DealerRecord {
    pub const ID_COLUMN: &'static str = "DEALER ID";

    pub fn from_fields(fields: &Fields) -> Self {
        Self {
            name: text_field(fields, "name"),
            email: text_field(fields, "email"),
            phone: text_field(fields, "phone"),
            city: text_field(fields, "city"),
            status: text_field(fields, "status"),
        }
    }

    pub fn to_sheet_row(&self, id: &str) -> SheetRow {
        SheetRow::new()
            .with(Self::ID_COLUMN, id)
            .with("DEALER NAME", &self.name)
            .with("EMAIL", &self.email)
            .with("PHONE", &self.phone)
            .with("CITY", &self.city)
            .with("STATUS", &self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BookingRecord {
    #[serde(default)]
    pub container_no: String,
    #[serde(default)]
    pub dealer_id: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub status: String,
}

impl BookingRecord {
    pub const ID_COLUMN: &'static str = "BOOKING ID";

    pub fn from_fields(fields: &Fields) -> Self {
        Self {
            container_no: text_field(fields, "container_no"),
            dealer_id: text_field(fields, "dealer_id"),
            customer_name: text_field(fields, "customer_name"),
            status: text_field(fields, "status"),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status.eq_ignore_ascii_case(BOOKING_STATUS_APPROVED)
    }

    pub fn to_sheet_row(&self, id: &str, dealer_name: &str) -> SheetRow {
        SheetRow::new()
            .with(Self::ID_COLUMN, id)
            .with(CONTAINER_NO_HEADER, &self.container_no)
            .with("DEALER", dealer_name)
            .with("CUSTOMER", &self.customer_name)
            .with("STATUS", &self.status)
    }
}

/// The container document a booking points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    pub container_no: String,
    pub sales_status: Option<String>,
}

impl InventoryItem {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            container_no: doc.id.clone(),
            sales_status: doc.str_field("sales_status").map(str::to_string),
        }
    }
}
