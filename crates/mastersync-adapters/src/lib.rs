//! Spreadsheet and document store contracts, plus Google, file-backed and in-memory implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mastersync_core::{
    header_key, Document, FieldValue, Fields, SheetData, SheetMetadata, SheetRow, SyncError,
};
use mastersync_storage::{ApiClient, ApiError, JsonFileStore, Method, RetryMode, Url};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mastersync-adapters";

/// Hard per-commit limit of the hosted document store.
pub const MAX_WRITES_PER_COMMIT: usize = 500;

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const FIRESTORE_API_BASE: &str = "https://firestore.googleapis.com/v1";

/// Outcome of an upsert against a spreadsheet tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowWrite {
    /// Existing data row (0-based, header excluded) was overwritten.
    Updated(usize),
    Appended,
}

#[async_trait]
pub trait Spreadsheet: Send + Sync {
    /// Header and all data rows of one tab. A missing tab or header row is an error.
    async fn fetch_rows(&self, tab: &str) -> Result<SheetData, SyncError>;

    /// Name and last-modified time of the whole spreadsheet.
    async fn fetch_metadata(&self) -> Result<SheetMetadata, SyncError>;

    /// Overwrites the cells named in `row` on the row whose `key_column` matches, or appends.
    async fn upsert_row(&self, tab: &str, key_column: &str, row: &SheetRow) -> Result<RowWrite, SyncError>;

    /// Removes the row whose `key_column` equals `key`. Returns whether a row was removed.
    async fn delete_row(&self, tab: &str, key_column: &str, key: &str) -> Result<bool, SyncError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create-or-merge: provided fields overwrite, other stored fields are kept.
    Merge {
        collection: String,
        id: String,
        fields: Fields,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn merge(collection: &str, id: &str, fields: Fields) -> Self {
        Self::Merge {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        }
    }

    pub fn delete(collection: &str, id: &str) -> Self {
        Self::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SyncError>;

    /// Applies all writes atomically: either every write lands or none does.
    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), SyncError>;
}

fn check_commit_size(writes: &[WriteOp]) -> Result<(), SyncError> {
    if writes.len() > MAX_WRITES_PER_COMMIT {
        return Err(SyncError::Commit(format!(
            "batch of {} writes exceeds the {MAX_WRITES_PER_COMMIT} write limit",
            writes.len()
        )));
    }
    Ok(())
}

type Collections = BTreeMap<String, BTreeMap<String, Fields>>;

fn apply_writes(collections: &mut Collections, writes: Vec<WriteOp>) {
    for write in writes {
        match write {
            WriteOp::Merge {
                collection,
                id,
                fields,
            } => {
                collections
                    .entry(collection)
                    .or_default()
                    .entry(id)
                    .or_default()
                    .extend(fields);
            }
            WriteOp::Delete { collection, id } => {
                if let Some(docs) = collections.get_mut(&collection) {
                    docs.remove(&id);
                }
            }
        }
    }
}

fn lookup(collections: &Collections, collection: &str, id: &str) -> Option<Document> {
    collections
        .get(collection)
        .and_then(|docs| docs.get(id))
        .map(|fields| Document {
            id: id.to_string(),
            fields: fields.clone(),
        })
}

/// Index of the column whose header derives to the same key as `name`.
pub fn column_index(header: &[String], name: &str) -> Option<usize> {
    let wanted = header_key(name);
    header.iter().position(|h| header_key(h) == wanted)
}

/// Position of the first data row whose `key_column` cell equals `key` (trimmed).
pub fn find_row(data: &SheetData, key_column: &str, key: &str) -> Option<usize> {
    let column = column_index(&data.header, key_column)?;
    let header = &data.header[column];
    let key = key.trim();
    data.rows
        .iter()
        .position(|row| row.get(header).map(str::trim) == Some(key))
}

/// Cell values of `row` laid out in header order; unknown columns are dropped with a warning.
pub fn align_row(header: &[String], row: &SheetRow) -> Vec<String> {
    let mut values = vec![String::new(); header.len()];
    for (name, value) in row.cells() {
        match column_index(header, name) {
            Some(i) => values[i] = value.clone(),
            None => warn!(column = %name, "column not present in sheet header; skipping"),
        }
    }
    values
}

fn key_of<'a>(row: &'a SheetRow, key_column: &str) -> Result<&'a str, SyncError> {
    row.cells()
        .iter()
        .find(|(h, _)| header_key(h) == header_key(key_column))
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SyncError::Config(format!("row has no value for key column {key_column}")))
}

/// Spreadsheet column letters for a 0-based index: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

pub fn quote_tab(tab: &str) -> String {
    format!("'{}'", tab.replace('\'', "''"))
}

/// A1 reference for a 0-based column and 1-based sheet row.
pub fn a1_cell(tab: &str, column: usize, sheet_row: usize) -> String {
    format!("{}!{}{}", quote_tab(tab), column_letter(column), sheet_row)
}

/// In-memory spreadsheet used by tests and dry runs.
#[derive(Debug)]
pub struct MemorySpreadsheet {
    name: String,
    state: Mutex<MemorySheetState>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

#[derive(Debug)]
struct MemorySheetState {
    tabs: BTreeMap<String, SheetData>,
    modified_at: DateTime<Utc>,
    reads: usize,
    writes: usize,
}

impl MemorySpreadsheet {
    pub fn new(name: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemorySheetState {
                tabs: BTreeMap::new(),
                modified_at,
                reads: 0,
                writes: 0,
            }),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn with_tab(self, tab: &str, header: &[&str], rows: &[&[&str]]) -> Self {
        let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
        let rows = rows
            .iter()
            .map(|values| {
                let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                SheetRow::from_header_and_values(&header, &values)
            })
            .collect();
        self.lock().tabs.insert(tab.to_string(), SheetData { header, rows });
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySheetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_modified_at(&self, modified_at: DateTime<Utc>) {
        self.lock().modified_at = modified_at;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn tab(&self, tab: &str) -> Option<SheetData> {
        self.lock().tabs.get(tab).cloned()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("spreadsheet unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Spreadsheet for MemorySpreadsheet {
    async fn fetch_rows(&self, tab: &str) -> Result<SheetData, SyncError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("spreadsheet unavailable".to_string()));
        }
        let mut state = self.lock();
        state.reads += 1;
        state
            .tabs
            .get(tab)
            .cloned()
            .ok_or_else(|| SyncError::Access(format!("tab {tab} does not exist")))
    }

    async fn fetch_metadata(&self) -> Result<SheetMetadata, SyncError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("spreadsheet unavailable".to_string()));
        }
        Ok(SheetMetadata {
            name: self.name.clone(),
            modified_at: self.lock().modified_at,
        })
    }

    async fn upsert_row(&self, tab: &str, key_column: &str, row: &SheetRow) -> Result<RowWrite, SyncError> {
        self.check_writable()?;
        let key = key_of(row, key_column)?.to_string();
        let mut state = self.lock();
        let data = state
            .tabs
            .get_mut(tab)
            .ok_or_else(|| SyncError::Access(format!("tab {tab} does not exist")))?;

        let outcome = match find_row(data, key_column, &key) {
            Some(index) => {
                let header = data.header.clone();
                let target = &mut data.rows[index];
                for (name, value) in row.cells() {
                    match column_index(&header, name) {
                        Some(i) => target.insert(header[i].clone(), value.clone()),
                        None => warn!(column = %name, "column not present in sheet header; skipping"),
                    }
                }
                RowWrite::Updated(index)
            }
            None => {
                let values = align_row(&data.header, row);
                let appended = SheetRow::from_header_and_values(&data.header, &values);
                data.rows.push(appended);
                RowWrite::Appended
            }
        };
        state.writes += 1;
        state.modified_at = Utc::now();
        Ok(outcome)
    }

    async fn delete_row(&self, tab: &str, key_column: &str, key: &str) -> Result<bool, SyncError> {
        self.check_writable()?;
        let mut state = self.lock();
        let data = state
            .tabs
            .get_mut(tab)
            .ok_or_else(|| SyncError::Access(format!("tab {tab} does not exist")))?;
        let Some(index) = find_row(data, key_column, key) else {
            return Ok(false);
        };
        data.rows.remove(index);
        state.writes += 1;
        state.modified_at = Utc::now();
        Ok(true)
    }
}

/// In-memory document store that records every commit.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryStoreState>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    collections: Collections,
    commits: Vec<Vec<WriteOp>>,
    commit_attempts: usize,
    fail_commit_attempt: Option<usize>,
    fail_reads: bool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Fields> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn collection_len(&self, collection: &str) -> usize {
        self.lock().collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Writes of each successful commit, in commit order.
    pub fn commits(&self) -> Vec<Vec<WriteOp>> {
        self.lock().commits.clone()
    }

    /// Makes the commit attempt with this 0-based index (counted across all calls) fail.
    pub fn fail_commit_attempt(&self, attempt: usize) {
        self.lock().fail_commit_attempt = Some(attempt);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SyncError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(SyncError::Transport("document store unavailable".to_string()));
        }
        Ok(lookup(&state.collections, collection, id))
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), SyncError> {
        check_commit_size(&writes)?;
        let mut state = self.lock();
        let attempt = state.commit_attempts;
        state.commit_attempts += 1;
        if state.fail_commit_attempt == Some(attempt) {
            return Err(SyncError::Commit(format!("injected failure on commit {attempt}")));
        }
        apply_writes(&mut state.collections, writes.clone());
        state.commits.push(writes);
        Ok(())
    }
}

/// Document store persisted as one JSON file, replaced atomically on every commit.
#[derive(Debug)]
pub struct FileDocumentStore {
    files: JsonFileStore,
    write_lock: tokio::sync::Mutex<()>,
}

const DOCUMENTS_FILE: &str = "documents";

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            files: JsonFileStore::new(root),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Collections, SyncError> {
        self.files
            .read_json::<Collections>(DOCUMENTS_FILE)
            .await
            .map(Option::unwrap_or_default)
            .map_err(|err| SyncError::Access(format!("{err:#}")))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SyncError> {
        let collections = self.load().await?;
        Ok(lookup(&collections, collection, id))
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), SyncError> {
        check_commit_size(&writes)?;
        let _guard = self.write_lock.lock().await;
        let mut collections = self.load().await?;
        apply_writes(&mut collections, writes);
        self.files
            .write_json_atomic(DOCUMENTS_FILE, &collections)
            .await
            .map_err(|err| SyncError::Commit(format!("{err:#}")))?;
        Ok(())
    }
}

fn sheets_error(err: ApiError) -> SyncError {
    if err.is_access_denied() {
        SyncError::Access(err.to_string())
    } else {
        SyncError::Transport(err.to_string())
    }
}

fn url_with_segments(base: &str, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url = Url::parse(base).map_err(|err| SyncError::Config(format!("bad base url {base}: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Config(format!("base url {base} cannot carry a path")))?
        .extend(segments);
    Ok(url)
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parses a Sheets `values.get` response; the first row is the header.
pub fn parse_values_response(tab: &str, body: &JsonValue) -> Result<SheetData, SyncError> {
    let mut rows = body
        .get("values")
        .and_then(JsonValue::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect::<Vec<_>>())
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter();

    let header: Vec<String> = rows
        .next()
        .filter(|h| h.iter().any(|c| !c.trim().is_empty()))
        .ok_or_else(|| SyncError::Access(format!("tab {tab} has no header row")))?;
    let rows = rows
        .map(|values| SheetRow::from_header_and_values(&header, &values))
        .collect();
    Ok(SheetData { header, rows })
}

/// Google Sheets v4 + Drive v3 metadata client for one spreadsheet.
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    api: Arc<ApiClient>,
    spreadsheet_id: String,
    sheets_base: String,
    drive_base: String,
}

impl GoogleSheetsClient {
    pub fn new(api: Arc<ApiClient>, spreadsheet_id: impl Into<String>) -> Self {
        Self {
            api,
            spreadsheet_id: spreadsheet_id.into(),
            sheets_base: SHEETS_API_BASE.to_string(),
            drive_base: DRIVE_API_BASE.to_string(),
        }
    }

    pub fn with_bases(mut self, sheets_base: impl Into<String>, drive_base: impl Into<String>) -> Self {
        self.sheets_base = sheets_base.into();
        self.drive_base = drive_base.into();
        self
    }

    async fn sheet_numeric_id(&self, tab: &str) -> Result<i64, SyncError> {
        let url = url_with_segments(&self.sheets_base, &[&self.spreadsheet_id])?;
        let body = self
            .api
            .send_json(
                Method::GET,
                url.as_str(),
                &[("fields", "sheets.properties(sheetId,title)")],
                None,
                RetryMode::Idempotent,
            )
            .await
            .map_err(sheets_error)?;
        body.get("sheets")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|sheet| sheet.get("properties"))
            .find(|props| props.get("title").and_then(JsonValue::as_str) == Some(tab))
            .and_then(|props| props.get("sheetId").and_then(JsonValue::as_i64))
            .ok_or_else(|| SyncError::Access(format!("tab {tab} does not exist")))
    }
}

#[async_trait]
impl Spreadsheet for GoogleSheetsClient {
    async fn fetch_rows(&self, tab: &str) -> Result<SheetData, SyncError> {
        let range = quote_tab(tab);
        let url = url_with_segments(&self.sheets_base, &[&self.spreadsheet_id, "values", &range])?;
        let body = self
            .api
            .send_json(Method::GET, url.as_str(), &[("majorDimension", "ROWS")], None, RetryMode::Idempotent)
            .await
            .map_err(sheets_error)?;
        let data = parse_values_response(tab, &body)?;
        debug!(tab, rows = data.rows.len(), "fetched sheet rows");
        Ok(data)
    }

    async fn fetch_metadata(&self) -> Result<SheetMetadata, SyncError> {
        let url = url_with_segments(&self.drive_base, &["files", &self.spreadsheet_id])?;
        let body = self
            .api
            .send_json(
                Method::GET,
                url.as_str(),
                &[("fields", "name,modifiedTime"), ("supportsAllDrives", "true")],
                None,
                RetryMode::Idempotent,
            )
            .await
            .map_err(sheets_error)?;
        let modified = body
            .get("modifiedTime")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SyncError::Access("drive metadata has no modifiedTime".to_string()))?;
        let modified_at = DateTime::parse_from_rfc3339(modified)
            .map_err(|err| SyncError::Parse {
                column: "modifiedTime".to_string(),
                message: err.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(SheetMetadata {
            name: body
                .get("name")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            modified_at,
        })
    }

    async fn upsert_row(&self, tab: &str, key_column: &str, row: &SheetRow) -> Result<RowWrite, SyncError> {
        let key = key_of(row, key_column)?;
        let data = self.fetch_rows(tab).await?;

        if let Some(index) = find_row(&data, key_column, key) {
            let sheet_row = index + 2;
            let updates: Vec<JsonValue> = row
                .cells()
                .iter()
                .filter_map(|(name, value)| match column_index(&data.header, name) {
                    Some(column) => Some(json!({
                        "range": a1_cell(tab, column, sheet_row),
                        "values": [[value]],
                    })),
                    None => {
                        warn!(column = %name, tab, "column not present in sheet header; skipping");
                        None
                    }
                })
                .collect();
            let url = url_with_segments(
                &self.sheets_base,
                &[&self.spreadsheet_id, "values:batchUpdate"],
            )?;
            self.api
                .send_json(
                    Method::POST,
                    url.as_str(),
                    &[],
                    Some(&json!({ "valueInputOption": "USER_ENTERED", "data": updates })),
                    RetryMode::Idempotent,
                )
                .await
                .map_err(sheets_error)?;
            return Ok(RowWrite::Updated(index));
        }

        let values = align_row(&data.header, row);
        let range = format!("{}!A1:append", quote_tab(tab));
        let url = url_with_segments(&self.sheets_base, &[&self.spreadsheet_id, "values", &range])?;
        self.api
            .send_json(
                Method::POST,
                url.as_str(),
                &[("valueInputOption", "USER_ENTERED"), ("insertDataOption", "INSERT_ROWS")],
                Some(&json!({ "values": [values] })),
                RetryMode::ThrottleOnly,
            )
            .await
            .map_err(sheets_error)?;
        Ok(RowWrite::Appended)
    }

    async fn delete_row(&self, tab: &str, key_column: &str, key: &str) -> Result<bool, SyncError> {
        let data = self.fetch_rows(tab).await?;
        let Some(index) = find_row(&data, key_column, key) else {
            return Ok(false);
        };
        let sheet_id = self.sheet_numeric_id(tab).await?;
        let url = url_with_segments(
            &self.sheets_base,
            &[&format!("{}:batchUpdate", self.spreadsheet_id)],
        )?;
        self.api
            .send_json(
                Method::POST,
                url.as_str(),
                &[],
                Some(&json!({
                    "requests": [{
                        "deleteDimension": {
                            "range": {
                                "sheetId": sheet_id,
                                "dimension": "ROWS",
                                "startIndex": index + 1,
                                "endIndex": index + 2,
                            }
                        }
                    }]
                })),
                RetryMode::ThrottleOnly,
            )
            .await
            .map_err(sheets_error)?;
        Ok(true)
    }
}

/// Firestore REST client; every set carries an update mask so writes merge.
#[derive(Debug, Clone)]
pub struct FirestoreClient {
    api: Arc<ApiClient>,
    base: String,
    database_path: String,
}

impl FirestoreClient {
    pub fn new(api: Arc<ApiClient>, project_id: &str) -> Self {
        Self::with_base(api, FIRESTORE_API_BASE, project_id)
    }

    /// `base` is e.g. `http://localhost:8080/v1` for the local emulator.
    pub fn with_base(api: Arc<ApiClient>, base: &str, project_id: &str) -> Self {
        Self {
            api,
            base: base.trim_end_matches('/').to_string(),
            database_path: format!("projects/{project_id}/databases/(default)/documents"),
        }
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.database_path)
    }

    pub fn encode_write(&self, write: &WriteOp) -> JsonValue {
        match write {
            WriteOp::Merge {
                collection,
                id,
                fields,
            } => json!({
                "update": {
                    "name": self.document_name(collection, id),
                    "fields": encode_fields(fields),
                },
                "updateMask": {
                    "fieldPaths": fields.keys().map(|k| field_path(k)).collect::<Vec<_>>(),
                },
            }),
            WriteOp::Delete { collection, id } => json!({
                "delete": self.document_name(collection, id),
            }),
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, SyncError> {
        let mut segments: Vec<&str> = self.database_path.split('/').collect();
        segments.push(collection);
        segments.push(id);
        let url = url_with_segments(&self.base, &segments)?;
        match self.api.send_json(Method::GET, url.as_str(), &[], None, RetryMode::Idempotent).await {
            Ok(body) => Ok(Some(Document {
                id: id.to_string(),
                fields: decode_fields(body.get("fields")),
            })),
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) if err.is_access_denied() => Err(SyncError::Access(err.to_string())),
            Err(err) => Err(SyncError::Transport(err.to_string())),
        }
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), SyncError> {
        check_commit_size(&writes)?;
        if writes.is_empty() {
            return Ok(());
        }
        let url = format!("{}/{}:commit", self.base, self.database_path);
        let body = json!({
            "writes": writes.iter().map(|w| self.encode_write(w)).collect::<Vec<_>>(),
        });
        self.api
            .send_json(Method::POST, &url, &[], Some(&body), RetryMode::Idempotent)
            .await
            .map_err(|err| SyncError::Commit(err.to_string()))?;
        Ok(())
    }
}

/// Field path segment, backquoted unless it is a plain identifier.
pub fn field_path(name: &str) -> String {
    let mut chars = name.chars();
    let simple = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

pub fn encode_value(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Number(n) => json!({ "doubleValue": n }),
        FieldValue::Boolean(b) => json!({ "booleanValue": b }),
        FieldValue::Date(d) => json!({ "timestampValue": d.to_rfc3339() }),
    }
}

pub fn encode_fields(fields: &Fields) -> JsonValue {
    let map: JsonMap<String, JsonValue> = fields
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect();
    JsonValue::Object(map)
}

pub fn decode_value(value: &JsonValue) -> Option<FieldValue> {
    if let Some(s) = value.get("stringValue").and_then(JsonValue::as_str) {
        return Some(FieldValue::String(s.to_string()));
    }
    if let Some(b) = value.get("booleanValue").and_then(JsonValue::as_bool) {
        return Some(FieldValue::Boolean(b));
    }
    if let Some(n) = value.get("doubleValue") {
        return n
            .as_f64()
            .or_else(|| n.as_str().and_then(|s| s.parse().ok()))
            .map(FieldValue::Number);
    }
    if let Some(n) = value.get("integerValue") {
        return n
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| n.as_i64())
            .map(|i| FieldValue::Number(i as f64));
    }
    if let Some(ts) = value.get("timestampValue").and_then(JsonValue::as_str) {
        return DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|d| FieldValue::Date(d.with_timezone(&Utc)));
    }
    None
}

pub fn decode_fields(fields: Option<&JsonValue>) -> Fields {
    fields
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| decode_value(v).map(|v| (k.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mastersync_storage::{Authorization, HttpClientConfig};
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn dealer_sheet() -> MemorySpreadsheet {
        MemorySpreadsheet::new("MASTER", ts("2026-03-01T10:00:00Z")).with_tab(
            "DEALERS",
            &["DEALER ID", "DEALER NAME", "CITY", "NOTES"],
            &[&["d1", "Acme", "Pune", "keep me"], &["d2", "Zen", "Goa", ""]],
        )
    }

    #[test]
    fn column_letters_roll_over_after_z() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(a1_cell("Dealer's", 2, 5), "'Dealer''s'!C5");
    }

    #[tokio::test]
    async fn upsert_overwrites_only_designated_columns() {
        let sheet = dealer_sheet();
        let row = SheetRow::new()
            .with("DEALER ID", "d1")
            .with("Dealer Name", "Acme Motors")
            .with("CITY", "Mumbai");
        let outcome = sheet.upsert_row("DEALERS", "DEALER ID", &row).await.expect("upsert");
        assert_eq!(outcome, RowWrite::Updated(0));

        let tab = sheet.tab("DEALERS").expect("tab");
        assert_eq!(tab.rows[0].get("DEALER NAME"), Some("Acme Motors"));
        assert_eq!(tab.rows[0].get("CITY"), Some("Mumbai"));
        assert_eq!(tab.rows[0].get("NOTES"), Some("keep me"));
        assert_eq!(tab.rows.len(), 2);
    }

    #[tokio::test]
    async fn upsert_appends_when_key_is_missing() {
        let sheet = dealer_sheet();
        let row = SheetRow::new().with("DEALER ID", "d3").with("CITY", "Delhi").with("UNKNOWN", "x");
        let outcome = sheet.upsert_row("DEALERS", "DEALER ID", &row).await.expect("upsert");
        assert_eq!(outcome, RowWrite::Appended);

        let tab = sheet.tab("DEALERS").expect("tab");
        assert_eq!(tab.rows.len(), 3);
        assert_eq!(tab.rows[2].get("DEALER ID"), Some("d3"));
        assert_eq!(tab.rows[2].get("DEALER NAME"), Some(""));
        assert_eq!(tab.rows[2].get("UNKNOWN"), None);
    }

    #[tokio::test]
    async fn delete_of_absent_row_is_not_an_error() {
        let sheet = dealer_sheet();
        assert!(sheet.delete_row("DEALERS", "DEALER ID", "d2").await.expect("delete"));
        assert!(!sheet.delete_row("DEALERS", "DEALER ID", "d2").await.expect("delete again"));
        assert_eq!(sheet.tab("DEALERS").expect("tab").rows.len(), 1);
    }

    #[tokio::test]
    async fn missing_tab_is_an_access_error() {
        let sheet = dealer_sheet();
        let err = sheet.fetch_rows("NOPE").await.expect_err("missing tab");
        assert!(matches!(err, SyncError::Access(_)));
    }

    #[test]
    fn values_response_without_header_is_rejected() {
        let err = parse_values_response("MASTER", &json!({ "range": "MASTER!A1:Z1000" }))
            .expect_err("empty tab");
        assert!(matches!(err, SyncError::Access(_)));

        let data = parse_values_response(
            "MASTER",
            &json!({ "values": [["CONTAINER NO", "QTY"], ["C1", 5], ["C2"]] }),
        )
        .expect("values");
        assert_eq!(data.header, vec!["CONTAINER NO", "QTY"]);
        assert_eq!(data.rows[0].get("QTY"), Some("5"));
        assert_eq!(data.rows[1].get("QTY"), Some(""));
    }

    #[tokio::test]
    async fn memory_store_merges_fields_and_fails_on_injected_attempt() {
        let store = MemoryDocumentStore::new();
        store.insert(
            "containers",
            "C1",
            Fields::from([("vin".to_string(), FieldValue::string("X1"))]),
        );
        store
            .commit(vec![WriteOp::merge(
                "containers",
                "C1",
                Fields::from([("qty".to_string(), FieldValue::Number(7.0))]),
            )])
            .await
            .expect("commit");
        let doc = store.document("containers", "C1").expect("doc");
        assert_eq!(doc.get("vin"), Some(&FieldValue::string("X1")));
        assert_eq!(doc.get("qty"), Some(&FieldValue::Number(7.0)));

        store.fail_commit_attempt(1);
        let err = store
            .commit(vec![WriteOp::delete("containers", "C1")])
            .await
            .expect_err("injected");
        assert!(matches!(err, SyncError::Commit(_)));
        assert!(store.document("containers", "C1").is_some());
        assert_eq!(store.commits().len(), 1);
    }

    #[tokio::test]
    async fn oversized_commit_is_rejected() {
        let store = MemoryDocumentStore::new();
        let writes = (0..=MAX_WRITES_PER_COMMIT)
            .map(|i| WriteOp::delete("containers", &format!("C{i}")))
            .collect();
        assert!(matches!(store.commit(writes).await, Err(SyncError::Commit(_))));
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        let store = FileDocumentStore::new(dir.path());
        store
            .commit(vec![
                WriteOp::merge(
                    "bookings",
                    "b1",
                    Fields::from([("status".to_string(), FieldValue::string("Approved"))]),
                ),
                WriteOp::merge(
                    "containers",
                    "C9",
                    Fields::from([("sales_status".to_string(), FieldValue::string("Blocked"))]),
                ),
            ])
            .await
            .expect("commit");

        let reopened = FileDocumentStore::new(dir.path());
        let booking = reopened.get("bookings", "b1").await.expect("get").expect("doc");
        assert_eq!(booking.str_field("status"), Some("Approved"));
        assert!(reopened.get("bookings", "missing").await.expect("get").is_none());
    }

    #[test]
    fn firestore_values_encode_and_decode() {
        let date = ts("2026-08-25T00:00:00Z");
        let fields = Fields::from([
            ("eta".to_string(), FieldValue::Date(date)),
            ("qty".to_string(), FieldValue::Number(1234.0)),
            ("paid".to_string(), FieldValue::Boolean(true)),
            ("vin".to_string(), FieldValue::not_available()),
        ]);
        let encoded = encode_fields(&fields);
        assert_eq!(encoded["qty"], json!({ "doubleValue": 1234.0 }));
        assert_eq!(decode_fields(Some(&encoded)), fields);
        assert_eq!(
            decode_value(&json!({ "integerValue": "42" })),
            Some(FieldValue::Number(42.0))
        );
        assert_eq!(decode_value(&json!({ "nullValue": null })), None);
    }

    #[test]
    fn firestore_merge_write_carries_update_mask() {
        let api = Arc::new(
            ApiClient::new(HttpClientConfig::default(), Authorization::None).expect("client"),
        );
        let client = FirestoreClient::new(api, "dealer-app");
        let write = client.encode_write(&WriteOp::merge(
            "containers",
            "C1",
            Fields::from([
                ("s.no".to_string(), FieldValue::string("1")),
                ("qty".to_string(), FieldValue::Number(5.0)),
            ]),
        ));
        assert_eq!(
            write["update"]["name"],
            "projects/dealer-app/databases/(default)/documents/containers/C1"
        );
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["qty", "`s.no`"]));
    }
}
