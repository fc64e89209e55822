//! Periodic MASTER sheet -> container collection reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use mastersync_adapters::{DocumentStore, Spreadsheet, WriteOp, MAX_WRITES_PER_COMMIT};
use mastersync_core::{
    CanonicalRecord, HeaderRules, SyncCheckpoint, SyncError, CHECKPOINT_DOCUMENT_ID,
    CONTAINERS_COLLECTION, FIRESTORE_MAX_BATCH_WRITES, SYNC_METADATA_COLLECTION,
};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::normalize::RowNormalizer;

/// Checkpoint assumed before the first successful pass; any real sheet timestamp is newer.
pub fn sentinel_last_sync() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Sub-minute differences are ignored to absorb clock skew between the two services.
/// A sheet minute equal to the checkpoint minute counts as changed.
pub fn should_sync(sheet_modified_at: DateTime<Utc>, last_sync: Option<DateTime<Utc>>) -> bool {
    let last_sync = last_sync.unwrap_or_else(sentinel_last_sync);
    truncate_to_minute(sheet_modified_at) >= truncate_to_minute(last_sync)
}

/// Folds duplicate container numbers, later rows replacing earlier ones whole.
/// Output is ordered by container number.
pub fn dedupe_last_wins(records: impl IntoIterator<Item = CanonicalRecord>) -> Vec<CanonicalRecord> {
    let mut by_container: BTreeMap<String, CanonicalRecord> = BTreeMap::new();
    for record in records {
        by_container.insert(record.container_no.clone(), record);
    }
    by_container.into_values().collect()
}

pub fn chunk_records(records: &[CanonicalRecord], batch_size: usize) -> Vec<&[CanonicalRecord]> {
    records.chunks(batch_size.max(1)).collect()
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub sheet_title: String,
    pub collection: String,
    pub batch_size: usize,
}

impl ReconcileConfig {
    pub fn new(sheet_title: impl Into<String>) -> Self {
        Self {
            sheet_title: sheet_title.into(),
            collection: CONTAINERS_COLLECTION.to_string(),
            batch_size: FIRESTORE_MAX_BATCH_WRITES,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_WRITES_PER_COMMIT);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Unchanged,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub outcome: PassOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sheet_modified_at: DateTime<Utc>,
    pub previous_sync: Option<DateTime<Utc>>,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub records_written: usize,
    pub batches_committed: usize,
}

pub struct Reconciler {
    config: ReconcileConfig,
    rules: Arc<HeaderRules>,
    sheet: Arc<dyn Spreadsheet>,
    store: Arc<dyn DocumentStore>,
}

impl Reconciler {
    pub fn new(
        config: ReconcileConfig,
        rules: Arc<HeaderRules>,
        sheet: Arc<dyn Spreadsheet>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            rules,
            sheet,
            store,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn rules(&self) -> &HeaderRules {
        &self.rules
    }

    pub async fn read_checkpoint(&self) -> Result<Option<SyncCheckpoint>, SyncError> {
        let doc = self
            .store
            .get(SYNC_METADATA_COLLECTION, CHECKPOINT_DOCUMENT_ID)
            .await?;
        Ok(doc.and_then(|d| SyncCheckpoint::from_fields(&d.fields)))
    }

    async fn write_checkpoint(&self, last_sync: DateTime<Utc>) -> Result<(), SyncError> {
        let checkpoint = SyncCheckpoint {
            last_sync,
            sheet_title: self.config.sheet_title.clone(),
        };
        self.store
            .commit(vec![WriteOp::merge(
                SYNC_METADATA_COLLECTION,
                CHECKPOINT_DOCUMENT_ID,
                checkpoint.to_fields(),
            )])
            .await
    }

    /// One full pass. `force` skips the change detector. The checkpoint only advances
    /// after every batch has committed.
    pub async fn run_once(&self, force: bool) -> Result<ReconcileSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, sheet = %self.config.sheet_title);
        self.run_pass(run_id, force).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid, force: bool) -> Result<ReconcileSummary, SyncError> {
        let started_at = Utc::now();
        let (metadata, checkpoint) =
            tokio::try_join!(self.sheet.fetch_metadata(), self.read_checkpoint())?;
        let previous_sync = checkpoint.map(|c| c.last_sync);

        let mut summary = ReconcileSummary {
            run_id,
            outcome: PassOutcome::Unchanged,
            started_at,
            finished_at: started_at,
            sheet_modified_at: metadata.modified_at,
            previous_sync,
            rows_read: 0,
            rows_rejected: 0,
            records_written: 0,
            batches_committed: 0,
        };

        if !force && !should_sync(metadata.modified_at, previous_sync) {
            info!(
                sheet_modified_at = %metadata.modified_at,
                last_sync = ?previous_sync,
                "sheet unchanged since last sync; skipping pass"
            );
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let data = self.sheet.fetch_rows(&self.config.sheet_title).await?;
        summary.rows_read = data.rows.len();

        let normalizer = RowNormalizer::new(self.rules.clone(), started_at.year());
        let normalized = normalizer.normalize_sheet(&data);
        summary.rows_rejected = normalized.rejected_rows;

        let records = dedupe_last_wins(normalized.records);
        let batches = chunk_records(&records, self.config.batch_size);
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let writes = batch
                .iter()
                .map(|r| WriteOp::merge(&self.config.collection, &r.container_no, r.fields.clone()))
                .collect();
            if let Err(err) = self.store.commit(writes).await {
                error!(
                    batch = index,
                    batches = batch_count,
                    committed = summary.records_written,
                    %err,
                    "batch commit failed; checkpoint not advanced"
                );
                return Err(SyncError::Commit(format!(
                    "batch {} of {batch_count}: {err}",
                    index + 1
                )));
            }
            summary.batches_committed += 1;
            summary.records_written += batch.len();
        }

        self.write_checkpoint(started_at).await?;
        summary.outcome = PassOutcome::Completed;
        summary.finished_at = Utc::now();
        info!(
            rows_read = summary.rows_read,
            rows_rejected = summary.rows_rejected,
            records_written = summary.records_written,
            batches = summary.batches_committed,
            "reconciliation pass completed"
        );
        Ok(summary)
    }
}
