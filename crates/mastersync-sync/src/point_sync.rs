//! Single-entity sync: dealer and booking mirrors, booking approval and deletion.

use std::sync::Arc;

use chrono::Utc;
use mastersync_adapters::{find_row, DocumentStore, RowWrite, Spreadsheet, WriteOp};
use mastersync_core::{
    BookingRecord, DealerRecord, DocumentChange, FieldValue, Fields, InventoryItem, SheetRow,
    SyncError, BOOKINGS_COLLECTION, BOOKING_STATUS_APPROVED, CONTAINERS_COLLECTION,
    CONTAINER_NO_HEADER, DEALERS_COLLECTION, NOT_AVAILABLE, SALES_STATUS_AVAILABLE,
    SALES_STATUS_BLOCKED,
};
use serde::Serialize;
use tracing::{error, info, warn};

const SALES_STATUS_HEADER: &str = "SALES STATUS";

/// What a handler does with a failure once it reaches the handler boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Propagate,
    /// Log the error and report `PointSyncOutcome::Failed` instead of returning it.
    LogAndContinue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PointSyncOutcome {
    Updated { row: usize },
    Appended,
    Deleted { found: bool },
    Failed { message: String },
}

impl From<RowWrite> for PointSyncOutcome {
    fn from(write: RowWrite) -> Self {
        match write {
            RowWrite::Updated(row) => Self::Updated { row },
            RowWrite::Appended => Self::Appended,
        }
    }
}

/// Result returned to an interactive caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    /// False when the documents were committed but the spreadsheet edit failed.
    pub sheet_synced: bool,
}

impl ActionResult {
    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
            sheet_synced: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SheetTabs {
    pub master: String,
    pub dealers: String,
    pub bookings: String,
}

impl Default for SheetTabs {
    fn default() -> Self {
        Self {
            master: "MASTER".to_string(),
            dealers: "DEALERS".to_string(),
            bookings: "BOOKINGS".to_string(),
        }
    }
}

pub struct PointSync {
    sheet: Arc<dyn Spreadsheet>,
    store: Arc<dyn DocumentStore>,
    tabs: SheetTabs,
    event_policy: FailurePolicy,
}

impl PointSync {
    pub fn new(sheet: Arc<dyn Spreadsheet>, store: Arc<dyn DocumentStore>, tabs: SheetTabs) -> Self {
        Self {
            sheet,
            store,
            tabs,
            event_policy: FailurePolicy::LogAndContinue,
        }
    }

    pub fn with_event_policy(mut self, policy: FailurePolicy) -> Self {
        self.event_policy = policy;
        self
    }

    fn apply_policy(
        &self,
        what: &str,
        id: &str,
        result: Result<PointSyncOutcome, SyncError>,
    ) -> Result<PointSyncOutcome, SyncError> {
        match (result, self.event_policy) {
            (Ok(outcome), _) => Ok(outcome),
            (Err(err), FailurePolicy::LogAndContinue) => {
                error!(what, id, %err, "point sync failed; continuing");
                Ok(PointSyncOutcome::Failed {
                    message: err.to_string(),
                })
            }
            (Err(err), FailurePolicy::Propagate) => Err(err),
        }
    }

    pub async fn sync_dealer_change(
        &self,
        change: &DocumentChange<DealerRecord>,
    ) -> Result<PointSyncOutcome, SyncError> {
        let result = match &change.after {
            Some(dealer) => self
                .sheet
                .upsert_row(&self.tabs.dealers, DealerRecord::ID_COLUMN, &dealer.to_sheet_row(&change.id))
                .await
                .map(PointSyncOutcome::from),
            None => self
                .sheet
                .delete_row(&self.tabs.dealers, DealerRecord::ID_COLUMN, &change.id)
                .await
                .map(|found| PointSyncOutcome::Deleted { found }),
        };
        self.apply_policy("dealer", &change.id, result)
    }

    pub async fn sync_booking_change(
        &self,
        change: &DocumentChange<BookingRecord>,
    ) -> Result<PointSyncOutcome, SyncError> {
        let result = match &change.after {
            Some(booking) => self.mirror_booking(&change.id, booking).await,
            None => self
                .sheet
                .delete_row(&self.tabs.bookings, BookingRecord::ID_COLUMN, &change.id)
                .await
                .map(|found| PointSyncOutcome::Deleted { found }),
        };
        self.apply_policy("booking", &change.id, result)
    }

    async fn dealer_name(&self, dealer_id: &str) -> Result<String, SyncError> {
        if dealer_id.is_empty() {
            return Ok(String::new());
        }
        let name = self
            .store
            .get(DEALERS_COLLECTION, dealer_id)
            .await?
            .map(|doc| DealerRecord::from_fields(&doc.fields).name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| dealer_id.to_string());
        Ok(name)
    }

    async fn mirror_booking(&self, id: &str, booking: &BookingRecord) -> Result<PointSyncOutcome, SyncError> {
        let dealer = self.dealer_name(&booking.dealer_id).await?;
        self.sheet
            .upsert_row(&self.tabs.bookings, BookingRecord::ID_COLUMN, &booking.to_sheet_row(id, &dealer))
            .await
            .map(PointSyncOutcome::from)
    }

    /// Sets SALES STATUS on the container's MASTER row; a container without a row is left alone.
    async fn mark_master_row(&self, container_no: &str, sales_status: &str) -> Result<(), SyncError> {
        let master = self.sheet.fetch_rows(&self.tabs.master).await?;
        if find_row(&master, CONTAINER_NO_HEADER, container_no).is_none() {
            warn!(container_no, "container has no MASTER row; sales status not mirrored");
            return Ok(());
        }
        let row = SheetRow::new()
            .with(CONTAINER_NO_HEADER, container_no)
            .with(SALES_STATUS_HEADER, sales_status);
        self.sheet
            .upsert_row(&self.tabs.master, CONTAINER_NO_HEADER, &row)
            .await?;
        Ok(())
    }

    async fn load_booking(&self, booking_id: &str) -> Result<BookingRecord, SyncError> {
        let doc = self
            .store
            .get(BOOKINGS_COLLECTION, booking_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("booking {booking_id}")))?;
        Ok(BookingRecord::from_fields(&doc.fields))
    }

    async fn approve_documents(&self, booking_id: &str) -> Result<(BookingRecord, String), SyncError> {
        let mut booking = self.load_booking(booking_id).await?;
        if booking.container_no.is_empty() {
            return Err(SyncError::NotFound(format!(
                "booking {booking_id} does not reference a container"
            )));
        }

        let (container, dealer) = tokio::try_join!(
            self.store.get(CONTAINERS_COLLECTION, &booking.container_no),
            self.dealer_name(&booking.dealer_id),
        )?;
        let container_doc = container
            .ok_or_else(|| SyncError::NotFound(format!("container {}", booking.container_no)))?;
        let container = InventoryItem::from_document(&container_doc);
        if container.sales_status.as_deref() == Some(SALES_STATUS_BLOCKED) {
            match container_doc.str_field("booking_id") {
                Some(holder) if holder != booking_id && holder != NOT_AVAILABLE && !holder.is_empty() => {
                    return Err(SyncError::Conflict(format!(
                        "container {} is already blocked by booking {holder}",
                        container.container_no
                    )));
                }
                Some(_) => {}
                None => warn!(
                    container_no = %container.container_no,
                    "container blocked with no recorded booking; approving"
                ),
            }
        }

        let now = Utc::now();
        self.store
            .commit(vec![
                WriteOp::merge(
                    BOOKINGS_COLLECTION,
                    booking_id,
                    Fields::from([
                        ("status".to_string(), FieldValue::string(BOOKING_STATUS_APPROVED)),
                        ("approved_at".to_string(), FieldValue::Date(now)),
                    ]),
                ),
                WriteOp::merge(
                    CONTAINERS_COLLECTION,
                    &container.container_no,
                    Fields::from([
                        ("sales_status".to_string(), FieldValue::string(SALES_STATUS_BLOCKED)),
                        ("booking_id".to_string(), FieldValue::string(booking_id)),
                    ]),
                ),
            ])
            .await?;
        booking.status = BOOKING_STATUS_APPROVED.to_string();
        Ok((booking, dealer))
    }

    /// Booking -> Approved and container -> Blocked in one atomic commit, then the sheet.
    /// A sheet failure after the commit is reported as partial success, not rolled back.
    pub async fn approve_booking(&self, booking_id: &str) -> ActionResult {
        let (booking, dealer) = match self.approve_documents(booking_id).await {
            Ok(approved) => approved,
            Err(err) => {
                error!(booking_id, %err, "booking approval failed");
                return ActionResult::failed(format!("Failed to approve booking: {err}"));
            }
        };
        info!(booking_id, container_no = %booking.container_no, "booking approved");

        let sheet_result = async {
            self.sheet
                .upsert_row(
                    &self.tabs.bookings,
                    BookingRecord::ID_COLUMN,
                    &booking.to_sheet_row(booking_id, &dealer),
                )
                .await?;
            self.mark_master_row(&booking.container_no, SALES_STATUS_BLOCKED).await
        }
        .await;

        match sheet_result {
            Ok(()) => ActionResult {
                success: true,
                message: format!("Booking {booking_id} approved"),
                sheet_synced: true,
            },
            Err(err) => {
                error!(booking_id, %err, "booking approved but spreadsheet update failed");
                ActionResult {
                    success: true,
                    message: format!(
                        "Booking {booking_id} approved, but the spreadsheet could not be updated: {err}"
                    ),
                    sheet_synced: false,
                }
            }
        }
    }

    async fn delete_documents(&self, booking_id: &str) -> Result<(BookingRecord, bool), SyncError> {
        let booking = self.load_booking(booking_id).await?;
        let mut writes = vec![WriteOp::delete(BOOKINGS_COLLECTION, booking_id)];

        let mut released = false;
        if booking.is_approved() && !booking.container_no.is_empty() {
            let container = self
                .store
                .get(CONTAINERS_COLLECTION, &booking.container_no)
                .await?;
            if container.is_some() {
                writes.push(WriteOp::merge(
                    CONTAINERS_COLLECTION,
                    &booking.container_no,
                    Fields::from([
                        ("sales_status".to_string(), FieldValue::string(SALES_STATUS_AVAILABLE)),
                        ("booking_id".to_string(), FieldValue::not_available()),
                    ]),
                ));
                released = true;
            }
        }

        self.store.commit(writes).await?;
        Ok((booking, released))
    }

    /// Deletes the booking (releasing its container when approved), then its sheet row.
    pub async fn delete_booking(&self, booking_id: &str) -> ActionResult {
        let (booking, released) = match self.delete_documents(booking_id).await {
            Ok(deleted) => deleted,
            Err(err) => {
                error!(booking_id, %err, "booking deletion failed");
                return ActionResult::failed(format!("Failed to delete booking: {err}"));
            }
        };
        info!(booking_id, released, "booking deleted");

        let sheet_result = async {
            self.sheet
                .delete_row(&self.tabs.bookings, BookingRecord::ID_COLUMN, booking_id)
                .await?;
            if released {
                self.mark_master_row(&booking.container_no, SALES_STATUS_AVAILABLE)
                    .await?;
            }
            Ok::<_, SyncError>(())
        }
        .await;

        match sheet_result {
            Ok(()) => ActionResult {
                success: true,
                message: format!("Booking {booking_id} deleted"),
                sheet_synced: true,
            },
            Err(err) => {
                error!(booking_id, %err, "booking deleted but spreadsheet update failed");
                ActionResult {
                    success: true,
                    message: format!(
                        "Booking {booking_id} deleted, but the spreadsheet could not be updated: {err}"
                    ),
                    sheet_synced: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use mastersync_adapters::{MemoryDocumentStore, MemorySpreadsheet};

    fn now_minus_hour() -> DateTime<Utc> {
        Utc::now() - Duration::hours(1)
    }

    fn sheet() -> Arc<MemorySpreadsheet> {
        Arc::new(
            MemorySpreadsheet::new("Dealer MASTER", now_minus_hour())
                .with_tab(
                    "MASTER",
                    &["CONTAINER NO", "ETA", "SALES STATUS"],
                    &[&["C9", "01-Jan", "Available"]],
                )
                .with_tab(
                    "DEALERS",
                    &["DEALER ID", "DEALER NAME", "EMAIL", "PHONE", "CITY", "STATUS"],
                    &[&["d1", "Acme", "a@acme.test", "1", "Pune", "Active"]],
                )
                .with_tab(
                    "BOOKINGS",
                    &["BOOKING ID", "CONTAINER NO", "DEALER", "CUSTOMER", "STATUS"],
                    &[],
                ),
        )
    }

    fn store() -> Arc<MemoryDocumentStore> {
        let store = Arc::new(MemoryDocumentStore::new());
        store.insert(
            BOOKINGS_COLLECTION,
            "b1",
            Fields::from([
                ("container_no".to_string(), FieldValue::string("C9")),
                ("dealer_id".to_string(), FieldValue::string("d1")),
                ("customer_name".to_string(), FieldValue::string("R. Rao")),
                ("status".to_string(), FieldValue::string("Pending")),
            ]),
        );
        store.insert(
            CONTAINERS_COLLECTION,
            "C9",
            Fields::from([("sales_status".to_string(), FieldValue::string("Available"))]),
        );
        store.insert(
            DEALERS_COLLECTION,
            "d1",
            Fields::from([("name".to_string(), FieldValue::string("Acme"))]),
        );
        store
    }

    fn point_sync(sheet: &Arc<MemorySpreadsheet>, store: &Arc<MemoryDocumentStore>) -> PointSync {
        PointSync::new(sheet.clone(), store.clone(), SheetTabs::default())
    }

    #[tokio::test]
    async fn dealer_upsert_updates_existing_row_and_appends_new() {
        let sheet = sheet();
        let sync = point_sync(&sheet, &store());
        let mut dealer = DealerRecord {
            name: "Acme Motors".into(),
            city: "Mumbai".into(),
            ..Default::default()
        };

        let change = DocumentChange {
            id: "d1".to_string(),
            before: None,
            after: Some(dealer.clone()),
        };
        assert_eq!(
            sync.sync_dealer_change(&change).await.expect("sync"),
            PointSyncOutcome::Updated { row: 0 }
        );

        dealer.name = "Zen Cars".into();
        let change = DocumentChange {
            id: "d2".to_string(),
            before: None,
            after: Some(dealer),
        };
        assert_eq!(
            sync.sync_dealer_change(&change).await.expect("sync"),
            PointSyncOutcome::Appended
        );

        let tab = sheet.tab("DEALERS").expect("tab");
        assert_eq!(tab.rows[0].get("DEALER NAME"), Some("Acme Motors"));
        assert_eq!(tab.rows[1].get("DEALER ID"), Some("d2"));
    }

    #[tokio::test]
    async fn dealer_delete_without_row_is_not_an_error() {
        let sheet = sheet();
        let sync = point_sync(&sheet, &store());
        let change: DocumentChange<DealerRecord> = DocumentChange {
            id: "ghost".to_string(),
            before: Some(DealerRecord::default()),
            after: None,
        };
        assert_eq!(
            sync.sync_dealer_change(&change).await.expect("sync"),
            PointSyncOutcome::Deleted { found: false }
        );
    }

    #[tokio::test]
    async fn failure_policy_decides_whether_sheet_errors_escape() {
        let sheet = sheet();
        sheet.set_fail_writes(true);
        let store = store();
        let change = DocumentChange {
            id: "d1".to_string(),
            before: None,
            after: Some(DealerRecord::default()),
        };

        let swallowing = point_sync(&sheet, &store);
        assert!(matches!(
            swallowing.sync_dealer_change(&change).await,
            Ok(PointSyncOutcome::Failed { .. })
        ));

        let propagating = point_sync(&sheet, &store).with_event_policy(FailurePolicy::Propagate);
        assert!(propagating.sync_dealer_change(&change).await.is_err());
    }

    #[tokio::test]
    async fn booking_change_mirrors_row_with_dealer_name() {
        let sheet = sheet();
        let sync = point_sync(&sheet, &store());
        let change = DocumentChange {
            id: "b7".to_string(),
            before: None,
            after: Some(BookingRecord {
                container_no: "C9".into(),
                dealer_id: "d1".into(),
                customer_name: "K. Iyer".into(),
                status: "Pending".into(),
            }),
        };
        sync.sync_booking_change(&change).await.expect("sync");
        let tab = sheet.tab("BOOKINGS").expect("tab");
        assert_eq!(tab.rows[0].get("DEALER"), Some("Acme"));
        assert_eq!(tab.rows[0].get("STATUS"), Some("Pending"));
    }

    #[tokio::test]
    async fn approval_commits_both_documents_then_updates_sheet() {
        let sheet = sheet();
        let store = store();
        let result = point_sync(&sheet, &store).approve_booking("b1").await;

        assert!(result.success, "{}", result.message);
        assert!(result.sheet_synced);
        let booking = store.document(BOOKINGS_COLLECTION, "b1").expect("booking");
        assert_eq!(booking["status"], FieldValue::string("Approved"));
        let container = store.document(CONTAINERS_COLLECTION, "C9").expect("container");
        assert_eq!(container["sales_status"], FieldValue::string("Blocked"));
        assert_eq!(store.commits().len(), 1);
        assert_eq!(store.commits()[0].len(), 2);

        let bookings = sheet.tab("BOOKINGS").expect("tab");
        assert_eq!(bookings.rows[0].get("STATUS"), Some("Approved"));
        let master = sheet.tab("MASTER").expect("tab");
        assert_eq!(master.rows[0].get("SALES STATUS"), Some("Blocked"));
    }

    #[tokio::test]
    async fn approval_refuses_a_container_blocked_by_another_booking() {
        let sheet = sheet();
        let store = store();
        store.insert(
            CONTAINERS_COLLECTION,
            "C9",
            Fields::from([
                ("sales_status".to_string(), FieldValue::string("Blocked")),
                ("booking_id".to_string(), FieldValue::string("b2")),
            ]),
        );
        let result = point_sync(&sheet, &store).approve_booking("b1").await;

        assert!(!result.success);
        assert!(result.message.contains("b2"), "{}", result.message);
        assert!(store.commits().is_empty());
        assert_eq!(sheet.write_count(), 0);
        let booking = store.document(BOOKINGS_COLLECTION, "b1").expect("booking");
        assert_eq!(booking["status"], FieldValue::string("Pending"));
        let container = store.document(CONTAINERS_COLLECTION, "C9").expect("container");
        assert_eq!(container["booking_id"], FieldValue::string("b2"));
    }

    #[tokio::test]
    async fn approval_takes_a_blocked_container_with_no_holder() {
        let sheet = sheet();
        let store = store();
        store.insert(
            CONTAINERS_COLLECTION,
            "C9",
            Fields::from([
                ("sales_status".to_string(), FieldValue::string("Blocked")),
                ("booking_id".to_string(), FieldValue::not_available()),
            ]),
        );
        let result = point_sync(&sheet, &store).approve_booking("b1").await;

        assert!(result.success, "{}", result.message);
        let container = store.document(CONTAINERS_COLLECTION, "C9").expect("container");
        assert_eq!(container["booking_id"], FieldValue::string("b1"));
    }

    #[tokio::test]
    async fn approval_reports_partial_success_when_sheet_fails() {
        let sheet = sheet();
        sheet.set_fail_writes(true);
        let store = store();
        let result = point_sync(&sheet, &store).approve_booking("b1").await;

        assert!(result.success);
        assert!(!result.sheet_synced);
        assert!(result.message.contains("could not be updated"));
        let container = store.document(CONTAINERS_COLLECTION, "C9").expect("container");
        assert_eq!(container["sales_status"], FieldValue::string("Blocked"));
    }

    #[tokio::test]
    async fn failed_commit_never_touches_sheet() {
        let sheet = sheet();
        let store = store();
        store.fail_commit_attempt(0);
        let result = point_sync(&sheet, &store).approve_booking("b1").await;

        assert!(!result.success);
        assert!(result.message.starts_with("Failed to approve booking"));
        assert_eq!(sheet.write_count(), 0);
        let booking = store.document(BOOKINGS_COLLECTION, "b1").expect("booking");
        assert_eq!(booking["status"], FieldValue::string("Pending"));
    }

    #[tokio::test]
    async fn approving_unknown_booking_fails_with_message() {
        let sheet = sheet();
        let result = point_sync(&sheet, &store()).approve_booking("nope").await;
        assert!(!result.success);
        assert!(result.message.contains("booking nope"));
    }

    #[tokio::test]
    async fn deleting_approved_booking_releases_container() {
        let sheet = sheet();
        let store = store();
        let sync = point_sync(&sheet, &store);
        assert!(sync.approve_booking("b1").await.success);

        let result = sync.delete_booking("b1").await;
        assert!(result.success, "{}", result.message);
        assert!(result.sheet_synced);
        assert!(store.document(BOOKINGS_COLLECTION, "b1").is_none());
        let container = store.document(CONTAINERS_COLLECTION, "C9").expect("container");
        assert_eq!(container["sales_status"], FieldValue::string("Available"));
        assert!(sheet.tab("BOOKINGS").expect("tab").rows.is_empty());
        assert_eq!(
            sheet.tab("MASTER").expect("tab").rows[0].get("SALES STATUS"),
            Some("Available")
        );
    }

    #[tokio::test]
    async fn deleting_pending_booking_leaves_container_alone() {
        let sheet = sheet();
        let store = store();
        let result = point_sync(&sheet, &store).delete_booking("b1").await;
        assert!(result.success);
        assert_eq!(store.commits()[0].len(), 1);
        let container = store.document(CONTAINERS_COLLECTION, "C9").expect("container");
        assert_eq!(container["sales_status"], FieldValue::string("Available"));
    }
}
