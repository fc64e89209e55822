//! Reconciliation passes, point-sync handlers, and the wiring that builds them from the environment.

pub mod normalize;
pub mod point_sync;
pub mod reconcile;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use mastersync_adapters::{
    DocumentStore, FileDocumentStore, FirestoreClient, GoogleSheetsClient, Spreadsheet,
};
use mastersync_core::{HeaderRules, HeaderRulesFile, FIRESTORE_MAX_BATCH_WRITES};
use mastersync_storage::{
    ApiClient, Authorization, HttpClientConfig, ServiceAccountKey, ServiceAccountTokens,
    QuotaConfig, DATASTORE_SCOPE, DRIVE_METADATA_READONLY_SCOPE, SPREADSHEETS_SCOPE,
};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub use normalize::{NormalizedSheet, RowNormalizer};
pub use point_sync::{ActionResult, FailurePolicy, PointSync, PointSyncOutcome, SheetTabs};
pub use reconcile::{PassOutcome, ReconcileConfig, ReconcileSummary, Reconciler};

pub const CRATE_NAME: &str = "mastersync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    File,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(Self::Firestore),
            "file" => Ok(Self::File),
            other => bail!("unknown store backend {other:?} (expected firestore or file)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub spreadsheet_id: String,
    pub tabs: SheetTabs,
    pub credentials_path: Option<PathBuf>,
    pub firestore_project_id: Option<String>,
    pub firestore_emulator_host: Option<String>,
    pub store: StoreBackend,
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub batch_size: usize,
    pub pass_timeout_secs: u64,
    pub header_rules_path: Option<PathBuf>,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let tabs = SheetTabs::default();
        Self {
            spreadsheet_id: get("MASTER_SHEET_ID").unwrap_or_default(),
            tabs: SheetTabs {
                master: get("MASTER_SHEET_TITLE").unwrap_or(tabs.master),
                dealers: get("DEALER_SHEET_TITLE").unwrap_or(tabs.dealers),
                bookings: get("BOOKING_SHEET_TITLE").unwrap_or(tabs.bookings),
            },
            credentials_path: get("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            firestore_project_id: get("FIRESTORE_PROJECT_ID"),
            firestore_emulator_host: get("FIRESTORE_EMULATOR_HOST"),
            store: get("MASTERSYNC_STORE")
                .and_then(|v| match v.parse() {
                    Ok(backend) => Some(backend),
                    Err(err) => {
                        warn!(%err, "falling back to the firestore backend");
                        None
                    }
                })
                .unwrap_or(StoreBackend::Firestore),
            data_dir: get("MASTERSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            scheduler_enabled: get("MASTERSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("MASTERSYNC_SYNC_CRON").unwrap_or_else(|| "0 */15 * * * *".to_string()),
            batch_size: get("MASTERSYNC_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(FIRESTORE_MAX_BATCH_WRITES),
            pass_timeout_secs: get("MASTERSYNC_PASS_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(540),
            header_rules_path: get("MASTERSYNC_HEADER_RULES").map(PathBuf::from),
            user_agent: format!("mastersync/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs.max(1))
    }
}

/// Header rules from a YAML file, or the built-in rules when no path is configured.
pub async fn load_header_rules(path: Option<&Path>) -> Result<HeaderRules> {
    let Some(path) = path else {
        return Ok(HeaderRules::default());
    };
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading header rules {}", path.display()))?;
    parse_header_rules(&text).with_context(|| format!("parsing header rules {}", path.display()))
}

pub fn parse_header_rules(yaml: &str) -> Result<HeaderRules> {
    let file: HeaderRulesFile = serde_yaml::from_str(yaml).context("decoding header rules yaml")?;
    if file.date.is_empty() {
        bail!("header rules must list at least one date column");
    }
    Ok(file.into())
}

pub struct Services {
    pub reconciler: Arc<Reconciler>,
    pub point_sync: Arc<PointSync>,
}

impl Services {
    pub fn new(
        config: &SyncConfig,
        rules: HeaderRules,
        sheet: Arc<dyn Spreadsheet>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let reconcile_config =
            ReconcileConfig::new(config.tabs.master.clone()).with_batch_size(config.batch_size);
        let reconciler = Reconciler::new(reconcile_config, Arc::new(rules), sheet.clone(), store.clone());
        let point_sync = PointSync::new(sheet, store, config.tabs.clone());
        Self {
            reconciler: Arc::new(reconciler),
            point_sync: Arc::new(point_sync),
        }
    }
}

/// Connects to Google Sheets and the configured document store.
pub async fn build_services(config: &SyncConfig) -> Result<Services> {
    if config.spreadsheet_id.trim().is_empty() {
        bail!("MASTER_SHEET_ID is not set");
    }
    let rules = load_header_rules(config.header_rules_path.as_deref()).await?;

    let credentials = config
        .credentials_path
        .as_ref()
        .ok_or_else(|| anyhow!("GOOGLE_APPLICATION_CREDENTIALS is not set"))?;
    let key = ServiceAccountKey::from_file(credentials)
        .await
        .context("loading service account key")?;

    let base_config = HttpClientConfig {
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    };
    let client = ApiClient::build_http_client(&base_config)?;

    let sheets_tokens = ServiceAccountTokens::new(
        key.clone(),
        &[SPREADSHEETS_SCOPE, DRIVE_METADATA_READONLY_SCOPE],
        client.clone(),
    );
    let sheets_api = ApiClient::with_client(
        client.clone(),
        HttpClientConfig {
            quota: Some(QuotaConfig::sheets_per_user_quota()),
            ..base_config.clone()
        },
        Authorization::ServiceAccount(Arc::new(sheets_tokens)),
    );
    let sheet: Arc<dyn Spreadsheet> = Arc::new(GoogleSheetsClient::new(
        Arc::new(sheets_api),
        config.spreadsheet_id.clone(),
    ));

    let store: Arc<dyn DocumentStore> = match config.store {
        StoreBackend::File => {
            info!(dir = %config.data_dir.display(), "using file document store");
            Arc::new(FileDocumentStore::new(config.data_dir.clone()))
        }
        StoreBackend::Firestore => {
            let project_id = config
                .firestore_project_id
                .clone()
                .or_else(|| key.project_id.clone())
                .ok_or_else(|| anyhow!("FIRESTORE_PROJECT_ID is not set and the key has no project_id"))?;
            match &config.firestore_emulator_host {
                Some(host) => {
                    info!(%host, "using firestore emulator");
                    let api = ApiClient::with_client(
                        client,
                        base_config,
                        Authorization::Bearer("owner".to_string()),
                    );
                    Arc::new(FirestoreClient::with_base(
                        Arc::new(api),
                        &format!("http://{host}/v1"),
                        &project_id,
                    ))
                }
                None => {
                    let tokens = ServiceAccountTokens::new(key, &[DATASTORE_SCOPE], client.clone());
                    let api = ApiClient::with_client(
                        client,
                        base_config,
                        Authorization::ServiceAccount(Arc::new(tokens)),
                    );
                    Arc::new(FirestoreClient::new(Arc::new(api), &project_id))
                }
            }
        }
    };

    Ok(Services::new(config, rules, sheet, store))
}

/// Runs one pass, abandoning it once `timeout` elapses. An abandoned pass leaves the
/// checkpoint where it was.
pub async fn run_pass_with_timeout(
    reconciler: &Reconciler,
    force: bool,
    timeout: Duration,
) -> Result<ReconcileSummary> {
    tokio::time::timeout(timeout, reconciler.run_once(force))
        .await
        .map_err(|_| anyhow!("reconciliation pass exceeded {}s", timeout.as_secs()))?
        .context("reconciliation pass failed")
}

pub async fn run_sync_once_from_env(force: bool) -> Result<ReconcileSummary> {
    let config = SyncConfig::from_env();
    let services = build_services(&config).await?;
    run_pass_with_timeout(&services.reconciler, force, config.pass_timeout()).await
}

/// A scheduler with one job that runs a pass on `cron`. A tick that lands while the
/// previous pass is still running is skipped.
pub async fn build_scheduler(
    reconciler: Arc<Reconciler>,
    cron: &str,
    timeout: Duration,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let reconciler = reconciler.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous reconciliation pass still running; skipping tick");
                return;
            };
            match run_pass_with_timeout(&reconciler, false, timeout).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    outcome = ?summary.outcome,
                    records = summary.records_written,
                    "scheduled pass finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled pass failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    reconciler: Arc<Reconciler>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(reconciler, &config.sync_cron, config.pass_timeout())
        .await
        .map(Some)
}
