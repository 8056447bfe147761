//! Reconciliation run orchestration: load, merge, upsert, report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use caliber_ingest::{ingest, load_raw_batch, LoadError};
use caliber_store::{BackoffPolicy, DocumentStore, JsonDirStore, StoreError};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod reconcile;

pub use reconcile::{
    ErrorReport, ErrorSink, ReconcileError, ReconcileOutcome, ReconcileReport,
    ReconciliationError, UpsertReconciler,
};

pub const CRATE_NAME: &str = "caliber-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub raw_path: PathBuf,
    pub store_dir: PathBuf,
    pub collection: String,
    pub reports_dir: PathBuf,
    pub concurrency: usize,
    pub store_timeout_secs: u64,
    pub max_retries: usize,
    pub export_parsed: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            raw_path: std::env::var("CALIBER_RAW_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_raw_path(Local::now().date_naive())),
            store_dir: std::env::var("CALIBER_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
            collection: std::env::var("CALIBER_COLLECTION").unwrap_or_else(|_| "watches".to_string()),
            reports_dir: std::env::var("CALIBER_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            concurrency: std::env::var("CALIBER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            store_timeout_secs: std::env::var("CALIBER_STORE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_retries: std::env::var("CALIBER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            export_parsed: std::env::var("CALIBER_EXPORT_PARSED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }
}

/// Crawler output for `day`: `output/raw-YYYY-MM-DD.json`.
pub fn default_raw_path(day: NaiveDate) -> PathBuf {
    PathBuf::from("./output").join(format!("raw-{}.json", day.format("%Y-%m-%d")))
}

/// The run could not start; nothing has been read or written.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("no raw input available: {0}")]
    RawInput(#[from] LoadError),
    #[error("opening document store: {0}")]
    Store(#[source] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_observations: usize,
    pub skipped_observations: usize,
    pub entities: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline<S> {
    config: SyncConfig,
    reconciler: UpsertReconciler<S>,
}

impl<S: DocumentStore + 'static> SyncPipeline<S> {
    pub fn new(config: SyncConfig, store: Arc<S>) -> Self {
        let reconciler = UpsertReconciler::new(store)
            .with_backoff(config.backoff())
            .with_call_timeout(Duration::from_secs(config.store_timeout_secs.max(1)));
        Self { config, reconciler }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &UpsertReconciler<S> {
        &self.reconciler
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let raw = load_raw_batch(&self.config.raw_path).map_err(InitializationError::from)?;
        let raw_observations = raw.len();

        let merged = ingest(raw);
        let entities = merged.entities.len();
        let skipped_observations = merged.skipped.len();
        info!(
            raw = raw_observations,
            entities,
            skipped = skipped_observations,
            "merged raw batch"
        );

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut files = Vec::new();
        if self.config.export_parsed {
            files.push(write_report_file(&reports_dir, "parsed", &merged.entities).await?);
        }
        files.push(write_report_file(&reports_dir, "skipped", &merged.skipped).await?);

        let report = self
            .reconciler
            .reconcile_all(merged.entities, self.config.concurrency)
            .await;
        let (created, updated, unchanged) = (report.created, report.updated, report.unchanged);
        let failed = report.errors.len();
        info!(
            created,
            updated,
            unchanged,
            failed,
            appended_prices = report.appended_prices,
            hydrated_fields = report.hydrated_fields,
            "reconciliation finished"
        );

        let errors = report.errors.into_report(run_id);
        files.push(write_report_file(&reports_dir, "errors", &errors).await?);

        let manifest = ReportManifest {
            schema_version: 1,
            run_id,
            files,
        };
        let manifest_path = reports_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            raw_observations,
            skipped_observations,
            entities,
            created,
            updated,
            unchanged,
            failed,
            reports_dir: reports_dir.display().to_string(),
        })
    }
}

async fn write_report_file<T: Serialize>(
    reports_dir: &Path,
    name: &str,
    value: &T,
) -> Result<ReportManifestFile> {
    let file_name = format!("{name}.json");
    let path = reports_dir.join(&file_name);
    let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {file_name}"))?;
    fs::write(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: file_name,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

pub async fn open_json_dir_store(config: &SyncConfig) -> Result<JsonDirStore, InitializationError> {
    JsonDirStore::open(&config.store_dir, &config.collection)
        .await
        .map_err(InitializationError::Store)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = open_json_dir_store(&config).await?;
    SyncPipeline::new(config, Arc::new(store)).run_once().await
}
