use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{
    Config, SchedulerConfig, SnapshotBackendKind, TableNames, WarehouseBackendKind,
};
use crate::entity::Entity;
use crate::extract::{ExtractionReport, Extractor};
use crate::ledger::Ledger;
use crate::load::{LoadReport, Loader};
use crate::reports::ReportCounts;
use crate::snapshot::{BlobStore, FileBlobStore, MemoryBlobStore, SnapshotStore};
use crate::source::{Fetcher, HttpFetcher};
use crate::transform::{TransformReport, TransformSummary, Transformer};
use crate::warehouse::memory::InMemoryWarehouse;
use crate::warehouse::postgres::PostgresWarehouse;
use crate::warehouse::{TableLayout, Warehouse};
use crate::watermark::WatermarkStore;

const DEFAULT_SNAPSHOT_ROOT: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureReport {
    /// Tables verified or created, ledger first.
    pub tables: Vec<String>,
}

/// Everything one run did, stage by stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub infrastructure: InfrastructureReport,
    pub extraction: ExtractionReport,
    pub transform: BTreeMap<Entity, TransformSummary>,
    pub load: LoadReport,
    pub reports: ReportCounts,
}

impl RunReport {
    /// True when no entity failed at any stage.
    pub fn is_complete(&self) -> bool {
        self.extraction.failed().is_empty()
            && self
                .transform
                .values()
                .all(|t| !matches!(t, TransformSummary::Failed { .. }))
            && self.load.failed().is_empty()
    }
}

/// Run `task` until it succeeds, retrying up to `policy.retries` times with a
/// fixed delay in between.
pub async fn with_retries<T, F, Fut>(name: &str, policy: &SchedulerConfig, mut task: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match task().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.retries => {
                attempt += 1;
                tracing::warn!(
                    task = name,
                    attempt,
                    retries = policy.retries,
                    error = %format!("{:#}", e),
                    "Task failed; retrying",
                );
                tokio::time::sleep(std::time::Duration::from_secs(policy.retry_delay_secs)).await;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "Task {} failed after {} attempt(s)",
                    name,
                    attempt + 1
                )))
            }
        }
    }
}

/// The five sequential tasks wired to one warehouse, snapshot store and
/// fetcher.
pub struct Pipeline {
    warehouse: Arc<dyn Warehouse>,
    tables: TableNames,
    scheduler: SchedulerConfig,
    extractor: Extractor,
    transformer: Transformer,
    loader: Loader,
}

impl Pipeline {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        blobs: Arc<dyn BlobStore>,
        fetcher: Arc<dyn Fetcher>,
        cfg: &Config,
    ) -> Self {
        let tables = cfg.warehouse.tables.clone();
        let watermarks =
            WatermarkStore::new(warehouse.clone(), tables.clone(), cfg.warehouse.on_probe_error);
        let snapshots = SnapshotStore::new(blobs);
        let ledger = Ledger::new(warehouse.clone(), tables.ledger.clone());

        Self {
            extractor: Extractor::new(
                fetcher,
                snapshots.clone(),
                watermarks.clone(),
                ledger,
                cfg.sources.clone(),
            ),
            transformer: Transformer::new(snapshots, watermarks.clone()),
            loader: Loader::new(warehouse.clone(), watermarks, tables.clone()),
            warehouse,
            tables,
            scheduler: cfg.scheduler.clone(),
        }
    }

    /// Build the configured backends and an HTTP fetcher.
    pub async fn from_config(cfg: &Config) -> Result<Self> {
        let warehouse: Arc<dyn Warehouse> = match cfg.warehouse.backend {
            WarehouseBackendKind::Memory => Arc::new(InMemoryWarehouse::new()),
            WarehouseBackendKind::Postgres => {
                let pg = cfg
                    .warehouse
                    .postgres
                    .as_ref()
                    .context("warehouse.postgres is required for the postgres backend")?;
                Arc::new(
                    PostgresWarehouse::connect(
                        pg,
                        &cfg.warehouse.dataset,
                        cfg.warehouse.project.as_deref(),
                    )
                    .await?,
                )
            }
        };

        let blobs: Arc<dyn BlobStore> = match cfg.snapshots.backend {
            SnapshotBackendKind::File => {
                let root = cfg
                    .snapshots
                    .root
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_ROOT));
                Arc::new(FileBlobStore::new(root))
            }
            SnapshotBackendKind::Memory => Arc::new(MemoryBlobStore::new()),
        };

        Ok(Self::new(warehouse, blobs, Arc::new(HttpFetcher::new()?), cfg))
    }

    /// Create the dataset, the ledger and the six ingestion tables.
    pub async fn setup_infrastructure(&self) -> Result<InfrastructureReport> {
        self.warehouse
            .ensure_dataset()
            .await
            .context("Failed to create dataset")?;

        let mut layouts = vec![(self.tables.ledger.clone(), TableLayout::Ledger)];
        for entity in Entity::ALL {
            layouts.push((self.tables.target(entity).to_string(), TableLayout::Target(entity)));
            layouts.push((self.tables.staging(entity).to_string(), TableLayout::Staging(entity)));
        }

        for (table, layout) in &layouts {
            self.warehouse
                .ensure_table(table, *layout)
                .await
                .with_context(|| format!("Failed to create table {}", table))?;
        }
        tracing::info!(tables = layouts.len(), "Infrastructure ready");

        Ok(InfrastructureReport {
            tables: layouts.into_iter().map(|(t, _)| t).collect(),
        })
    }

    pub async fn extract(&self, now: DateTime<Utc>) -> Result<ExtractionReport> {
        Ok(self.extractor.extract_all(now).await)
    }

    pub async fn transform(&self, extraction: &ExtractionReport) -> Result<TransformReport> {
        Ok(self.transformer.transform_all(extraction, Utc::now()).await)
    }

    pub async fn load(&self, transformed: &TransformReport) -> Result<LoadReport> {
        Ok(self.loader.load_all(transformed).await)
    }

    /// Rebuild the report tables from the current targets.
    pub async fn analyze(&self) -> Result<ReportCounts> {
        let counts = self
            .warehouse
            .rebuild_reports(&self.tables)
            .await
            .context("Failed to rebuild report tables")?;
        tracing::info!(
            user_summary = counts.user_summary,
            category_summary = counts.category_summary,
            cart_details = counts.cart_details,
            "Reports rebuilt",
        );
        Ok(counts)
    }

    pub async fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    /// Run the five tasks in order, each under the retry policy.
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> Result<RunReport> {
        let policy = &self.scheduler;

        let infrastructure =
            with_retries("setup_infrastructure", policy, || self.setup_infrastructure()).await?;
        let extraction = with_retries("extract", policy, || self.extract(started_at)).await?;
        let transformed = with_retries("transform", policy, || self.transform(&extraction)).await?;
        let load = with_retries("load", policy, || self.load(&transformed)).await?;
        let reports = with_retries("analyze", policy, || self.analyze()).await?;

        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            infrastructure,
            extraction,
            transform: transformed
                .entities
                .iter()
                .map(|(entity, outcome)| (*entity, outcome.summary()))
                .collect(),
            load,
            reports,
        })
    }
}

/// Run the pipeline once against freshly built backends.
pub async fn run_once(cfg: &Config) -> Result<RunReport> {
    let pipeline = Pipeline::from_config(cfg).await?;
    let report = pipeline.run().await?;
    log_run(&report);
    Ok(report)
}

/// Run daemon mode: repeatedly run the pipeline at a fixed interval.
pub async fn run_daemon(cfg: &Config, interval_secs: u64) -> Result<()> {
    use tokio::time::{interval, Duration};

    let pipeline = Pipeline::from_config(cfg).await?;
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        ticker.tick().await;

        tracing::info!("Starting pipeline run");
        match pipeline.run().await {
            Ok(report) => log_run(&report),
            Err(e) => tracing::error!(error = %format!("{:#}", e), "Pipeline run failed"),
        }
    }
}

fn log_run(report: &RunReport) {
    if report.is_complete() {
        tracing::info!(
            records = report.load.total_records(),
            "Pipeline run completed successfully",
        );
    } else {
        tracing::warn!(
            records = report.load.total_records(),
            extract_failed = ?report.extraction.failed(),
            load_failed = ?report.load.failed(),
            "Pipeline run completed with failures",
        );
    }
}
