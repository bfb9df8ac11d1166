use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::SourcesConfig;
use crate::entity::Entity;
use crate::ledger::{Ledger, LedgerEntry, LedgerWrite};
use crate::snapshot::{SnapshotKind, SnapshotStore};
use crate::source::{fetch_collection, record_count, Fetcher};
use crate::watermark::WatermarkStore;

/// Per-entity result of the extract stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Extracted {
        snapshot_path: String,
        record_count: usize,
        is_first_run: bool,
        last_successful_run: Option<DateTime<Utc>>,
        ledger: LedgerWrite,
    },
    Failed {
        error: String,
        ledger: LedgerWrite,
    },
}

impl ExtractionOutcome {
    #[cfg(test)]
    pub fn snapshot_path(&self) -> Option<&str> {
        match self {
            ExtractionOutcome::Extracted { snapshot_path, .. } => Some(snapshot_path),
            ExtractionOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExtractionOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub run_timestamp: DateTime<Utc>,
    /// `YYYYmmdd_HHMMSS` label shared by every snapshot of the run.
    pub run_label: String,
    pub entities: BTreeMap<Entity, ExtractionOutcome>,
}

impl ExtractionReport {
    pub fn failed(&self) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(e, _)| *e)
            .collect()
    }
}

pub fn run_label(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Fetches every entity's full collection, snapshots it and records the
/// attempt in the ledger.
#[derive(Clone)]
pub struct Extractor {
    fetcher: Arc<dyn Fetcher>,
    snapshots: SnapshotStore,
    watermarks: WatermarkStore,
    ledger: Ledger,
    sources: SourcesConfig,
}

impl Extractor {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        snapshots: SnapshotStore,
        watermarks: WatermarkStore,
        ledger: Ledger,
        sources: SourcesConfig,
    ) -> Self {
        Self {
            fetcher,
            snapshots,
            watermarks,
            ledger,
            sources,
        }
    }

    /// Extract all entities concurrently. Never fails as a whole; each
    /// entity's outcome is reported separately.
    pub async fn extract_all(&self, now: DateTime<Utc>) -> ExtractionReport {
        let label = run_label(now);
        let outcomes = join_all(
            Entity::ALL
                .iter()
                .map(|&entity| self.extract_entity(entity, now, &label)),
        )
        .await;

        let entities: BTreeMap<Entity, ExtractionOutcome> =
            Entity::ALL.into_iter().zip(outcomes).collect();

        let failed = entities.values().filter(|o| o.is_failed()).count();
        tracing::info!(
            run = %label,
            extracted = entities.len() - failed,
            failed,
            "Extraction finished",
        );

        ExtractionReport {
            run_timestamp: now,
            run_label: label,
            entities,
        }
    }

    pub async fn extract_entity(
        &self,
        entity: Entity,
        now: DateTime<Utc>,
        run_label: &str,
    ) -> ExtractionOutcome {
        let last_successful_run = self.watermarks.get_last_successful_status(entity).await;
        let is_first_run = self.watermarks.is_first_run(entity).await;
        match last_successful_run {
            Some(ts) if !is_first_run => {
                tracing::info!(entity = %entity, last_success = %ts, "Incremental extraction");
            }
            _ => {
                tracing::info!(entity = %entity, "First run; extracting baseline");
            }
        }

        let source = self.sources.get(entity);
        let payload = match fetch_collection(self.fetcher.as_ref(), entity, source).await {
            Ok(p) => p,
            Err(e) => return self.fail(entity, now, format!("{:#}", e)).await,
        };
        let count = record_count(&payload, entity);
        tracing::info!(entity = %entity, records = count, "Fetched collection");

        let kind = SnapshotKind::for_first_run(is_first_run);
        let snapshot_path = match self.snapshots.write(entity, kind, run_label, &payload).await {
            Ok(path) => path,
            Err(e) => return self.fail(entity, now, format!("{:#}", e)).await,
        };

        let ledger = self
            .ledger
            .append(&LedgerEntry::extracted(entity, now, count as u64))
            .await;

        ExtractionOutcome::Extracted {
            snapshot_path,
            record_count: count,
            is_first_run,
            last_successful_run,
            ledger,
        }
    }

    async fn fail(&self, entity: Entity, now: DateTime<Utc>, error: String) -> ExtractionOutcome {
        tracing::error!(entity = %entity, error = %error, "Extraction failed");
        let ledger = self
            .ledger
            .append(&LedgerEntry::failed(entity, now, error.clone()))
            .await;
        ExtractionOutcome::Failed { error, ledger }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::CellValue;
    use crate::config::{ProbeErrorPolicy, TableNames};
    use crate::snapshot::MemoryBlobStore;
    use crate::test_support::*;
    use crate::warehouse::memory::InMemoryWarehouse;
    use crate::warehouse::{TableLayout, Warehouse};
    use chrono::TimeZone;
    use serde_json::json;

    struct Harness {
        warehouse: InMemoryWarehouse,
        blobs: MemoryBlobStore,
        fetcher: Arc<StubFetcher>,
        extractor: Extractor,
    }

    async fn harness() -> anyhow::Result<Harness> {
        let warehouse = InMemoryWarehouse::new();
        warehouse.ensure_dataset().await?;
        warehouse
            .ensure_table("pipeline_metadata", TableLayout::Ledger)
            .await?;
        let wh: Arc<dyn Warehouse> = Arc::new(warehouse.clone());
        let blobs = MemoryBlobStore::new();
        let fetcher = Arc::new(StubFetcher::new());

        let extractor = Extractor::new(
            fetcher.clone(),
            SnapshotStore::new(Arc::new(blobs.clone())),
            WatermarkStore::new(wh.clone(), TableNames::default(), ProbeErrorPolicy::SkipEntity),
            Ledger::new(wh, "pipeline_metadata"),
            stub_sources(),
        );
        Ok(Harness {
            warehouse,
            blobs,
            fetcher,
            extractor,
        })
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn run_label_is_compact_utc_timestamp() {
        assert_eq!(run_label(at()), "20250301_093000");
    }

    #[tokio::test]
    async fn first_run_writes_baseline_snapshots_and_ledger_rows() -> anyhow::Result<()> {
        let h = harness().await?;
        h.fetcher
            .respond(Entity::Users, payload(Entity::Users, vec![user_json(1, "Emily", "Phoenix")]));
        h.fetcher.respond(Entity::Products, payload(Entity::Products, vec![]));
        h.fetcher.respond(Entity::Carts, json!({ "total": 0 }));

        let report = h.extractor.extract_all(at()).await;
        assert!(report.failed().is_empty());

        let users = &report.entities[&Entity::Users];
        assert_eq!(users.snapshot_path(), Some("raw_users/baseline_20250301_093000.json"));
        assert!(matches!(
            users,
            ExtractionOutcome::Extracted { record_count: 1, is_first_run: true, .. }
        ));
        // A missing entity array is zero records, not a failure.
        assert!(matches!(
            report.entities[&Entity::Carts],
            ExtractionOutcome::Extracted { record_count: 0, .. }
        ));

        assert_eq!(h.blobs.paths().len(), 3);
        assert_eq!(h.warehouse.rows("pipeline_metadata").map(|r| r.len()), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_and_recorded() -> anyhow::Result<()> {
        let h = harness().await?;
        h.fetcher.respond(Entity::Users, payload(Entity::Users, vec![]));
        h.fetcher.respond(Entity::Products, payload(Entity::Products, vec![]));
        h.fetcher.fail(Entity::Carts);

        let report = h.extractor.extract_all(at()).await;
        assert_eq!(report.failed(), vec![Entity::Carts]);
        match &report.entities[&Entity::Carts] {
            ExtractionOutcome::Failed { error, ledger } => {
                assert!(error.contains("connection refused"));
                assert!(ledger.is_written());
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(h.blobs.paths().len(), 2);

        let rows = h.warehouse.rows("pipeline_metadata").unwrap_or_default();
        let failed: Vec<_> = rows
            .iter()
            .filter(|r| r.get(3) == Some(&CellValue::Text("FAILED".into())))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].get(0), Some(&CellValue::Text("carts".into())));
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_collision_fails_the_entity() -> anyhow::Result<()> {
        let h = harness().await?;
        for entity in Entity::ALL {
            h.fetcher.respond(entity, payload(entity, vec![]));
        }
        h.extractor.extract_all(at()).await;

        // Same second, same paths: snapshots are immutable.
        let report = h.extractor.extract_all(at()).await;
        assert_eq!(report.failed().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_ledger_does_not_block_extraction() -> anyhow::Result<()> {
        let h = harness().await?;
        h.warehouse.inject_failure("pipeline_metadata");
        for entity in Entity::ALL {
            h.fetcher.respond(entity, payload(entity, vec![]));
        }

        let report = h.extractor.extract_all(at()).await;
        assert!(report.failed().is_empty());
        for outcome in report.entities.values() {
            assert!(matches!(
                outcome,
                ExtractionOutcome::Extracted {
                    ledger: LedgerWrite::Skipped { .. },
                    is_first_run: true,
                    ..
                }
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn report_serialises_for_the_next_task() -> anyhow::Result<()> {
        let h = harness().await?;
        h.fetcher.fail(Entity::Users);
        h.fetcher.respond(Entity::Products, payload(Entity::Products, vec![]));
        h.fetcher.respond(Entity::Carts, payload(Entity::Carts, vec![]));

        let report = h.extractor.extract_all(at()).await;
        let json = serde_json::to_value(&report)?;
        assert_eq!(json["entities"]["users"]["status"], "failed");
        assert_eq!(json["entities"]["products"]["status"], "extracted");

        let back: ExtractionReport = serde_json::from_value(json)?;
        assert_eq!(back, report);
        Ok(())
    }
}
