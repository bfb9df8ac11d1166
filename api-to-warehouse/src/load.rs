use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::batch::TabularBatch;
use crate::config::TableNames;
use crate::entity::Entity;
use crate::transform::{TransformOutcome, TransformReport};
use crate::warehouse::{MergeOutcome, TableLayout, Warehouse, WarehouseError};
use crate::watermark::WatermarkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Empty target: bulk insert straight into it.
    DirectInsert,
    /// Non-empty target: overwrite staging, then upsert into the target.
    StagedMerge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded {
        strategy: LoadStrategy,
        records: u64,
        merge: Option<MergeOutcome>,
    },
    NothingToLoad,
    /// Upstream stage did not produce a batch.
    NotAttempted { reason: String },
    Failed { error: String },
}

impl LoadOutcome {
    /// Rows written to the target; zero for anything but a load.
    pub fn records(&self) -> u64 {
        match self {
            LoadOutcome::Loaded { records, .. } => *records,
            _ => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub entities: BTreeMap<Entity, LoadOutcome>,
}

impl LoadReport {
    pub fn total_records(&self) -> u64 {
        self.entities.values().map(LoadOutcome::records).sum()
    }

    pub fn failed(&self) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(e, _)| *e)
            .collect()
    }
}

/// Chooses per entity between a direct insert and a staged merge, based on
/// whether the target already holds rows.
#[derive(Clone)]
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    watermarks: WatermarkStore,
    tables: TableNames,
}

impl Loader {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        watermarks: WatermarkStore,
        tables: TableNames,
    ) -> Self {
        Self {
            warehouse,
            watermarks,
            tables,
        }
    }

    pub async fn load_all(&self, transformed: &TransformReport) -> LoadReport {
        let outcomes = join_all(Entity::ALL.iter().map(|&entity| async move {
            match transformed.entities.get(&entity) {
                Some(outcome) => self.load_entity(entity, outcome).await,
                None => LoadOutcome::NotAttempted {
                    reason: "not transformed this run".to_string(),
                },
            }
        }))
        .await;

        let report = LoadReport {
            entities: Entity::ALL.into_iter().zip(outcomes).collect(),
        };
        for (entity, outcome) in &report.entities {
            tracing::info!(
                entity = %entity,
                records = outcome.records(),
                outcome = ?outcome,
                "Load result",
            );
        }
        tracing::info!(
            total_records = report.total_records(),
            failed = report.failed().len(),
            "Load finished",
        );
        report
    }

    pub async fn load_entity(&self, entity: Entity, transformed: &TransformOutcome) -> LoadOutcome {
        let batch = match transformed {
            TransformOutcome::Ready { batch, .. } if batch.is_empty() => {
                tracing::info!(entity = %entity, "No data to load");
                return LoadOutcome::NothingToLoad;
            }
            TransformOutcome::Ready { batch, .. } => batch,
            TransformOutcome::Skipped { reason } => {
                return LoadOutcome::NotAttempted {
                    reason: reason.clone(),
                }
            }
            TransformOutcome::Failed { error } => {
                return LoadOutcome::NotAttempted {
                    reason: format!("transform failed: {}", error),
                }
            }
        };

        match self.load_batch(batch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(entity = %entity, error = %e, "Load failed");
                LoadOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn load_batch(&self, batch: &TabularBatch) -> Result<LoadOutcome, WarehouseError> {
        let entity = batch.entity;
        let schema = entity.schema();
        let target = self.tables.target(entity);

        let strategy = if self.watermarks.is_target_empty(entity).await? {
            LoadStrategy::DirectInsert
        } else {
            LoadStrategy::StagedMerge
        };

        match strategy {
            LoadStrategy::DirectInsert => {
                tracing::info!(
                    entity = %entity,
                    table = target,
                    rows = batch.len(),
                    "First run: direct insert",
                );
                self.warehouse.ensure_dataset().await?;
                self.warehouse
                    .ensure_table(target, TableLayout::Target(entity))
                    .await?;
                let records = self
                    .warehouse
                    .insert_rows(target, schema.columns, &batch.rows)
                    .await?;
                Ok(LoadOutcome::Loaded {
                    strategy,
                    records,
                    merge: None,
                })
            }
            LoadStrategy::StagedMerge => {
                let staging = self.tables.staging(entity);
                tracing::info!(
                    entity = %entity,
                    staging,
                    rows = batch.len(),
                    "Incremental run: staging batch",
                );
                self.warehouse
                    .ensure_table(staging, TableLayout::Staging(entity))
                    .await?;
                self.warehouse
                    .overwrite_rows(staging, schema.columns, &batch.rows)
                    .await?;

                let merge = self.warehouse.merge(target, staging, entity).await?;
                tracing::info!(
                    entity = %entity,
                    inserted = merge.inserted,
                    updated = merge.updated,
                    "Merged staging into target",
                );
                Ok(LoadOutcome::Loaded {
                    strategy,
                    records: merge.affected(),
                    merge: Some(merge),
                })
            }
        }
    }
}
