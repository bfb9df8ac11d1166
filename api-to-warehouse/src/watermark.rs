use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{ProbeErrorPolicy, TableNames};
use crate::entity::Entity;
use crate::ledger::RunStatus;
use crate::warehouse::{Warehouse, WarehouseError};

/// Derived per-entity state read from the warehouse. Nothing here is stored;
/// every answer is recomputed from the target and ledger tables.
#[derive(Clone)]
pub struct WatermarkStore {
    warehouse: Arc<dyn Warehouse>,
    tables: TableNames,
    on_probe_error: ProbeErrorPolicy,
}

impl WatermarkStore {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        tables: TableNames,
        on_probe_error: ProbeErrorPolicy,
    ) -> Self {
        Self {
            warehouse,
            tables,
            on_probe_error,
        }
    }

    /// Highest primary key in the entity's target table, 0 when the table or
    /// dataset is absent or empty.
    pub async fn get_max_id(&self, entity: Entity) -> Result<i64, WarehouseError> {
        let table = self.tables.target(entity);
        match self
            .warehouse
            .max_key(table, entity.schema().watermark_column())
            .await
        {
            Ok(max) => Ok(max.unwrap_or(0)),
            Err(e) if e.is_not_found() => {
                tracing::debug!(entity = %entity, table, "Target not found; watermark is 0");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the target holds no rows. Absence counts as empty; other probe
    /// errors follow the configured policy.
    pub async fn is_target_empty(&self, entity: Entity) -> Result<bool, WarehouseError> {
        let table = self.tables.target(entity);
        match self.warehouse.row_count(table).await {
            Ok(count) => Ok(count == 0),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => match self.on_probe_error {
                ProbeErrorPolicy::AssumeEmpty => {
                    tracing::warn!(
                        entity = %entity,
                        table,
                        error = %e,
                        "Could not probe target; assuming it is empty",
                    );
                    Ok(true)
                }
                ProbeErrorPolicy::SkipEntity => Err(e),
            },
        }
    }

    /// Timestamp of the latest `EXTRACTED` ledger entry, or `None` when there
    /// is none or the ledger cannot be read.
    pub async fn get_last_successful_status(&self, entity: Entity) -> Option<DateTime<Utc>> {
        match self
            .warehouse
            .last_ledger_run(&self.tables.ledger, entity, RunStatus::Extracted)
            .await
        {
            Ok(last) => last,
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                tracing::warn!(
                    entity = %entity,
                    error = %e,
                    "Ledger lookup failed; treating as first run",
                );
                None
            }
        }
    }

    /// First run when no successful extraction is on record or the target is
    /// empty.
    pub async fn is_first_run(&self, entity: Entity) -> bool {
        if self.get_last_successful_status(entity).await.is_none() {
            return true;
        }
        // A target that cannot be probed is not evidence of prior data.
        self.is_target_empty(entity).await.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{CellValue, Row};
    use crate::ledger::{Ledger, LedgerEntry};
    use crate::warehouse::memory::InMemoryWarehouse;
    use crate::warehouse::TableLayout;

    fn user(id: i64) -> Row {
        Row(vec![
            CellValue::Integer(id),
            CellValue::Text("Emily".into()),
            CellValue::Text("Johnson".into()),
            CellValue::Text("female".into()),
            CellValue::Integer(28),
            CellValue::Text("626 Main Street".into()),
            CellValue::Text("Phoenix".into()),
            CellValue::Text("29112".into()),
            CellValue::Timestamp(Utc::now()),
        ])
    }

    async fn provisioned() -> anyhow::Result<(InMemoryWarehouse, WatermarkStore)> {
        let wh = InMemoryWarehouse::new();
        wh.ensure_dataset().await?;
        wh.ensure_table("users_table", TableLayout::Target(Entity::Users))
            .await?;
        wh.ensure_table("pipeline_metadata", TableLayout::Ledger)
            .await?;
        let store = WatermarkStore::new(
            Arc::new(wh.clone()),
            TableNames::default(),
            ProbeErrorPolicy::SkipEntity,
        );
        Ok((wh, store))
    }

    #[tokio::test]
    async fn missing_dataset_means_nothing_ingested() -> anyhow::Result<()> {
        let store = WatermarkStore::new(
            Arc::new(InMemoryWarehouse::new()),
            TableNames::default(),
            ProbeErrorPolicy::SkipEntity,
        );
        assert_eq!(store.get_max_id(Entity::Users).await?, 0);
        assert!(store.is_target_empty(Entity::Users).await?);
        assert_eq!(store.get_last_successful_status(Entity::Users).await, None);
        assert!(store.is_first_run(Entity::Users).await);
        Ok(())
    }

    #[tokio::test]
    async fn watermark_is_max_id_of_target() -> anyhow::Result<()> {
        let (wh, store) = provisioned().await?;
        assert_eq!(store.get_max_id(Entity::Users).await?, 0);

        wh.insert_rows(
            "users_table",
            Entity::Users.schema().columns,
            &[user(3), user(7), user(5)],
        )
        .await?;
        assert_eq!(store.get_max_id(Entity::Users).await?, 7);
        assert!(!store.is_target_empty(Entity::Users).await?);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_target_reads_as_empty() -> anyhow::Result<()> {
        let (wh, store) = provisioned().await?;
        wh.insert_rows("users_table", Entity::Users.schema().columns, &[user(4)])
            .await?;
        wh.drop_table("users_table");

        assert_eq!(store.get_max_id(Entity::Users).await?, 0);
        assert!(store.is_target_empty(Entity::Users).await?);
        Ok(())
    }

    #[tokio::test]
    async fn probe_errors_follow_policy() -> anyhow::Result<()> {
        let (wh, strict) = provisioned().await?;
        wh.inject_failure("users_table");
        assert!(strict.is_target_empty(Entity::Users).await.is_err());
        assert!(strict.get_max_id(Entity::Users).await.is_err());

        let lenient = WatermarkStore::new(
            Arc::new(wh.clone()),
            TableNames::default(),
            ProbeErrorPolicy::AssumeEmpty,
        );
        assert!(lenient.is_target_empty(Entity::Users).await?);
        Ok(())
    }

    #[tokio::test]
    async fn first_run_needs_both_ledger_success_and_data() -> anyhow::Result<()> {
        let (wh, store) = provisioned().await?;
        let ledger = Ledger::new(Arc::new(wh.clone()), "pipeline_metadata");
        let t0 = Utc::now();

        // Failed attempts do not count.
        ledger
            .append(&LedgerEntry::failed(Entity::Users, t0, "boom"))
            .await;
        assert!(store.is_first_run(Entity::Users).await);

        ledger
            .append(&LedgerEntry::extracted(Entity::Users, t0, 1))
            .await;
        assert_eq!(store.get_last_successful_status(Entity::Users).await, Some(t0));
        // Still empty target.
        assert!(store.is_first_run(Entity::Users).await);

        wh.insert_rows("users_table", Entity::Users.schema().columns, &[user(1)])
            .await?;
        assert!(!store.is_first_run(Entity::Users).await);
        assert!(store.is_first_run(Entity::Products).await);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_ledger_reads_as_first_run() -> anyhow::Result<()> {
        let (wh, store) = provisioned().await?;
        wh.insert_rows("users_table", Entity::Users.schema().columns, &[user(1)])
            .await?;
        wh.inject_failure("pipeline_metadata");
        assert_eq!(store.get_last_successful_status(Entity::Users).await, None);
        assert!(store.is_first_run(Entity::Users).await);
        Ok(())
    }
}
