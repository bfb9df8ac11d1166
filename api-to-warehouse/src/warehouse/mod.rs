//! Warehouse surface used by the watermark store, ledger, loader and reports.
//!
//! Every pipeline table lives in one dataset. Backends report a missing dataset
//! or table as [`WarehouseError::NotFound`], which callers treat as "nothing
//! ingested yet" rather than as a failure.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::Row;
use crate::config::TableNames;
use crate::entity::{Column, Entity};
use crate::ledger::{RunStatus, LEDGER_COLUMNS};
use crate::reports::ReportCounts;

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// The dataset or table does not exist.
    #[error("{object} not found")]
    NotFound { object: String },

    #[error("query against {object} failed: {message}")]
    Query {
        object: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Rows did not match the table's column layout.
    #[error("schema mismatch for {object}: {message}")]
    Schema { object: String, message: String },

    #[error("warehouse unavailable: {message}")]
    Unavailable { message: String },
}

impl WarehouseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WarehouseError::NotFound { .. })
    }
}

/// Which column layout a table is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLayout {
    /// Keyed on the entity's merge key.
    Target(Entity),
    /// Same columns as the target, no key.
    Staging(Entity),
    Ledger,
}

impl TableLayout {
    pub fn columns(&self) -> &'static [Column] {
        match self {
            TableLayout::Target(e) | TableLayout::Staging(e) => e.schema().columns,
            TableLayout::Ledger => &LEDGER_COLUMNS,
        }
    }

    pub fn primary_key(&self) -> Vec<&'static str> {
        match self {
            TableLayout::Target(e) => e.schema().merge_key_columns(),
            TableLayout::Staging(_) | TableLayout::Ledger => Vec::new(),
        }
    }
}

/// Row counts produced by a staging-to-target merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl MergeOutcome {
    pub fn affected(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_dataset(&self) -> Result<(), WarehouseError>;

    async fn ensure_table(&self, table: &str, layout: TableLayout) -> Result<(), WarehouseError>;

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError>;

    /// Maximum of an integer column, `None` for an empty table.
    async fn max_key(&self, table: &str, column: &str) -> Result<Option<i64>, WarehouseError>;

    /// Append rows. Returns the number of rows written.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<u64, WarehouseError>;

    /// Replace the table's contents with `rows` atomically.
    async fn overwrite_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<u64, WarehouseError>;

    /// Upsert every staging row into the target on the entity's merge key.
    ///
    /// Matched target rows get all non-key columns overwritten, unmatched staging
    /// rows are inserted, and target rows without a staging counterpart are left
    /// untouched.
    async fn merge(
        &self,
        target: &str,
        staging: &str,
        entity: Entity,
    ) -> Result<MergeOutcome, WarehouseError>;

    /// Latest `last_run_timestamp` recorded for the entity with the given status.
    async fn last_ledger_run(
        &self,
        table: &str,
        entity: Entity,
        status: RunStatus,
    ) -> Result<Option<DateTime<Utc>>, WarehouseError>;

    /// Recreate the three report tables from the current target tables.
    async fn rebuild_reports(&self, tables: &TableNames) -> Result<ReportCounts, WarehouseError>;
}
