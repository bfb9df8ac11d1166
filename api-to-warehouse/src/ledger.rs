use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{CellValue, Row};
use crate::entity::{Column, ColumnType, Entity};
use crate::warehouse::Warehouse;

/// Outcome recorded for one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Extracted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Extracted => "EXTRACTED",
            RunStatus::Failed => "FAILED",
        }
    }
}

pub const LEDGER_COLUMNS: [Column; 6] = [
    Column::required("data_type", ColumnType::Text),
    Column::required("run_timestamp", ColumnType::Timestamp),
    Column::required("last_run_timestamp", ColumnType::Timestamp),
    Column::required("status", ColumnType::Text),
    Column::required("records_processed", ColumnType::Integer),
    Column::nullable("error_message", ColumnType::Text),
];

/// One immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entity: Entity,
    pub run_timestamp: DateTime<Utc>,
    pub last_run_timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub records_processed: u64,
    pub error_message: Option<String>,
}

impl LedgerEntry {
    pub fn extracted(entity: Entity, at: DateTime<Utc>, records: u64) -> Self {
        Self {
            entity,
            run_timestamp: at,
            last_run_timestamp: at,
            status: RunStatus::Extracted,
            records_processed: records,
            error_message: None,
        }
    }

    pub fn failed(entity: Entity, at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            entity,
            run_timestamp: at,
            last_run_timestamp: at,
            status: RunStatus::Failed,
            records_processed: 0,
            error_message: Some(error.into()),
        }
    }

    pub fn to_row(&self) -> Row {
        Row(vec![
            CellValue::Text(self.entity.as_str().to_string()),
            CellValue::Timestamp(self.run_timestamp),
            CellValue::Timestamp(self.last_run_timestamp),
            CellValue::Text(self.status.as_str().to_string()),
            CellValue::Integer(i64::try_from(self.records_processed).unwrap_or(i64::MAX)),
            self.error_message
                .clone()
                .map_or(CellValue::Null, CellValue::Text),
        ])
    }
}

/// Result of an append. The ledger is an observability aid, so a failed
/// append is reported rather than raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LedgerWrite {
    Written,
    Skipped { reason: String },
}

impl LedgerWrite {
    #[cfg(test)]
    pub fn is_written(&self) -> bool {
        matches!(self, LedgerWrite::Written)
    }
}

/// Append-only writer for the run ledger table.
#[derive(Clone)]
pub struct Ledger {
    warehouse: Arc<dyn Warehouse>,
    table: String,
}

impl Ledger {
    pub fn new(warehouse: Arc<dyn Warehouse>, table: impl Into<String>) -> Self {
        Self {
            warehouse,
            table: table.into(),
        }
    }

    pub async fn append(&self, entry: &LedgerEntry) -> LedgerWrite {
        match self
            .warehouse
            .insert_rows(&self.table, &LEDGER_COLUMNS, &[entry.to_row()])
            .await
        {
            Ok(_) => {
                tracing::info!(
                    entity = %entry.entity,
                    status = entry.status.as_str(),
                    records = entry.records_processed,
                    "Recorded run in ledger",
                );
                LedgerWrite::Written
            }
            Err(e) => {
                tracing::warn!(
                    entity = %entry.entity,
                    status = entry.status.as_str(),
                    error = %e,
                    "Could not record run in ledger; continuing",
                );
                LedgerWrite::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }
}
