//! In-process warehouse used for dry runs and tests.
//!
//! Mirrors the Postgres backend's contract: a missing dataset or table is
//! `NotFound`, target tables reject duplicate keys, and failures can be
//! injected per table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MergeOutcome, TableLayout, Warehouse, WarehouseError};
use crate::batch::{CellValue, Row};
use crate::config::TableNames;
use crate::entity::{Column, Entity};
use crate::ledger::RunStatus;
use crate::reports::{
    build_reports, ReportCounts, CART_DETAILS_COLUMNS, CATEGORY_SUMMARY_COLUMNS,
    USER_SUMMARY_COLUMNS,
};

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<Column>,
    /// Column indices that must be unique across rows; empty for unkeyed tables.
    key: Vec<usize>,
    rows: Vec<Row>,
}

impl MemTable {
    fn new(columns: &[Column], key: Vec<usize>) -> Self {
        Self {
            columns: columns.to_vec(),
            key,
            rows: Vec::new(),
        }
    }

    fn check_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<(), WarehouseError> {
        if columns != self.columns.as_slice() {
            return Err(WarehouseError::Schema {
                object: table.to_string(),
                message: "column list does not match table layout".to_string(),
            });
        }
        if let Some(idx) = rows.iter().position(|r| !r.conforms_to(&self.columns)) {
            return Err(WarehouseError::Schema {
                object: table.to_string(),
                message: format!("row {} does not match column types", idx),
            });
        }
        Ok(())
    }

    fn check_unique(&self, table: &str, incoming: &[Row]) -> Result<(), WarehouseError> {
        if self.key.is_empty() {
            return Ok(());
        }
        let mut seen: BTreeSet<Vec<i64>> =
            self.rows.iter().filter_map(|r| r.key(&self.key)).collect();
        for row in incoming {
            let key = row.key(&self.key).ok_or_else(|| WarehouseError::Schema {
                object: table.to_string(),
                message: "row is missing an integer key".to_string(),
            })?;
            if !seen.insert(key.clone()) {
                return Err(WarehouseError::Query {
                    object: table.to_string(),
                    message: format!("duplicate key {:?}", key),
                    source: None,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct State {
    dataset: bool,
    tables: BTreeMap<String, MemTable>,
    failing: BTreeSet<String>,
}

impl State {
    fn check(&self, table: &str) -> Result<(), WarehouseError> {
        if !self.dataset {
            return Err(WarehouseError::NotFound {
                object: "dataset".to_string(),
            });
        }
        if self.failing.contains(table) {
            return Err(WarehouseError::Unavailable {
                message: format!("injected failure for table {}", table),
            });
        }
        Ok(())
    }

    fn table(&self, table: &str) -> Result<&MemTable, WarehouseError> {
        self.check(table)?;
        self.tables.get(table).ok_or_else(|| WarehouseError::NotFound {
            object: format!("table {}", table),
        })
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut MemTable, WarehouseError> {
        self.check(table)?;
        self.tables.get_mut(table).ok_or_else(|| WarehouseError::NotFound {
            object: format!("table {}", table),
        })
    }

    fn replace_table(
        &mut self,
        table: &str,
        columns: &[Column],
        rows: Vec<Row>,
    ) -> Result<(), WarehouseError> {
        self.check(table)?;
        let mut fresh = MemTable::new(columns, Vec::new());
        fresh.rows = rows;
        self.tables.insert(table.to_string(), fresh);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl InMemoryWarehouse {
    /// A warehouse with no dataset yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation touching `table` fail with `Unavailable`.
    #[cfg(test)]
    pub fn inject_failure(&self, table: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(table.into());
        }
    }

    #[cfg(test)]
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.clear();
        }
    }

    /// Snapshot of a table's rows, `None` if the table does not exist.
    #[cfg(test)]
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        let state = self.state.lock().ok()?;
        state.tables.get(table).map(|t| t.rows.clone())
    }

    #[cfg(test)]
    pub fn drop_table(&self, table: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.tables.remove(table);
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, WarehouseError> {
        self.state.lock().map_err(|_| WarehouseError::Unavailable {
            message: "in-memory warehouse lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn ensure_dataset(&self) -> Result<(), WarehouseError> {
        self.state()?.dataset = true;
        Ok(())
    }

    async fn ensure_table(&self, table: &str, layout: TableLayout) -> Result<(), WarehouseError> {
        let mut state = self.state()?;
        state.check(table)?;
        if !state.tables.contains_key(table) {
            let key = match layout {
                TableLayout::Target(entity) => entity.schema().merge_key.to_vec(),
                TableLayout::Staging(_) | TableLayout::Ledger => Vec::new(),
            };
            state
                .tables
                .insert(table.to_string(), MemTable::new(layout.columns(), key));
        }
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64, WarehouseError> {
        let state = self.state()?;
        Ok(state.table(table)?.rows.len() as u64)
    }

    async fn max_key(&self, table: &str, column: &str) -> Result<Option<i64>, WarehouseError> {
        let state = self.state()?;
        let t = state.table(table)?;
        let idx = t
            .columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| WarehouseError::Schema {
                object: table.to_string(),
                message: format!("no column {}", column),
            })?;
        Ok(t.rows
            .iter()
            .filter_map(|r| r.get(idx).and_then(CellValue::as_i64))
            .max())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<u64, WarehouseError> {
        let mut state = self.state()?;
        let t = state.table_mut(table)?;
        t.check_rows(table, columns, rows)?;
        t.check_unique(table, rows)?;
        t.rows.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn overwrite_rows(
        &self,
        table: &str,
        columns: &[Column],
        rows: &[Row],
    ) -> Result<u64, WarehouseError> {
        let mut state = self.state()?;
        let t = state.table_mut(table)?;
        t.check_rows(table, columns, rows)?;
        let previous = std::mem::take(&mut t.rows);
        if let Err(e) = t.check_unique(table, rows) {
            t.rows = previous;
            return Err(e);
        }
        t.rows = rows.to_vec();
        Ok(rows.len() as u64)
    }

    async fn merge(
        &self,
        target: &str,
        staging: &str,
        entity: Entity,
    ) -> Result<MergeOutcome, WarehouseError> {
        let schema = entity.schema();
        let mut state = self.state()?;
        let staged = state.table(staging)?.rows.clone();
        let t = state.table_mut(target)?;
        t.check_rows(target, schema.columns, &staged)?;

        // Work on a copy so a failed merge leaves the target untouched.
        let mut merged = t.rows.clone();
        let mut positions: HashMap<Vec<i64>, usize> = merged
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.key(schema.merge_key).map(|k| (k, i)))
            .collect();

        let mut outcome = MergeOutcome::default();
        for row in staged {
            let key = row.key(schema.merge_key).ok_or_else(|| WarehouseError::Schema {
                object: staging.to_string(),
                message: "staged row is missing its merge key".to_string(),
            })?;
            match positions.get(&key) {
                Some(&pos) => {
                    merged[pos] = row;
                    outcome.updated += 1;
                }
                None => {
                    positions.insert(key, merged.len());
                    merged.push(row);
                    outcome.inserted += 1;
                }
            }
        }

        t.rows = merged;
        Ok(outcome)
    }

    async fn last_ledger_run(
        &self,
        table: &str,
        entity: Entity,
        status: RunStatus,
    ) -> Result<Option<DateTime<Utc>>, WarehouseError> {
        let state = self.state()?;
        Ok(state
            .table(table)?
            .rows
            .iter()
            .filter(|r| {
                r.get(0).and_then(CellValue::as_str) == Some(entity.as_str())
                    && r.get(3).and_then(CellValue::as_str) == Some(status.as_str())
            })
            .filter_map(|r| r.get(2).and_then(CellValue::as_timestamp))
            .max())
    }

    async fn rebuild_reports(&self, tables: &TableNames) -> Result<ReportCounts, WarehouseError> {
        let mut state = self.state()?;
        let users = state.table(&tables.users.target)?.rows.clone();
        let products = state.table(&tables.products.target)?.rows.clone();
        let carts = state.table(&tables.carts.target)?.rows.clone();

        let reports = build_reports(&users, &products, &carts, Utc::now());
        let counts = reports.counts();

        state.replace_table(&tables.user_summary, &USER_SUMMARY_COLUMNS, reports.user_summary)?;
        state.replace_table(
            &tables.category_summary,
            &CATEGORY_SUMMARY_COLUMNS,
            reports.category_summary,
        )?;
        state.replace_table(&tables.cart_details, &CART_DETAILS_COLUMNS, reports.cart_details)?;

        Ok(counts)
    }
}
