use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Column, ColumnType, Entity, EntitySchema};

/// A single typed value in a tabular row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CellValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Float(v) => Some(*v),
            CellValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CellValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Whether this value may be stored in a column of the given type.
    pub fn fits(&self, column: &Column) -> bool {
        matches!(
            (self, column.ty),
            (CellValue::Integer(_), ColumnType::Integer)
                | (CellValue::Float(_), ColumnType::Float)
                | (CellValue::Text(_), ColumnType::Text)
                | (CellValue::Timestamp(_), ColumnType::Timestamp)
        ) || (matches!(self, CellValue::Null) && column.nullable)
    }
}

/// One row, with cells in the column order of its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<CellValue>);

impl Row {
    pub fn get(&self, idx: usize) -> Option<&CellValue> {
        self.0.get(idx)
    }

    pub fn conforms_to(&self, columns: &[Column]) -> bool {
        self.0.len() == columns.len() && self.0.iter().zip(columns).all(|(v, c)| v.fits(c))
    }

    /// Integer values of the given key columns, or `None` if any is missing or not an integer.
    pub fn key(&self, indices: &[usize]) -> Option<Vec<i64>> {
        indices
            .iter()
            .map(|&i| self.get(i).and_then(CellValue::as_i64))
            .collect()
    }
}

/// Transformed rows for one entity, ready to be staged or inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabularBatch {
    pub entity: Entity,
    pub rows: Vec<Row>,
}

impl TabularBatch {
    pub fn new(entity: Entity, rows: Vec<Row>) -> Self {
        Self { entity, rows }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        self.entity.schema()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop earlier rows that share a merge key with a later row.
    ///
    /// The surviving rows keep their relative order.
    pub fn dedup_by_merge_key(&mut self) {
        let merge_key = self.schema().merge_key;
        let mut last_seen: HashMap<Vec<i64>, usize> = HashMap::new();
        for (idx, row) in self.rows.iter().enumerate() {
            if let Some(key) = row.key(merge_key) {
                last_seen.insert(key, idx);
            }
        }

        let mut idx = 0usize;
        self.rows.retain(|row| {
            let keep = row
                .key(merge_key)
                .map_or(true, |key| last_seen.get(&key) == Some(&idx));
            idx += 1;
            keep
        });
    }

    /// Largest watermark-column value in the batch.
    pub fn max_key(&self) -> Option<i64> {
        let watermark = self.schema().watermark;
        self.rows
            .iter()
            .filter_map(|row| row.get(watermark).and_then(CellValue::as_i64))
            .max()
    }
}
