//! Snapshot to tabular batch: parse, filter above the watermark, project into
//! the target columns and stamp the load time.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::batch::{CellValue, Row, TabularBatch};
use crate::entity::Entity;
use crate::extract::{ExtractionOutcome, ExtractionReport};
use crate::snapshot::SnapshotStore;
use crate::watermark::WatermarkStore;

/// Products at or below this price never reach the warehouse.
pub const MIN_PRODUCT_PRICE: f64 = 50.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    id: i64,
    first_name: String,
    last_name: String,
    gender: String,
    age: i64,
    address: RawAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAddress {
    address: String,
    city: String,
    postal_code: String,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    id: i64,
    title: String,
    category: String,
    // Absent for some categories.
    #[serde(default)]
    brand: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCart {
    id: i64,
    user_id: i64,
    total: f64,
    #[serde(default)]
    products: Vec<RawCartLine>,
}

#[derive(Debug, Deserialize)]
struct RawCartLine {
    id: i64,
    quantity: i64,
    price: f64,
}

/// Deserialize the entity's top-level array. A missing array is no records.
fn records<T: DeserializeOwned>(payload: &JsonValue, entity: Entity) -> Result<Vec<T>> {
    let Some(items) = payload.get(entity.as_str()) else {
        return Ok(Vec::new());
    };
    let items = items
        .as_array()
        .ok_or_else(|| anyhow!("'{}' is not an array", entity))?;

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            T::deserialize(item)
                .with_context(|| format!("Malformed {} record at index {}", entity, idx))
        })
        .collect()
}

pub fn transform_users(
    payload: &JsonValue,
    watermark: i64,
    loaded_at: DateTime<Utc>,
) -> Result<TabularBatch> {
    let rows = records::<RawUser>(payload, Entity::Users)?
        .into_iter()
        .filter(|u| u.id > watermark)
        .map(|u| {
            Row(vec![
                CellValue::Integer(u.id),
                CellValue::Text(u.first_name),
                CellValue::Text(u.last_name),
                CellValue::Text(u.gender),
                CellValue::Integer(u.age),
                CellValue::Text(u.address.address),
                CellValue::Text(u.address.city),
                CellValue::Text(u.address.postal_code),
                CellValue::Timestamp(loaded_at),
            ])
        })
        .collect();
    Ok(TabularBatch::new(Entity::Users, rows))
}

pub fn transform_products(
    payload: &JsonValue,
    watermark: i64,
    loaded_at: DateTime<Utc>,
) -> Result<TabularBatch> {
    let rows = records::<RawProduct>(payload, Entity::Products)?
        .into_iter()
        .filter(|p| p.id > watermark && p.price > MIN_PRODUCT_PRICE)
        .map(|p| {
            Row(vec![
                CellValue::Integer(p.id),
                CellValue::Text(p.title),
                CellValue::Text(p.category),
                CellValue::Text(p.brand),
                CellValue::Float(p.price),
                CellValue::Timestamp(loaded_at),
            ])
        })
        .collect();
    Ok(TabularBatch::new(Entity::Products, rows))
}

/// Fold lines that repeat a product into the first of them, summing quantities.
/// The unit price of the last repeated line wins.
fn merge_repeated_lines(lines: Vec<RawCartLine>) -> Vec<RawCartLine> {
    let mut merged: Vec<RawCartLine> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|m| m.id == line.id) {
            Some(existing) => {
                existing.quantity += line.quantity;
                existing.price = line.price;
            }
            None => merged.push(line),
        }
    }
    merged
}

/// One row per (cart, product); every row repeats the cart total.
pub fn transform_carts(
    payload: &JsonValue,
    watermark: i64,
    loaded_at: DateTime<Utc>,
) -> Result<TabularBatch> {
    let rows = records::<RawCart>(payload, Entity::Carts)?
        .into_iter()
        .filter(|c| c.id > watermark)
        .flat_map(|cart| {
            let (cart_id, user_id, total) = (cart.id, cart.user_id, cart.total);
            merge_repeated_lines(cart.products).into_iter().map(move |line| {
                Row(vec![
                    CellValue::Integer(cart_id),
                    CellValue::Integer(user_id),
                    CellValue::Integer(line.id),
                    CellValue::Integer(line.quantity),
                    CellValue::Float(line.price),
                    CellValue::Float(total),
                    CellValue::Timestamp(loaded_at),
                ])
            })
        })
        .collect();
    Ok(TabularBatch::new(Entity::Carts, rows))
}

/// Transform one entity's snapshot payload and drop duplicate merge keys.
pub fn transform_payload(
    entity: Entity,
    payload: &JsonValue,
    watermark: i64,
    loaded_at: DateTime<Utc>,
) -> Result<TabularBatch> {
    let mut batch = match entity {
        Entity::Users => transform_users(payload, watermark, loaded_at)?,
        Entity::Products => transform_products(payload, watermark, loaded_at)?,
        Entity::Carts => transform_carts(payload, watermark, loaded_at)?,
    };
    batch.dedup_by_merge_key();
    Ok(batch)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransformOutcome {
    /// Rows above the watermark; possibly none.
    Ready { watermark: i64, batch: TabularBatch },
    /// Extraction failed earlier in the run.
    Skipped { reason: String },
    Failed { error: String },
}

impl TransformOutcome {
    #[cfg(test)]
    pub fn batch(&self) -> Option<&TabularBatch> {
        match self {
            TransformOutcome::Ready { batch, .. } => Some(batch),
            _ => None,
        }
    }

    /// The outcome without its rows, for run reports.
    pub fn summary(&self) -> TransformSummary {
        match self {
            TransformOutcome::Ready { watermark, batch } => TransformSummary::Ready {
                watermark: *watermark,
                rows: batch.len(),
            },
            TransformOutcome::Skipped { reason } => TransformSummary::Skipped {
                reason: reason.clone(),
            },
            TransformOutcome::Failed { error } => TransformSummary::Failed {
                error: error.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransformSummary {
    Ready { watermark: i64, rows: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    pub loaded_at: DateTime<Utc>,
    pub entities: BTreeMap<Entity, TransformOutcome>,
}

#[derive(Clone)]
pub struct Transformer {
    snapshots: SnapshotStore,
    watermarks: WatermarkStore,
}

impl Transformer {
    pub fn new(snapshots: SnapshotStore, watermarks: WatermarkStore) -> Self {
        Self {
            snapshots,
            watermarks,
        }
    }

    pub async fn transform_all(
        &self,
        extraction: &ExtractionReport,
        loaded_at: DateTime<Utc>,
    ) -> TransformReport {
        let outcomes = join_all(Entity::ALL.iter().map(|&entity| {
            self.transform_entity(entity, extraction.entities.get(&entity), loaded_at)
        }))
        .await;

        TransformReport {
            loaded_at,
            entities: Entity::ALL.into_iter().zip(outcomes).collect(),
        }
    }

    async fn transform_entity(
        &self,
        entity: Entity,
        extraction: Option<&ExtractionOutcome>,
        loaded_at: DateTime<Utc>,
    ) -> TransformOutcome {
        let path = match extraction {
            Some(ExtractionOutcome::Extracted { snapshot_path, .. }) => snapshot_path,
            Some(ExtractionOutcome::Failed { error, .. }) => {
                tracing::warn!(entity = %entity, "Skipping transform; extraction failed");
                return TransformOutcome::Skipped {
                    reason: format!("extraction failed: {}", error),
                };
            }
            None => {
                return TransformOutcome::Skipped {
                    reason: "not extracted this run".to_string(),
                }
            }
        };

        match self.transform_snapshot(entity, path, loaded_at).await {
            Ok((watermark, batch)) => {
                if batch.is_empty() {
                    tracing::info!(entity = %entity, watermark, "No new records to transform");
                } else {
                    tracing::info!(
                        entity = %entity,
                        watermark,
                        max_id = batch.max_key(),
                        rows = batch.len(),
                        "Transformed new records",
                    );
                }
                TransformOutcome::Ready { watermark, batch }
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!(entity = %entity, error = %error, "Transform failed");
                TransformOutcome::Failed { error }
            }
        }
    }

    async fn transform_snapshot(
        &self,
        entity: Entity,
        path: &str,
        loaded_at: DateTime<Utc>,
    ) -> Result<(i64, TabularBatch)> {
        let payload = self.snapshots.read(path).await?;
        let watermark = self
            .watermarks
            .get_max_id(entity)
            .await
            .with_context(|| format!("Failed to read {} watermark", entity))?;
        let batch = transform_payload(entity, &payload, watermark, loaded_at)?;
        Ok((watermark, batch))
    }
}
