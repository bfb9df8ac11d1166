//! Shared doubles and payload builders for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::config::{SourceConfig, SourcesConfig};
use crate::entity::Entity;
use crate::source::Fetcher;

/// Fetcher serving canned JSON bodies keyed by URL.
#[derive(Default)]
pub struct StubFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, entity: Entity, payload: JsonValue) {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.insert(source_url(entity), payload.to_string().into_bytes());
        }
    }

    pub fn fail(&self, entity: Entity) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(source_url(entity));
        }
    }

    pub fn recover(&self, entity: Entity) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(&source_url(entity));
        }
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| anyhow!("stub lock poisoned"))?
            .contains(url);
        if failing {
            return Err(anyhow!("connection refused: {}", url));
        }
        self.bodies
            .lock()
            .map_err(|_| anyhow!("stub lock poisoned"))?
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 Not Found: {}", url))
    }
}

pub fn source_url(entity: Entity) -> String {
    format!("http://stub.local/{}", entity)
}

pub fn stub_sources() -> SourcesConfig {
    let source = |entity| SourceConfig {
        url: source_url(entity),
        page_size: None,
        timeout_secs: None,
    };
    SourcesConfig {
        users: source(Entity::Users),
        products: source(Entity::Products),
        carts: source(Entity::Carts),
    }
}

pub fn user_json(id: i64, first_name: &str, city: &str) -> JsonValue {
    json!({
        "id": id,
        "firstName": first_name,
        "lastName": "Johnson",
        "gender": "female",
        "age": 28,
        "email": "emily.johnson@x.dummyjson.com",
        "address": {
            "address": "626 Main Street",
            "city": city,
            "state": "Mississippi",
            "postalCode": "29112"
        }
    })
}

pub fn product_json(id: i64, title: &str, category: &str, price: f64) -> JsonValue {
    json!({
        "id": id,
        "title": title,
        "category": category,
        "brand": "Essence",
        "price": price,
        "stock": 5
    })
}

/// A cart whose lines are `(product_id, quantity, price)`.
pub fn cart_json(id: i64, user_id: i64, total: f64, lines: &[(i64, i64, f64)]) -> JsonValue {
    let products: Vec<JsonValue> = lines
        .iter()
        .map(|&(pid, quantity, price)| {
            json!({
                "id": pid,
                "title": format!("product {}", pid),
                "quantity": quantity,
                "price": price,
                "total": price * quantity as f64
            })
        })
        .collect();
    json!({
        "id": id,
        "userId": user_id,
        "total": total,
        "totalProducts": lines.len(),
        "products": products
    })
}

pub fn payload(entity: Entity, records: Vec<JsonValue>) -> JsonValue {
    let total = records.len();
    json!({ entity.as_str(): records, "total": total, "skip": 0, "limit": total })
}
