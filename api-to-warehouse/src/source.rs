use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value as JsonValue};

use crate::config::SourceConfig;
use crate::entity::Entity;

/// Upper bound on pages fetched for one collection.
const MAX_PAGES: usize = 10_000;

/// Raw fetch capability: GET a URL and return the body.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned an error status", url))?;

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed reading body of {}", url))?;
        Ok(body.to_vec())
    }
}

/// Parse a response body, requiring a top-level JSON object.
pub fn parse_payload(bytes: &[u8], entity: Entity, url: &str) -> Result<JsonValue> {
    let value: JsonValue = serde_json::from_slice(bytes)
        .with_context(|| format!("Response from {} is not valid JSON", url))?;
    if !value.is_object() {
        return Err(anyhow!(
            "Expected a JSON object with a '{}' array from {}",
            entity,
            url
        ));
    }
    Ok(value)
}

/// Number of records in the entity's top-level array; zero when absent.
pub fn record_count(payload: &JsonValue, entity: Entity) -> usize {
    payload
        .get(entity.as_str())
        .and_then(JsonValue::as_array)
        .map_or(0, Vec::len)
}

fn page_url(base: &str, limit: usize, skip: usize) -> Result<String> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid source URL {}", base))?;
    url.query_pairs_mut()
        .append_pair("limit", &limit.to_string())
        .append_pair("skip", &skip.to_string());
    Ok(url.into())
}

/// Fetch an entity's full collection. There is no server-side delta support,
/// so every run retrieves everything.
pub async fn fetch_collection(
    fetcher: &dyn Fetcher,
    entity: Entity,
    source: &SourceConfig,
) -> Result<JsonValue> {
    match source.page_size {
        Some(page_size) if page_size > 0 => {
            fetch_paged(fetcher, entity, source, page_size, MAX_PAGES).await
        }
        _ => {
            let bytes = fetcher.fetch(&source.url, source.timeout()).await?;
            parse_payload(&bytes, entity, &source.url)
        }
    }
}

/// Fetch using `limit`/`skip` paging and concatenate pages into one payload.
///
/// Running out of `max_pages` before the collection ends is an error; a
/// truncated collection is never returned.
async fn fetch_paged(
    fetcher: &dyn Fetcher,
    entity: Entity,
    source: &SourceConfig,
    page_size: usize,
    max_pages: usize,
) -> Result<JsonValue> {
    let mut records: Vec<JsonValue> = Vec::new();
    let mut total: Option<u64> = None;

    for page in 0..max_pages {
        let url = page_url(&source.url, page_size, records.len())?;
        let bytes = fetcher.fetch(&url, source.timeout()).await?;
        let mut payload = parse_payload(&bytes, entity, &url)?;

        if let Some(t) = payload.get("total").and_then(JsonValue::as_u64) {
            total = Some(t);
        }

        let chunk = match payload
            .as_object_mut()
            .and_then(|obj| obj.remove(entity.as_str()))
        {
            Some(JsonValue::Array(items)) => items,
            Some(other) => {
                return Err(anyhow!(
                    "Field '{}' from {} is not an array: {}",
                    entity,
                    url,
                    other
                ))
            }
            None => Vec::new(),
        };

        let chunk_len = chunk.len();
        records.extend(chunk);
        tracing::debug!(entity = %entity, page, rows = chunk_len, "Fetched page");

        let done = chunk_len == 0
            || match total {
                Some(t) => records.len() as u64 >= t,
                None => chunk_len != page_size,
            };
        if done {
            let count = records.len();
            return Ok(json!({ entity.as_str(): records, "total": count }));
        }
    }

    bail!(
        "Collection {} from {} did not end after {} pages ({} records)",
        entity,
        source.url,
        max_pages,
        records.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(url: String, page_size: Option<usize>) -> SourceConfig {
        SourceConfig {
            url,
            page_size,
            timeout_secs: Some(5),
        }
    }

    #[test]
    fn record_count_defaults_to_zero_without_array() {
        assert_eq!(record_count(&json!({ "users": [{}, {}] }), Entity::Users), 2);
        assert_eq!(record_count(&json!({ "total": 0 }), Entity::Users), 0);
        assert_eq!(record_count(&json!({ "users": "nope" }), Entity::Users), 0);
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(parse_payload(b"[1, 2]", Entity::Carts, "http://x").is_err());
        assert!(parse_payload(b"not json", Entity::Carts, "http://x").is_err());
        assert!(parse_payload(br#"{"carts": []}"#, Entity::Carts, "http://x").is_ok());
    }

    #[test]
    fn page_url_appends_limit_and_skip() -> Result<()> {
        assert_eq!(
            page_url("https://dummyjson.com/users?select=id", 30, 60)?,
            "https://dummyjson.com/users?select=id&limit=30&skip=60"
        );
        Ok(())
    }

    #[tokio::test]
    async fn single_request_without_page_size() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{ "id": 1 }, { "id": 2 }],
                "total": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new()?;
        let payload = fetch_collection(
            &fetcher,
            Entity::Users,
            &source(format!("{}/users", server.uri()), None),
        )
        .await?;
        assert_eq!(record_count(&payload, Entity::Users), 2);
        Ok(())
    }

    #[tokio::test]
    async fn paging_follows_total_across_pages() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products"))
            .and(query_param("limit", "2"))
            .and(query_param("skip", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "products": [{ "id": 1 }, { "id": 2 }],
                "total": 3, "skip": 0, "limit": 2
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/products"))
            .and(query_param("limit", "2"))
            .and(query_param("skip", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "products": [{ "id": 3 }],
                "total": 3, "skip": 2, "limit": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new()?;
        let payload = fetch_collection(
            &fetcher,
            Entity::Products,
            &source(format!("{}/products", server.uri()), Some(2)),
        )
        .await?;

        assert_eq!(payload["total"], json!(3));
        let ids: Vec<u64> = payload["products"]
            .as_array()
            .map(|items| items.iter().filter_map(|p| p["id"].as_u64()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn short_page_ends_paging_without_total() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .and(query_param("skip", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{ "id": 1 }, { "id": 2 }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .and(query_param("skip", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{ "id": 3 }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new()?;
        let payload = fetch_collection(
            &fetcher,
            Entity::Users,
            &source(format!("{}/users", server.uri()), Some(2)),
        )
        .await?;

        assert_eq!(record_count(&payload, Entity::Users), 3);
        assert_eq!(payload["total"], json!(3));
        Ok(())
    }

    #[tokio::test]
    async fn exhausting_the_page_limit_is_an_error() -> Result<()> {
        let server = MockServer::start().await;
        // Always a full page and never a total.
        Mock::given(method("GET"))
            .and(path("/carts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "carts": [{ "id": 1 }, { "id": 2 }]
            })))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new()?;
        let result = fetch_paged(
            &fetcher,
            Entity::Carts,
            &source(format!("{}/carts", server.uri()), Some(2)),
            2,
            3,
        )
        .await;

        let err = match result {
            Ok(payload) => panic!("expected paging to fail, got {}", payload),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("after 3 pages"));
        Ok(())
    }

    #[tokio::test]
    async fn error_status_is_a_fetch_failure() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/carts"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new()?;
        let result = fetch_collection(
            &fetcher,
            Entity::Carts,
            &source(format!("{}/carts", server.uri()), None),
        )
        .await;
        assert!(result.is_err());
        Ok(())
    }
}
