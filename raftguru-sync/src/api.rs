//! Request/response channel for mutations.
//!
//! Mutations never touch the mirror. Their effects come back through the
//! subscriptions like any other client's changes.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::model::{Batch, Raft, Tile, TileRef};
use crate::protocol::eq_filter;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {endpoint} failed: {status}")]
    Status {
        method: String,
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("Request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),
}

/// Read parameters of a collection query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemQuery {
    pub filter: Option<Value>,
    pub fields: Option<String>,
    pub limit: Option<u32>,
}

impl ItemQuery {
    pub fn filtered(filter: Value) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    pub fn fields(mut self, fields: &str) -> Self {
        self.fields = Some(fields.to_string());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query-string pairs. Object values are sent JSON-encoded.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            params.push(("filter".to_string(), filter.to_string()));
        }
        if let Some(fields) = &self.fields {
            params.push(("fields".to_string(), fields.clone()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

/// Record server collaborator. Responses are already unwrapped from their
/// `{ "data": ... }` envelope; an empty body is `Value::Null`.
#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn get(&self, endpoint: &str, query: &ItemQuery) -> Result<Value, ApiError>;
    async fn create(&self, endpoint: &str, body: &Value) -> Result<Value, ApiError>;
    async fn update(&self, endpoint: &str, id: &str, body: &Value) -> Result<Value, ApiError>;
    async fn delete(&self, endpoint: &str, id: &str) -> Result<(), ApiError>;
}

/// [`RecordApi`] over HTTP with a cookie session.
#[derive(Debug, Clone)]
pub struct HttpRecordApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRecordApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.client.request(method.clone(), &url);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let request_failed = |source| ApiError::Request {
            endpoint: endpoint.to_string(),
            source,
        };
        let response = request.send().await.map_err(request_failed)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "no body".to_string());
            log::error!("[Api] {method} {endpoint} → {status}: {body}");
            return Err(ApiError::Status {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(request_failed)?;
        log::debug!("[Api] {method} {endpoint} → {status}");
        unwrap_envelope(endpoint, &text)
    }
}

/// Parse a response body and strip its `{ "data": ... }` envelope.
pub fn unwrap_envelope(endpoint: &str, text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_str(text).map_err(|e| ApiError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

#[async_trait]
impl RecordApi for HttpRecordApi {
    async fn get(&self, endpoint: &str, query: &ItemQuery) -> Result<Value, ApiError> {
        self.send(Method::GET, endpoint, &query.to_params(), None).await
    }

    async fn create(&self, endpoint: &str, body: &Value) -> Result<Value, ApiError> {
        self.send(Method::POST, endpoint, &[], Some(body)).await
    }

    async fn update(&self, endpoint: &str, id: &str, body: &Value) -> Result<Value, ApiError> {
        let endpoint = format!("{endpoint}/{id}");
        self.send(Method::PATCH, &endpoint, &[], Some(body)).await
    }

    async fn delete(&self, endpoint: &str, id: &str) -> Result<(), ApiError> {
        let endpoint = format!("{endpoint}/{id}");
        self.send(Method::DELETE, &endpoint, &[], None).await?;
        Ok(())
    }
}

const BATCHES: &str = "/items/batches";
const TILES: &str = "/items/tiles";
const RAFTS: &str = "/items/rafts";

fn decode<T: DeserializeOwned>(endpoint: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// Batch, tile and raft mutations. Failures propagate; nothing is retried.
#[derive(Clone)]
pub struct Records {
    api: Arc<dyn RecordApi>,
}

impl Records {
    pub fn new(api: Arc<dyn RecordApi>) -> Self {
        Self { api }
    }

    /// The batch flagged current, if any.
    pub async fn fetch_current_batch(&self) -> Result<Option<Batch>, ApiError> {
        let query = ItemQuery::filtered(eq_filter("isCurrent", true))
            .fields("id,tiles,date_created,isCurrent")
            .limit(1);
        let batches: Vec<Batch> = match self.api.get(BATCHES, &query).await? {
            Value::Null => Vec::new(),
            value => decode(BATCHES, value)?,
        };
        Ok(batches.into_iter().next())
    }

    /// Create a batch and make it current.
    pub async fn create_batch(&self) -> Result<Batch, ApiError> {
        let created = self
            .api
            .create(BATCHES, &json!({ "isCurrent": true }))
            .await?;
        let batch: Batch = decode(BATCHES, created)?;
        log::info!("[Api] batch {} created", batch.id);
        Ok(batch)
    }

    /// Close a batch by deleting it. Subscribers see it disappear.
    pub async fn close_batch(&self, batch_id: &str) -> Result<(), ApiError> {
        self.api.delete(BATCHES, batch_id).await?;
        log::info!("[Api] batch {batch_id} closed");
        Ok(())
    }

    /// Create an empty tile in `slot` of `batch_id`.
    pub async fn create_tile(&self, batch_id: &str, slot: TileRef) -> Result<Tile, ApiError> {
        let body = json!({
            "ref": slot,
            "batch": batch_id,
            "standup": false,
            "rafts": [],
        });
        let tile: Tile = decode(TILES, self.api.create(TILES, &body).await?)?;
        log::info!("[Api] tile {} created in {slot}", tile.id);
        Ok(tile)
    }

    /// Patch a tile with the given fields.
    pub async fn update_tile(&self, tile_id: &str, changes: &Value) -> Result<(), ApiError> {
        self.api.update(TILES, tile_id, changes).await?;
        Ok(())
    }

    pub async fn delete_tile(&self, tile_id: &str) -> Result<(), ApiError> {
        self.api.delete(TILES, tile_id).await
    }

    /// Create a raft under `tile_id`. `draft` holds the raft's own fields.
    pub async fn create_raft(&self, tile_id: &str, draft: Value) -> Result<Raft, ApiError> {
        let mut body = match draft {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ApiError::InvalidBody(format!(
                    "raft draft must be an object, got {other}"
                )))
            }
        };
        body.insert("tile".to_string(), Value::String(tile_id.to_string()));
        let raft: Raft = decode(RAFTS, self.api.create(RAFTS, &Value::Object(body)).await?)?;
        log::info!("[Api] raft {} created in tile {tile_id}", raft.id);
        Ok(raft)
    }

    pub async fn update_raft(&self, raft_id: &str, changes: &Value) -> Result<(), ApiError> {
        self.api.update(RAFTS, raft_id, changes).await?;
        Ok(())
    }

    pub async fn delete_raft(&self, raft_id: &str) -> Result<(), ApiError> {
        self.api.delete(RAFTS, raft_id).await
    }
}
