//! REST binding of [`RemoteGateway`].
//!
//! Routes, relative to the configured base URL:
//!
//! - `POST /{collection}` creates, with `offline_id` in the body
//! - `PUT /{collection}/{id}` and `DELETE /{collection}/{id}`
//! - `GET /{collection}` lists every record
//! - `POST /sync/batch` applies queued operations in one call
//!
//! Server records carry `id` plus optional `offline_id` and `updated_at`
//! next to the domain fields.

use crate::gateway::{BatchOperation, BatchResult, GatewayError, RemoteGateway};
use async_trait::async_trait;
use fieldsync_types::{EntityKind, OfflineId, RemoteRecord, ServerId, Timestamp};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// HTTP gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// API root, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    /// Per-request timeout (ms).
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout_ms: 15_000,
            user_agent: concat!("fieldsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: Vec<BatchResult>,
}

/// Gateway speaking JSON over HTTP with bearer authentication.
pub struct HttpGateway {
    config: GatewayConfig,
    client: Client,
    token: Arc<RwLock<Option<String>>>,
}

impl HttpGateway {
    pub fn new(mut config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| GatewayError::Network(format!("failed to create HTTP client: {e}")))?;
        let trimmed = config.base_url.trim_end_matches('/').len();
        config.base_url.truncate(trimmed);

        Ok(Self {
            config,
            client,
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Sets or clears the bearer token sent with every request.
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/{}", self.config.base_url, kind.collection())
    }

    fn record_url(&self, kind: EntityKind, server_id: &ServerId) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.collection_url(kind))
            .map_err(|e| GatewayError::Network(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| GatewayError::Network("base url cannot carry a path".to_string()))?
            .push(server_id.as_str());
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let request = match self.token.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::from_status(status.as_u16(), body))
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(e.to_string())
    }
}

/// Reads a JSON body; an empty body yields `None`.
async fn read_json(response: Response) -> Result<Option<Value>, GatewayError> {
    let body = response.text().await.map_err(transport_error)?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

/// Splits a server JSON object into identity columns and domain fields.
pub fn parse_remote_record(value: Value) -> Result<RemoteRecord, GatewayError> {
    let Value::Object(mut fields) = value else {
        return Err(GatewayError::InvalidResponse("expected a JSON object".to_string()));
    };
    let server_id = match fields.remove("id") {
        Some(Value::String(id)) => ServerId::new(id),
        Some(Value::Number(id)) => ServerId::new(id.to_string()),
        _ => return Err(GatewayError::InvalidResponse("record without id".to_string())),
    };
    let offline_id = match fields.remove("offline_id") {
        Some(Value::String(raw)) => match OfflineId::parse(&raw) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!("Ignoring malformed offline_id on {}: {}", server_id, e);
                None
            }
        },
        _ => None,
    };
    let updated_at = match fields.remove("updated_at") {
        Some(Value::String(raw)) => Timestamp::parse_rfc3339(&raw),
        Some(Value::Number(millis)) => millis.as_i64().map(Timestamp::from_millis),
        _ => None,
    };
    Ok(RemoteRecord {
        server_id,
        offline_id,
        payload: Value::Object(fields),
        updated_at,
    })
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn create(
        &self,
        kind: EntityKind,
        offline_id: OfflineId,
        payload: &Value,
    ) -> Result<RemoteRecord, GatewayError> {
        let mut body = payload.as_object().cloned().unwrap_or_default();
        body.insert("offline_id".to_string(), json!(offline_id));

        let request = self
            .client
            .post(self.collection_url(kind))
            .header("Idempotency-Key", offline_id.to_string())
            .json(&body);
        let response = self.send(request).await?;
        let value = read_json(response)
            .await?
            .ok_or_else(|| GatewayError::InvalidResponse("empty create response".to_string()))?;

        let mut record = parse_remote_record(value)?;
        record.offline_id.get_or_insert(offline_id);
        debug!("Created {} {} as {}", kind, offline_id, record.server_id);
        Ok(record)
    }

    async fn update(
        &self,
        kind: EntityKind,
        server_id: &ServerId,
        payload: &Value,
    ) -> Result<RemoteRecord, GatewayError> {
        let request = self.client.put(self.record_url(kind, server_id)?).json(payload);
        let response = self.send(request).await?;
        match read_json(response).await? {
            Some(value) => parse_remote_record(value),
            None => Ok(RemoteRecord::new(server_id.clone(), payload.clone())),
        }
    }

    async fn delete(&self, kind: EntityKind, server_id: &ServerId) -> Result<(), GatewayError> {
        let request = self.client.delete(self.record_url(kind, server_id)?);
        self.send(request).await?;
        debug!("Deleted {} {}", kind, server_id);
        Ok(())
    }

    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, GatewayError> {
        let response = self.send(self.client.get(self.collection_url(kind))).await?;
        let items = match read_json(response).await? {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(Value::Object(mut envelope)) => match envelope.remove("data") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(GatewayError::InvalidResponse(format!(
                        "{} listing is neither an array nor a data envelope",
                        kind.collection()
                    )));
                }
            },
            Some(_) => {
                return Err(GatewayError::InvalidResponse(format!(
                    "{} listing is not an array",
                    kind.collection()
                )));
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match parse_remote_record(item) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable {} record: {}", kind, e),
            }
        }
        Ok(records)
    }

    async fn sync_batch(
        &self,
        operations: &[BatchOperation],
    ) -> Result<Vec<BatchResult>, GatewayError> {
        let request = self
            .client
            .post(format!("{}/sync/batch", self.config.base_url))
            .json(&json!({ "operations": operations }));
        let response = match self.send(request).await {
            Ok(response) => response,
            Err(GatewayError::Status { status: 404 | 405 | 501, .. }) => {
                return Err(GatewayError::Unsupported("sync_batch".to_string()));
            }
            Err(e) => return Err(e),
        };
        let value = read_json(response)
            .await?
            .ok_or_else(|| GatewayError::InvalidResponse("empty batch response".to_string()))?;
        let parsed: BatchResponse =
            serde_json::from_value(value).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok(parsed.results)
    }
}
