//! # Remote Authority
//!
//! The consumed contract of the sync authority, and its REST implementation.
//!
//! ## Collection Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  {base_url}/{collection}                                │
//! │                                                                         │
//! │  Pull    GET    /products?since=2024-05-01T10:00:00Z  → [RemoteRecord]  │
//! │  Create  POST   /products          Idempotency-Key    → RemoteRecord    │
//! │  Update  PUT    /products/{remote_id}                 → RemoteRecord    │
//! │  Delete  DELETE /products/{remote_id}                 → 2xx / 404       │
//! │                                                                         │
//! │  collections: products, sales, sale-items, stock-movements,            │
//! │               cashier-orders                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Records
//! Every record the authority returns carries `remote_id`, `updated_at`, an
//! optional `deleted` tombstone flag, and the entity's business fields at the
//! top level. Local bookkeeping (`id`, `sync_status`) never leaves the device.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use tillsync_core::{EntityTable, SyncRecord, SyncStatus};

use crate::config::AuthoritySettings;
use crate::error::{SyncError, SyncResult};

/// Fields that only mean something on the device.
const LOCAL_ONLY_FIELDS: [&str; 4] = ["id", "remote_id", "sync_status", "updated_at"];

// =============================================================================
// Wire Record
// =============================================================================

/// One record as the authority sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub updated_at: DateTime<Utc>,
    /// Tombstone: the record was deleted upstream.
    #[serde(default)]
    pub deleted: bool,
    /// Business fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Strips local bookkeeping from a record, leaving the request body.
///
/// Foreign keys are sent as they are, so callers translate them to remote
/// identifiers first.
pub fn encode_record<E: SyncRecord>(record: &E) -> SyncResult<Map<String, Value>> {
    match serde_json::to_value(record)? {
        Value::Object(mut fields) => {
            for key in LOCAL_ONLY_FIELDS {
                fields.remove(key);
            }
            Ok(fields)
        }
        other => Err(SyncError::SerializationFailed(format!(
            "{} did not serialize to an object: {}",
            E::TABLE,
            other
        ))),
    }
}

/// Builds a typed entity from a wire record.
///
/// The result has an empty local id and `sync_status = synced`; the pull
/// phase assigns or reuses a local id.
pub fn decode_record<E: SyncRecord>(record: &RemoteRecord) -> SyncResult<E> {
    let mut fields = record.fields.clone();
    fields.insert("id".into(), Value::String(String::new()));
    fields.insert("remote_id".into(), Value::String(record.remote_id.clone()));
    fields.insert("updated_at".into(), serde_json::to_value(record.updated_at)?);
    fields.insert("sync_status".into(), serde_json::to_value(SyncStatus::Synced)?);

    Ok(serde_json::from_value(Value::Object(fields))?)
}

// =============================================================================
// Authority Trait
// =============================================================================

/// Per-collection operations of the sync authority.
///
/// ## Implementors
/// - [`HttpAuthority`] - REST over `reqwest`
/// - in-process scripted authorities in the integration tests
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Records changed at or after `since` (everything when `None`),
    /// including tombstones.
    async fn list_since(
        &self,
        table: EntityTable,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<RemoteRecord>>;

    /// Creates a record. A repeated `idempotency_key` must return the record
    /// created the first time.
    async fn create(
        &self,
        table: EntityTable,
        idempotency_key: &str,
        body: &Map<String, Value>,
    ) -> SyncResult<RemoteRecord>;

    /// Replaces the business fields of an existing record.
    async fn update(
        &self,
        table: EntityTable,
        remote_id: &str,
        body: &Map<String, Value>,
    ) -> SyncResult<RemoteRecord>;

    /// Removes a record. Removing an unknown record succeeds.
    async fn delete(&self, table: EntityTable, remote_id: &str) -> SyncResult<()>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// [`RemoteAuthority`] over REST.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpAuthority {
    /// Builds a client from the `[authority]` settings.
    pub fn new(settings: &AuthoritySettings) -> SyncResult<Self> {
        // Validates the URL up front so request paths can be plain joins.
        settings.base()?;

        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpAuthority {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            timeout: settings.request_timeout(),
        })
    }

    fn collection_url(&self, table: EntityTable) -> String {
        format!("{}/{}", self.base_url, table.collection())
    }

    fn record_url(&self, table: EntityTable, remote_id: &str) -> String {
        format!("{}/{}", self.collection_url(table), remote_id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Sends a request, turning transport failures and error statuses into
    /// [`SyncError`]s.
    async fn send(&self, request: RequestBuilder, operation: &str) -> SyncResult<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e, operation))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(status.as_u16(), message))
    }

    fn transport_error(&self, err: reqwest::Error, operation: &str) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout {
                operation: operation.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            SyncError::from(err)
        }
    }

    async fn read_record(&self, response: Response, operation: &str) -> SyncResult<RemoteRecord> {
        response
            .json::<RemoteRecord>()
            .await
            .map_err(|e| self.transport_error(e, operation))
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn list_since(
        &self,
        table: EntityTable,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<RemoteRecord>> {
        let operation = format!("pull {}", table);
        let mut request = self.client.get(self.collection_url(table));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = self.send(request, &operation).await?;
        let records = response
            .json::<Vec<RemoteRecord>>()
            .await
            .map_err(|e| self.transport_error(e, &operation))?;

        debug!(entity_table = %table, count = records.len(), "Listed remote records");
        Ok(records)
    }

    async fn create(
        &self,
        table: EntityTable,
        idempotency_key: &str,
        body: &Map<String, Value>,
    ) -> SyncResult<RemoteRecord> {
        let operation = format!("create {}", table);
        let request = self
            .client
            .post(self.collection_url(table))
            .header("Idempotency-Key", idempotency_key)
            .json(body);

        let response = self.send(request, &operation).await?;
        self.read_record(response, &operation).await
    }

    async fn update(
        &self,
        table: EntityTable,
        remote_id: &str,
        body: &Map<String, Value>,
    ) -> SyncResult<RemoteRecord> {
        let operation = format!("update {}", table);
        let request = self.client.put(self.record_url(table, remote_id)).json(body);

        let response = self.send(request, &operation).await?;
        self.read_record(response, &operation).await
    }

    async fn delete(&self, table: EntityTable, remote_id: &str) -> SyncResult<()> {
        let operation = format!("delete {}", table);
        let request = self.client.delete(self.record_url(table, remote_id));

        match self.send(request, &operation).await {
            Ok(_) => Ok(()),
            Err(SyncError::AuthorityRejected { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                debug!(entity_table = %table, remote_id, "Remote record already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_core::{Product, SaleItem};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and hands back the raw request head.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&request).contains("\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), task)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn authority(base_url: String) -> HttpAuthority {
        let settings = AuthoritySettings {
            base_url,
            api_key: Some("secret".into()),
            ..Default::default()
        };
        HttpAuthority::new(&settings).unwrap()
    }

    #[test]
    fn test_encode_strips_local_bookkeeping() {
        let mut product = Product::new("COKE-330", "Coca-Cola 330ml", 1599, 12);
        product.remote_id = Some("rp-1".into());

        let body = encode_record(&product).unwrap();
        assert!(!body.contains_key("id"));
        assert!(!body.contains_key("remote_id"));
        assert!(!body.contains_key("sync_status"));
        assert_eq!(body["sku"], "COKE-330");
        assert_eq!(body["price_cents"], 1599);
    }

    #[test]
    fn test_decode_marks_record_synced() {
        let json = serde_json::json!({
            "remote_id": "rp-9",
            "updated_at": "2024-05-01T10:00:00Z",
            "sku": "TEA-1",
            "name": "Green Tea",
            "price_cents": 450,
            "stock_quantity": 30,
            "is_active": true
        });
        let record: RemoteRecord = serde_json::from_value(json).unwrap();
        assert!(!record.deleted);

        let product: Product = decode_record(&record).unwrap();
        assert_eq!(product.remote_id.as_deref(), Some("rp-9"));
        assert_eq!(product.sync_status, SyncStatus::Synced);
        assert_eq!(product.price_cents, 450);
        assert!(product.id.is_empty());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let record = RemoteRecord {
            remote_id: "x".into(),
            updated_at: Utc::now(),
            deleted: false,
            fields: Map::new(),
        };
        let err = decode_record::<SaleItem>(&record).unwrap_err();
        assert!(matches!(err, SyncError::SerializationFailed(_)));
    }

    #[tokio::test]
    async fn test_create_sends_idempotency_key() {
        let body = r#"{"remote_id":"rp-1","updated_at":"2024-05-01T10:00:00Z","sku":"A"}"#;
        let (base, server) = serve_once(http_response("201 Created", body)).await;
        let authority = authority(base);

        let record = authority
            .create(EntityTable::Products, "queue-item-1", &Map::new())
            .await
            .unwrap();
        assert_eq!(record.remote_id, "rp-1");

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /products "));
        assert!(request.contains("idempotency-key: queue-item-1"));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_unprocessable_maps_to_rejection() {
        let (base, _server) = serve_once(http_response("422 Unprocessable Entity", "bad sku")).await;
        let authority = authority(base);

        let err = authority
            .update(EntityTable::Products, "rp-1", &Map::new())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (base, _server) = serve_once(http_response("503 Service Unavailable", "")).await;
        let authority = authority(base);

        let err = authority
            .list_since(EntityTable::SaleItems, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_of_missing_record_succeeds() {
        let (base, server) = serve_once(http_response("404 Not Found", "")).await;
        let authority = authority(base);

        authority.delete(EntityTable::Sales, "rs-1").await.unwrap();
        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("delete /sales/rs-1 "));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let authority = authority(format!("http://{}", addr));
        let err = authority
            .list_since(EntityTable::Products, None)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }
}
