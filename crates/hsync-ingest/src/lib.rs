//! Downstream ingestion + audit contracts and their reqwest-backed HTTP client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use hsync_core::{DataType, MetricRecord, SyncAttempt, UpsertOutcome};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "hsync-ingest";

pub const INGEST_SECRET_HEADER: &str = "X-Ingest-Secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl SinkError {
    /// Transient vs permanent. Only used for reporting; calls are never retried within a run.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SinkError::Request(err) => classify_reqwest_error(err),
            SinkError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            SinkError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Idempotent store for fetched metric records.
#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn check_health(&self) -> bool;

    /// Insert-or-update keyed by (user, data type, date[, activity identity]).
    async fn upsert(
        &self,
        user_id: &str,
        date: NaiveDate,
        record: &MetricRecord,
    ) -> Result<UpsertOutcome, SinkError>;
}

/// Best-effort sink for per-attempt audit entries.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, attempt: &SyncAttempt) -> Result<(), SinkError>;
}

#[derive(Debug)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub ingest_secret: Option<SecretString>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("hsync/{}", env!("CARGO_PKG_VERSION"))),
            ingest_secret: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    #[serde(default)]
    was_inserted: bool,
}

/// Builds the `{user_id, date, <type>_data: payload}` ingestion body.
pub fn ingest_body(user_id: &str, date: NaiveDate, record: &MetricRecord) -> Result<JsonValue, serde_json::Error> {
    let mut body = Map::new();
    body.insert("user_id".to_string(), JsonValue::String(user_id.to_string()));
    body.insert(
        "date".to_string(),
        JsonValue::String(date.format("%Y-%m-%d").to_string()),
    );
    body.insert(
        record.data_type().payload_key().to_string(),
        serde_json::to_value(record)?,
    );
    Ok(JsonValue::Object(body))
}

#[derive(Debug)]
pub struct IngestionClient {
    client: reqwest::Client,
    base_url: String,
    ingest_secret: Option<SecretString>,
}

impl IngestionClient {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ingest_secret: config
                .ingest_secret
                .filter(|s| !s.expose_secret().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn ingest_url(&self, data_type: DataType) -> String {
        format!("{}/api/v1/garmin/ingest/{}", self.base_url, data_type.ingest_path())
    }

    pub fn audit_url(&self) -> String {
        format!("{}/api/v1/audit/sync", self.base_url)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, SinkError> {
        let mut request = self.client.post(url).json(body);
        if let Some(secret) = &self.ingest_secret {
            request = request.header(INGEST_SECRET_HEADER, secret.expose_secret());
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }
}

#[async_trait]
impl IngestionSink for IngestionClient {
    async fn check_health(&self) -> bool {
        let url = self.health_url();
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(%url, status = resp.status().as_u16(), "ingestion health check failed");
                false
            }
            Err(err) => {
                warn!(%url, error = %err, "ingestion health check failed");
                false
            }
        }
    }

    async fn upsert(
        &self,
        user_id: &str,
        date: NaiveDate,
        record: &MetricRecord,
    ) -> Result<UpsertOutcome, SinkError> {
        let data_type = record.data_type();
        let url = self.ingest_url(data_type);
        let body = ingest_body(user_id, date, record).map_err(|e| SinkError::Decode {
            url: url.clone(),
            message: format!("encoding {data_type} payload: {e}"),
        })?;
        debug!(%url, user_id, %date, "posting {data_type} record");

        let resp = self.post_json(&url, &body).await?;
        let bytes = resp.bytes().await?;
        let parsed: UpsertResponse = serde_json::from_slice(&bytes).map_err(|e| SinkError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;
        Ok(UpsertOutcome::from_was_inserted(parsed.was_inserted))
    }
}

#[async_trait]
impl AuditRecorder for IngestionClient {
    async fn record(&self, attempt: &SyncAttempt) -> Result<(), SinkError> {
        let url = self.audit_url();
        self.post_json(&url, attempt).await?;
        debug!(
            data_type = %attempt.data_type,
            date = %attempt.target_date,
            status = ?attempt.status,
            "audit recorded"
        );
        Ok(())
    }
}
