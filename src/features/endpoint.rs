use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConfigError, SyncError};
use crate::features::records::{RecordKind, StoredRecord};

/// One record as pushed to the remote system.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub kind: RecordKind,
    pub id: Uuid,
    pub document_id: String,
    pub created_at: DateTime<Utc>,
    pub record: Value,
}

impl SyncEnvelope {
    pub fn from_record<R: StoredRecord>(record: &R) -> Result<Self, SyncError> {
        Ok(Self {
            kind: R::KIND,
            id: record.id(),
            document_id: record.document_id().to_string(),
            created_at: record.created_at(),
            record: serde_json::to_value(record)?,
        })
    }
}

/// Remote system accepting one record at a time.
///
/// Implementations must treat a repeated push of the same `id` as a no-op.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn push(&self, envelope: &SyncEnvelope) -> Result<(), SyncError>;
}

/// Used when no endpoint is configured; every push fails and records stay pending.
#[derive(Debug, Default)]
pub struct DisabledEndpoint;

#[async_trait]
impl RemoteEndpoint for DisabledEndpoint {
    async fn push(&self, _envelope: &SyncEnvelope) -> Result<(), SyncError> {
        Err(SyncError::NotConfigured)
    }
}

/// Pushes envelopes as JSON to `{base_url}/signatures` or `{base_url}/pdf-signatures`.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEndpoint {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn url_for(&self, kind: RecordKind) -> String {
        let path = match kind {
            RecordKind::Signature => "signatures",
            RecordKind::PdfSignature => "pdf-signatures",
        };
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    async fn push(&self, envelope: &SyncEnvelope) -> Result<(), SyncError> {
        let mut request = self.client.post(self.url_for(envelope.kind)).json(envelope);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Rejected {
                id: envelope.id,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
