//! HTTP client for the collaborative document store.
//!
//! Two endpoints: a snapshot read and the batched conditional write. All
//! HTTP status and transport failures map onto [`StoreError`] so the
//! dispatch path reacts on classification alone and never inspects
//! status codes itself.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anchor::SyncAnchor;
use crate::storage::traits::{
    AccessToken, DocumentSnapshot, DocumentStore, StoreError, WriteReceipt, WriteRequest,
};

pub struct RestDocumentStore {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    revision_token: String,
    end_position: u32,
    char_count: u32,
    marker_position: Option<u32>,
    anchor: Option<AnchorResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnchorResponse {
    position: u32,
    revision_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitBody<'a> {
    document_id: &'a str,
    #[serde(flatten)]
    request: &'a WriteRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    revision_token: String,
    end_position: u32,
}

impl RestDocumentStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn transport_error(e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(std::time::Duration::from_secs(0))
        } else {
            StoreError::Unreachable(e.to_string())
        }
    }

    async fn status_error(response: reqwest::Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => StoreError::CredentialRejected,
            StatusCode::FORBIDDEN => StoreError::PermissionDenied(body),
            StatusCode::NOT_FOUND => StoreError::NotFound(body),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                StoreError::Conflict { guard: body }
            }
            StatusCode::TOO_MANY_REQUESTS => StoreError::QuotaExceeded,
            s => StoreError::Server(format!("{}: {}", s, body)),
        }
    }
}

#[async_trait]
impl DocumentStore for RestDocumentStore {
    async fn snapshot(
        &self,
        token: &AccessToken,
        document_id: &str,
    ) -> Result<DocumentSnapshot, StoreError> {
        let url = format!("{}/documents/{}/snapshot", self.base_url, document_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token.0)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Server(format!("malformed snapshot: {}", e)))?;
        debug!(
            document_id = %document_id,
            revision = %body.revision_token,
            chars = body.char_count,
            "Fetched document snapshot"
        );
        Ok(DocumentSnapshot {
            anchor: body.anchor.map(|a| SyncAnchor::new(document_id, a.position, a.revision_token)),
            revision_token: body.revision_token,
            end_position: body.end_position,
            char_count: body.char_count,
            marker_position: body.marker_position,
        })
    }

    async fn commit(
        &self,
        token: &AccessToken,
        document_id: &str,
        request: &WriteRequest,
    ) -> Result<WriteReceipt, StoreError> {
        let url = format!("{}/documents/{}/commit", self.base_url, document_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token.0)
            .json(&CommitBody {
                document_id,
                request,
            })
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body: CommitResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Server(format!("malformed receipt: {}", e)))?;
        Ok(WriteReceipt {
            revision_token: body.revision_token,
            end_position: body.end_position,
        })
    }
}
