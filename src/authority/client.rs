//! HTTP client for the progress authority

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::types::{CheckpointUpload, RemoteError, RemoteProgress};
use super::RemoteAuthority;

/// `RemoteAuthority` over HTTP/JSON
#[derive(Clone, Debug)]
pub struct HttpAuthority {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAuthority {
    /// Create a client for `base_url` (e.g. "http://localhost:3000")
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url: String = base_url.into();
        tracing::debug!(base_url = %base_url, "creating HttpAuthority");
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            client,
        })
    }

    /// Send a bearer token with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn progress_url(&self, user_id: &str, book_id: &str) -> String {
        format!(
            "{}/api/v1/progress/{}/{}",
            self.base_url,
            urlencoding::encode(user_id),
            urlencoding::encode(book_id)
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

/// Map a non-success status onto the engine's two failure kinds
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status {
        // Only an explicit refusal lets the coordinator drop pending checkpoints
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE => {
            RemoteError::Rejected(message)
        }
        _ => RemoteError::Transient(message),
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, RemoteError> {
    let status = resp.status();
    let body = resp.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| RemoteError::Transient(format!("invalid response body: {}", e)))
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    /// GET /api/v1/progress/:user/:book
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch_position(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<RemoteProgress>, RemoteError> {
        let url = self.progress_url(user_id, book_id);
        tracing::debug!(%url, "GET progress");

        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    /// POST /api/v1/progress/:user/:book/checkpoints
    #[tracing::instrument(level = "debug", skip(self, upload), fields(checkpoints = upload.checkpoint_ids.len()))]
    async fn push_checkpoint(
        &self,
        user_id: &str,
        book_id: &str,
        upload: &CheckpointUpload,
    ) -> Result<RemoteProgress, RemoteError> {
        let url = format!("{}/checkpoints", self.progress_url(user_id, book_id));
        tracing::debug!(%url, delta = upload.time_spent_delta, "POST checkpoint");

        let resp = self
            .authorize(self.client.post(&url))
            .json(upload)
            .send()
            .await
            .map_err(transport_error)?;

        decode(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::server::{router, ProgressLedger};
    use crate::locator::Position;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, ""),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            status_error(StatusCode::GONE, "book removed"),
            RemoteError::Rejected(m) if m.contains("book removed")
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            RemoteError::Rejected(_)
        ));
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::REQUEST_TIMEOUT, "").is_transient());
    }

    #[test]
    fn test_client_errors_keep_checkpoints() {
        for status in [
            StatusCode::NOT_FOUND,
            StatusCode::BAD_REQUEST,
            StatusCode::CONFLICT,
            StatusCode::PAYLOAD_TOO_LARGE,
        ] {
            assert!(
                status_error(status, "").is_transient(),
                "{} should be retried",
                status
            );
        }
    }

    #[test]
    fn test_progress_url_encodes_ids() {
        let client = HttpAuthority::new("http://example.com/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.progress_url("a b", "urn:isbn/1"),
            "http://example.com/api/v1/progress/a%20b/urn%3Aisbn%2F1"
        );
    }

    #[tokio::test]
    async fn test_round_trip_against_reference_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(ProgressLedger::new());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            HttpAuthority::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap();

        assert_eq!(client.fetch_position("alice", "book-1").await.unwrap(), None);

        let upload = CheckpointUpload {
            position: Position {
                fraction: 0.3,
                address: "epubcfi(/6/4[ch2]!/4/1:20)".to_string(),
                structure_version: None,
            },
            time_spent_delta: 45,
            checkpoint_ids: vec![Uuid::new_v4()],
            attributes: serde_json::Map::new(),
        };

        let ack = client.push_checkpoint("alice", "book-1", &upload).await.unwrap();
        assert_eq!(ack.total_time_spent_seconds, 45);

        // Replays are idempotent
        let ack = client.push_checkpoint("alice", "book-1", &upload).await.unwrap();
        assert_eq!(ack.total_time_spent_seconds, 45);

        let fetched = client.fetch_position("alice", "book-1").await.unwrap().unwrap();
        assert_eq!(fetched.position.map(|p| p.fraction), Some(0.3));
    }

    #[tokio::test]
    async fn test_misrouted_push_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(ProgressLedger::new())).await.unwrap();
        });

        // Base URL with a stray prefix: every route 404s
        let client =
            HttpAuthority::new(format!("http://{}/proxy", addr), Duration::from_secs(5)).unwrap();
        let upload = CheckpointUpload {
            position: Position {
                fraction: 0.1,
                address: "epubcfi(/6/2[ch1]!/4/1:10)".to_string(),
                structure_version: None,
            },
            time_spent_delta: 30,
            checkpoint_ids: vec![Uuid::new_v4()],
            attributes: serde_json::Map::new(),
        };

        let err = client.push_checkpoint("alice", "book-1", &upload).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            HttpAuthority::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let err = client.fetch_position("alice", "book-1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
