//! HTTP binding for the prediction service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::retry::{ConnectionRetry, with_connection_retry};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::prediction::{ApiResponse, Input, Prediction, UploadData};

/// Single-call operations against the prediction service. Each call absorbs
/// connection-level failures; task-level retry is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredictionApi: Send + Sync {
    /// Submits a job. `request_timeout` overrides the client's per-request
    /// timeout for this call only.
    async fn submit(
        &self,
        model: &str,
        body: &Input,
        request_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Prediction>;

    /// Fetches the current state of a submitted job.
    async fn fetch_result(&self, id: &str, cancel: &CancellationToken) -> Result<Prediction>;

    /// Uploads raw file bytes and returns the download URL.
    async fn upload_binary(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        request_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// reqwest-backed [`PredictionApi`].
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_key: String,
    retry: ConnectionRetry,
}

impl HttpClient {
    /// Creates a new HTTP binding wrapping the given reqwest Client.
    pub fn new(client: Client, base_url: &str, api_key: &str, retry: ConnectionRetry) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            retry,
        }
    }

    /// Builds the reqwest Client and binding described by `config`.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let api_key = config.api_key.as_deref().ok_or_else(missing_api_key)?;
        let client = Client::builder()
            .connect_timeout(config.connection_timeout)
            .timeout(config.timeout)
            .user_agent(format!("wavespeed-rust/{}", crate::VERSION))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(
            client,
            config.normalized_base_url(),
            api_key,
            ConnectionRetry::new(config.max_connection_retries, config.retry_interval),
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v3/{}", self.base_url, path)
    }
}

fn missing_api_key() -> ApiError {
    ApiError::Configuration(
        "API key is required. Set WAVESPEED_API_KEY environment variable or pass an api_key in ApiConfig."
            .to_string(),
    )
}

/// Wraps a failure below the HTTP status layer so the retrier recognises it.
fn transport(error: reqwest::Error) -> anyhow::Error {
    ApiError::Transport(format!("{:#}", anyhow::Error::from(error))).into()
}

/// Reads the body of a response, failing on any status other than 200.
async fn read_ok_body(response: Response, operation: &str) -> Result<String> {
    let status = response.status();
    if status != StatusCode::OK {
        return Err(ApiError::HttpStatus {
            operation: operation.to_string(),
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }
        .into());
    }
    response.text().await.map_err(transport)
}

/// Decodes the envelope and returns its `data`, failing on a non-200 `code`.
fn decode_data<T: DeserializeOwned>(body: &str, operation: &str) -> Result<T> {
    let envelope: ApiResponse<T> = serde_json::from_str(body).map_err(|e| {
        ApiError::InvalidResponse(format!("{}: cannot decode response ({}): {}", operation, e, body))
    })?;

    if envelope.code != 200 {
        return Err(ApiError::HttpStatus {
            operation: operation.to_string(),
            status: u16::try_from(envelope.code).unwrap_or(0),
            body: envelope.message.unwrap_or_default(),
        }
        .into());
    }

    envelope.data.ok_or_else(|| {
        ApiError::InvalidResponse(format!("{}: no data in response: {}", operation, body)).into()
    })
}

/// Reports exhausted connection retries on the upload path as an upload
/// failure. Cancellation and everything else pass through.
fn upload_failure(error: anyhow::Error) -> anyhow::Error {
    match error.downcast_ref::<ApiError>() {
        Some(exhausted @ ApiError::ConnectionExhausted { .. }) => {
            ApiError::Upload(exhausted.to_string()).into()
        }
        _ => error,
    }
}

#[async_trait]
impl PredictionApi for HttpClient {
    #[tracing::instrument(skip(self, body, cancel))]
    async fn submit(
        &self,
        model: &str,
        body: &Input,
        request_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Prediction> {
        let url = self.url(model);
        let url = url.as_str();
        debug!("Submitting prediction to {}...", url);

        with_connection_retry("Failed to submit prediction", &self.retry, cancel, || async move {
            let mut request = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(body);
            if let Some(timeout) = request_timeout {
                request = request.timeout(timeout);
            }

            let response = request.send().await.map_err(transport)?;
            let text = read_ok_body(response, "Failed to submit prediction").await?;
            decode_data::<Prediction>(&text, "Failed to submit prediction")
        })
        .await
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn fetch_result(&self, id: &str, cancel: &CancellationToken) -> Result<Prediction> {
        let url = self.url(&format!("predictions/{}/result", id));
        let url = url.as_str();
        let operation = format!("Failed to get result for task {}", id);
        let operation = operation.as_str();
        debug!("Fetching result from {}...", url);

        with_connection_retry(operation, &self.retry, cancel, || async move {
            let response = self
                .client
                .get(url)
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(transport)?;

            let text = read_ok_body(response, operation).await?;
            decode_data::<Prediction>(&text, operation)
        })
        .await
    }

    #[tracing::instrument(skip(self, contents, cancel))]
    async fn upload_binary(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        request_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.url("media/upload/binary");
        let url = url.as_str();
        let contents = contents.as_slice();
        debug!("Uploading {} ({} bytes) to {}...", file_name, contents.len(), url);

        let body = with_connection_retry("Failed to upload file", &self.retry, cancel, || async move {
            let part = Part::bytes(contents.to_vec())
                .file_name(file_name.to_string())
                .mime_str("application/octet-stream")
                .context("Failed to build multipart body")?;
            let mut request = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .multipart(Form::new().part("file", part));
            if let Some(timeout) = request_timeout {
                request = request.timeout(timeout);
            }

            let response = request.send().await.map_err(transport)?;
            let status = response.status();
            if status != StatusCode::OK {
                let text = response.text().await.unwrap_or_default();
                return Err(ApiError::Upload(format!("HTTP {}: {}", status.as_u16(), text)).into());
            }
            response.text().await.map_err(transport)
        })
        .await
        .map_err(upload_failure)?;

        let envelope: ApiResponse<UploadData> = serde_json::from_str(&body)
            .map_err(|e| ApiError::Upload(format!("cannot decode response ({}): {}", e, body)))?;
        if envelope.code != 200 {
            return Err(ApiError::Upload(
                envelope
                    .message
                    .unwrap_or_else(|| crate::prediction::UNKNOWN_ERROR.to_string()),
            )
            .into());
        }

        envelope
            .data
            .and_then(|data| data.download_url)
            .ok_or_else(|| ApiError::Upload("no download_url in response".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::Status;
    use serde_json::json;

    fn client_for(url: &str) -> HttpClient {
        HttpClient::new(
            Client::new(),
            url,
            "test-key",
            ConnectionRetry::new(2, Duration::from_millis(1)),
        )
    }

    fn api_error(err: &anyhow::Error) -> &ApiError {
        err.downcast_ref::<ApiError>().expect("expected ApiError")
    }

    #[tokio::test]
    async fn test_submit_success() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("POST", "/api/v3/wavespeed-ai/z-image/turbo")
            .match_header("authorization", "Bearer test-key")
            .match_body(mockito::Matcher::Json(json!({"prompt": "A cat"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code": 200, "message": "success", "data": {"id": "task-1", "status": "created"}}"#)
            .create_async()
            .await;

        let mut input = Input::new();
        input.insert("prompt".to_string(), json!("A cat"));

        let prediction = client_for(&url)
            .submit("wavespeed-ai/z-image/turbo", &input, None, &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(prediction.id.as_deref(), Some("task-1"));
        assert_eq!(prediction.status, Status::Pending);
    }

    #[tokio::test]
    async fn test_submit_http_error_is_not_connection_retried() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("POST", "/api/v3/model")
            .with_status(503)
            .with_body("Service Unavailable")
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&url)
            .submit("model", &Input::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert_eq!(
            api_error(&err),
            &ApiError::HttpStatus {
                operation: "Failed to submit prediction".to_string(),
                status: 503,
                body: "Service Unavailable".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_envelope_code_error() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let _m = server
            .mock("POST", "/api/v3/model")
            .with_status(200)
            .with_body(r#"{"code": 400, "message": "invalid prompt"}"#)
            .create_async()
            .await;

        let err = client_for(&url)
            .submit("model", &Input::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            api_error(&err),
            ApiError::HttpStatus { status: 400, body, .. } if body == "invalid prompt"
        ));
    }

    #[tokio::test]
    async fn test_malformed_response_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let _m = server
            .mock("GET", "/api/v3/predictions/task-1/result")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let err = client_for(&url)
            .fetch_result("task-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(api_error(&err), ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_fetch_result_success() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("GET", "/api/v3/predictions/task-1/result")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"code": 200, "data": {"id": "task-1", "status": "completed", "outputs": ["https://cdn/out.png"]}}"#,
            )
            .create_async()
            .await;

        let prediction = client_for(&url)
            .fetch_result("task-1", &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(prediction.status, Status::Completed);
        assert_eq!(prediction.outputs, vec![json!("https://cdn/out.png")]);
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_retries() {
        // Nothing listens on port 1.
        let err = client_for("http://127.0.0.1:1")
            .fetch_result("task-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            api_error(&err),
            ApiError::ConnectionExhausted { attempts: 3, operation, .. }
                if operation == "Failed to get result for task task-1"
        ));
    }

    #[tokio::test]
    async fn test_upload_binary_success() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let mock = server
            .mock("POST", "/api/v3/media/upload/binary")
            .match_header("authorization", "Bearer test-key")
            .match_body(mockito::Matcher::Regex("name=\"file\"; filename=\"cat.png\"".to_string()))
            .with_status(200)
            .with_body(r#"{"code": 200, "data": {"download_url": "https://cdn/cat.png"}}"#)
            .create_async()
            .await;

        let url = client_for(&url)
            .upload_binary("cat.png", b"png".to_vec(), None, &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(url, "https://cdn/cat.png");
    }

    #[tokio::test]
    async fn test_upload_binary_errors() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();

        let _m = server
            .mock("POST", "/api/v3/media/upload/binary")
            .with_status(200)
            .with_body(r#"{"code": 200, "data": {}}"#)
            .create_async()
            .await;

        let err = client_for(&url)
            .upload_binary("cat.png", b"png".to_vec(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            api_error(&err),
            &ApiError::Upload("no download_url in response".to_string())
        );

        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v3/media/upload/binary")
            .with_status(413)
            .with_body("too large")
            .create_async()
            .await;

        let err = client_for(&server.url())
            .upload_binary("cat.png", b"png".to_vec(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            api_error(&err),
            &ApiError::Upload("HTTP 413: too large".to_string())
        );
    }

    #[tokio::test]
    async fn test_truncated_error_body_keeps_http_status() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let connections_clone = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                connections_clone.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                // Promises more body than it sends, then hangs up.
                let _ = socket
                    .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 100\r\n\r\nbad")
                    .await;
            }
        });

        let err = client_for(&format!("http://{}", addr))
            .fetch_result("task-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            api_error(&err),
            ApiError::HttpStatus { status: 400, .. }
        ));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upload_binary_unreachable_is_upload_error() {
        let err = client_for("http://127.0.0.1:1")
            .upload_binary("cat.png", b"png".to_vec(), None, &CancellationToken::new())
            .await
            .unwrap_err();

        match api_error(&err) {
            ApiError::Upload(message) => {
                assert!(message.contains("Failed to upload file"), "{}", message);
                assert!(message.contains("3 attempts"), "{}", message);
            }
            other => panic!("expected Upload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_binary_cancelled_stays_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client_for("http://127.0.0.1:1")
            .upload_binary("cat.png", b"png".to_vec(), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(api_error(&err), &ApiError::Cancelled);
    }

    #[test]
    fn test_from_config_requires_api_key() {
        let err = HttpClient::from_config(&ApiConfig::default()).err().unwrap();
        assert!(matches!(api_error(&err), ApiError::Configuration(_)));

        let config = ApiConfig {
            api_key: Some("k".to_string()),
            base_url: "https://custom.api.com/".to_string(),
            ..Default::default()
        };
        let client = HttpClient::from_config(&config).unwrap();
        assert_eq!(client.url("model"), "https://custom.api.com/api/v3/model");
    }
}
