//! HTTP client for chunkdrive storage nodes.
//!
//! [`NodeClient`] speaks the node's JSON envelope protocol; [`ChunkServiceClient`]
//! wraps one node behind the `Storage` trait, signing a fresh capability token
//! for every call.

mod chunk;

pub use chunk::ChunkServiceClient;

use anyhow::{Context, Result};
use chunkdrive_core::{ApiEnvelope, AppError};
use chunkdrive_storage::{ByteStream, StorageError, StorageResult};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for one storage node.
#[derive(Clone, Debug)]
pub struct NodeClient {
    client: Client,
    base_url: String,
}

/// Map a domain error reported by a node onto the storage error space.
pub(crate) fn from_remote(err: AppError) -> StorageError {
    match err {
        AppError::NotFound(msg) => StorageError::NotFound(msg),
        AppError::Unavailable(msg) => StorageError::Unavailable(msg),
        AppError::Corrupt { expected, actual } => StorageError::Corrupt { expected, actual },
        other => StorageError::Remote(other),
    }
}

fn transport_error(err: reqwest::Error, url: &str) -> StorageError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        tracing::warn!(error = %err, url = %url, "Storage node unreachable");
        StorageError::Unavailable(format!("{}: {}", url, err))
    } else {
        StorageError::BackendError(format!("{}: {}", url, err))
    }
}

fn status_error(status: StatusCode, url: &str) -> StorageError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            StorageError::Unavailable(format!("{} returned status {}", url, status))
        }
        StatusCode::NOT_FOUND => StorageError::NotFound(url.to_string()),
        _ => StorageError::BackendError(format!("{} returned status {}", url, status)),
    }
}

impl NodeClient {
    /// `timeout` bounds a whole request, including large transfers.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and unwrap the `{code, message, data}` envelope.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, url: &str) -> StorageResult<T> {
        let response = request.send().await.map_err(|e| transport_error(e, url))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| transport_error(e, url))?;

        match serde_json::from_slice::<ApiEnvelope<T>>(&body) {
            Ok(envelope) => envelope.into_result().map_err(from_remote),
            Err(_) if !status.is_success() => Err(status_error(status, url)),
            Err(e) => Err(StorageError::BackendError(format!(
                "Failed to parse response from {}: {}",
                url, e
            ))),
        }
    }

    /// GET request with query parameters.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> StorageResult<T> {
        let url = self.build_url(path);
        let request = self.client.get(&url).query(query);
        self.send(request, &url).await
    }

    /// POST JSON body and unwrap the envelope.
    pub async fn post_json<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> StorageResult<T> {
        let url = self.build_url(path);
        let request = self.client.post(&url).json(body);
        self.send(request, &url).await
    }

    /// POST multipart form and unwrap the envelope.
    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> StorageResult<T> {
        let url = self.build_url(path);
        let request = self.client.post(&url).multipart(form);
        self.send(request, &url).await
    }

    /// GET a raw byte stream. Error responses still carry an envelope.
    pub async fn get_stream(&self, path: &str, query: &[(&str, String)]) -> StorageResult<ByteStream> {
        let url = self.build_url(path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(e, &url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.map_err(|e| transport_error(e, &url))?;
            return Err(
                match serde_json::from_slice::<ApiEnvelope<serde_json::Value>>(&body) {
                    Ok(envelope) if !envelope.is_ok() => {
                        from_remote(AppError::from_app_code(envelope.code, envelope.message))
                    }
                    _ => status_error(status, &url),
                },
            );
        }

        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| StorageError::DownloadFailed(format!("Failed to read chunk: {}", e)))
        });
        Ok(Box::pin(stream))
    }
}
