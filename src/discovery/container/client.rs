//! Minimal HTTP/1.1 client over a Unix domain socket.
//!
//! One connection per request; container runtimes close idle API
//! connections aggressively and requests are infrequent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::debug;

use crate::discovery::BackendError;

#[derive(Debug, Clone)]
pub struct SocketClient {
    path: PathBuf,
    timeout: Duration,
}

impl SocketClient {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// GET `uri` and decode the JSON body. The whole exchange is bounded by
    /// the client timeout.
    pub async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T, BackendError> {
        let body = tokio::time::timeout(self.timeout, self.get(uri))
            .await
            .map_err(|_| BackendError::Timeout(format!("GET {}", uri)))??;
        serde_json::from_slice(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn get(&self, uri: &str) -> Result<Bytes, BackendError> {
        let stream = UnixStream::connect(&self.path).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "socket connection closed with error");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::HOST, "localhost")
            .header(header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(BackendError::Transient(format!(
                "GET {} returned {}",
                uri, status
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_is_io_error() {
        let client = SocketClient::new("/nonexistent/api.sock", Duration::from_secs(1));
        let result: Result<serde_json::Value, _> = client.get_json("/x").await;
        assert!(matches!(result, Err(BackendError::Io(_))));
    }
}
