//! Calls back to registered plugins.

use std::time::Duration;

use backon::Retryable;
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::error::{DiscoveryError, Result};
use crate::model::Credential;
use crate::utils::retry::{callback_backoff, is_retryable_http, is_retryable_status};

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("callback request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("callback answered {0}")]
    Status(reqwest::StatusCode),
}

impl CallbackError {
    fn is_retryable(&self) -> bool {
        match self {
            CallbackError::Http(e) => is_retryable_http(e),
            CallbackError::Status(status) => is_retryable_status(*status),
        }
    }
}

/// A callback URL with any userinfo moved into a separate credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Callback {
    pub url: String,
    pub credential: Option<Credential>,
}

impl Callback {
    /// Parse a registration callback. Userinfo must carry both a username
    /// and a password when present.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut url = Url::parse(raw.trim())
            .map_err(|e| DiscoveryError::Admission(format!("invalid callback {}: {}", raw, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DiscoveryError::Admission(format!(
                "callback scheme {} is not supported",
                url.scheme()
            )));
        }

        let username = url.username().to_string();
        let password = url.password().map(str::to_string);
        let credential = match (username.is_empty(), password) {
            (true, None) => None,
            (false, Some(password)) if !password.is_empty() => Some(Credential { username, password }),
            _ => {
                return Err(DiscoveryError::Admission(
                    "callback credential needs both a username and a password".to_string(),
                ))
            }
        };
        if credential.is_some() {
            let stripped = url.set_username("").is_ok() && url.set_password(None).is_ok();
            if !stripped {
                return Err(DiscoveryError::Admission(format!(
                    "callback {} cannot carry a credential",
                    raw
                )));
            }
        }
        Ok(Self {
            url: url.to_string(),
            credential,
        })
    }
}

/// HTTP client for plugin liveness checks.
#[derive(Clone)]
pub struct CallbackClient {
    client: Client,
}

impl CallbackClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::InvalidArgument(format!("callback client: {}", e)))?;
        Ok(Self { client })
    }

    async fn ping_once(
        &self,
        url: &str,
        credential: Option<&Credential>,
    ) -> std::result::Result<(), CallbackError> {
        let mut request = self.client.get(url);
        if let Some(credential) = credential {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }
        let status = request.send().await?.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CallbackError::Status(status))
        }
    }

    /// GET the callback. Connection failures, timeouts and server errors are
    /// retried briefly.
    pub async fn ping(
        &self,
        url: &str,
        credential: Option<&Credential>,
    ) -> std::result::Result<(), CallbackError> {
        let result = (|| async { self.ping_once(url, credential).await })
            .retry(callback_backoff())
            .when(|e: &CallbackError| e.is_retryable())
            .await;
        match &result {
            Ok(()) => debug!(callback = %url, "plugin callback answered"),
            Err(e) => warn!(callback = %url, error = %e, "plugin callback failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_parse_moves_userinfo_into_credential() {
        let callback = Callback::parse("http://user:secret@cb:9977/ping").unwrap();
        assert_eq!(callback.url, "http://cb:9977/ping");
        assert_eq!(
            callback.credential,
            Some(Credential {
                username: "user".to_string(),
                password: "secret".to_string(),
            })
        );

        let plain = Callback::parse("http://cb/").unwrap();
        assert_eq!(plain.credential, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in ["http://user@cb/", "http://:pw@cb/", "ftp://cb/", "not a url"] {
            assert!(
                matches!(Callback::parse(raw), Err(DiscoveryError::Admission(_))),
                "{} should be rejected",
                raw
            );
        }
    }

    #[tokio::test]
    async fn test_ping_sends_basic_auth() {
        let router = Router::new().route(
            "/",
            get(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some("Basic dXNlcjpzZWNyZXQ=") => StatusCode::OK,
                    _ => StatusCode::UNAUTHORIZED,
                }
            }),
        );
        let url = serve(router).await;
        let client = CallbackClient::new(Duration::from_secs(2)).unwrap();
        let credential = Credential {
            username: "user".to_string(),
            password: "secret".to_string(),
        };

        client.ping(&url, Some(&credential)).await.unwrap();
        assert!(matches!(
            client.ping(&url, None).await,
            Err(CallbackError::Status(StatusCode::UNAUTHORIZED))
        ));
    }

    #[tokio::test]
    async fn test_ping_retries_server_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let router = Router::new().route(
            "/",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let url = serve(router).await;
        let client = CallbackClient::new(Duration::from_secs(2)).unwrap();

        client.ping(&url, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ping_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = CallbackClient::new(Duration::from_millis(500)).unwrap();
        assert!(client.ping(&format!("http://{}/", addr), None).await.is_err());
    }
}
