//! Session identifier issuance.
//!
//! The backend hands out the opaque identifier that addresses a traveller's
//! inbound topic. [`HttpSessionIssuer`] requests one over HTTP with retry
//! and exponential backoff on transient failures.

use futures::future::BoxFuture;

use crate::error::Result;
use crate::Session;

/// Source of fresh session identifiers.
pub trait SessionIssuer: Send + Sync {
    fn issue(&self) -> BoxFuture<'_, Result<Session>>;
}

#[cfg(feature = "http")]
pub use http::HttpSessionIssuer;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use log::{debug, info, warn};
    use reqwest::Client;

    use super::SessionIssuer;
    use crate::config::TrackerConfig;
    use crate::error::{Result, TrackerError};
    use crate::Session;

    const MAX_RETRIES: u32 = 3;
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    /// Issues sessions by POSTing to the backend session endpoint.
    ///
    /// The endpoint answers with `{"sessionId": "..."}`.
    pub struct HttpSessionIssuer {
        client: Client,
        url: String,
        auth_header: Option<String>,
    }

    impl HttpSessionIssuer {
        /// Create an issuer for the given endpoint, optionally authenticated
        /// with a bearer token.
        pub fn new(url: &str, bearer_token: Option<&str>) -> Result<Self> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| TrackerError::Http {
                    message: format!("Failed to create HTTP client: {}", e),
                    status_code: None,
                })?;

            Ok(Self {
                client,
                url: url.to_string(),
                auth_header: bearer_token.map(|t| format!("Bearer {}", t)),
            })
        }

        /// Issuer for the configured `session_url`, authenticated with the
        /// same token as the broker connection.
        pub fn from_config(config: &TrackerConfig) -> Result<Self> {
            if config.session_url.is_empty() {
                return Err(TrackerError::Config {
                    message: "session_url must not be empty".to_string(),
                });
            }
            Self::new(&config.session_url, config.messaging.auth_token.as_deref())
        }

        pub fn url(&self) -> &str {
            &self.url
        }

        pub fn is_authenticated(&self) -> bool {
            self.auth_header.is_some()
        }

        async fn request_session(&self) -> Result<Session> {
            let mut retries = 0;

            loop {
                let mut request = self.client.post(&self.url);
                if let Some(auth) = &self.auth_header {
                    request = request.header("Authorization", auth);
                }

                let failure = match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();

                        if status.is_success() {
                            let session =
                                resp.json::<Session>().await.map_err(|e| TrackerError::Issuance {
                                    message: format!("Parse error: {}", e),
                                })?;
                            info!("[SessionIssuer] Issued session {}", session.id);
                            return Ok(session);
                        }

                        let error = TrackerError::Http {
                            message: format!("Session endpoint returned {}", status),
                            status_code: Some(status.as_u16()),
                        };
                        // Only server-side and rate-limit failures are worth retrying
                        if !(status.is_server_error()
                            || status == reqwest::StatusCode::TOO_MANY_REQUESTS)
                        {
                            return Err(error);
                        }
                        error
                    }
                    Err(e) => TrackerError::Http {
                        message: format!("Request error: {}", e),
                        status_code: None,
                    },
                };

                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(failure);
                }

                // Exponential backoff: 1s, 2s, 4s
                let backoff = Duration::from_millis(500 * (1 << retries));
                warn!(
                    "[SessionIssuer] {}, retry {} after {:?}",
                    failure, retries, backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }

    impl SessionIssuer for HttpSessionIssuer {
        fn issue(&self) -> BoxFuture<'_, Result<Session>> {
            debug!("[SessionIssuer] Requesting session from {}", self.url);
            Box::pin(self.request_session())
        }
    }
}
