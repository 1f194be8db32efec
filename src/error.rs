//! Unified error handling for the tracking engine.
//!
//! Every fallible operation in the crate returns [`Result`], so callers can
//! match on the kind of failure and decide whether it is transient (position
//! loss, dropped publishes) or requires user action (exhausted reconnects).

use thiserror::Error;

/// Unified error type for tracking operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    /// The position source failed or refused to deliver fixes
    #[error("Position unavailable: {message}")]
    PositionUnavailable { message: String },

    /// The messaging transport dropped the connection
    #[error("Transport disconnected: {reason}")]
    TransportDisconnected { reason: String },

    /// Too many consecutive reconnect attempts failed
    #[error("Reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Inbound message could not be parsed as a place list
    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },

    /// Outbound publish attempted while not connected
    #[error("Publish rejected: {reason}")]
    PublishRejected { reason: String },

    /// Broker refused or did not answer the connect handshake
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    /// Subscribe/unsubscribe misuse or broker refusal
    #[error("Subscription error on '{topic}': {message}")]
    Subscription { topic: String, message: String },

    /// Persistence slot read/write failure
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Session identifier could not be issued
    #[error("Session issuance failed: {message}")]
    Issuance { message: String },

    /// HTTP/API error
    #[error("{}", http_message(.message, .status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// STOMP frame could not be decoded
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TrackerError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// HTTP client errors other than timeouts and rate limits are permanent:
    /// the request itself (URL, credentials) has to change.
    pub fn is_transient(&self) -> bool {
        match self {
            TrackerError::ReconnectExhausted { .. } | TrackerError::Config { .. } => false,
            TrackerError::Http {
                status_code: Some(code),
                ..
            } => *code >= 500 || *code == 408 || *code == 429,
            _ => true,
        }
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        TrackerError::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::MalformedPayload {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(err: rusqlite::Error) -> Self {
        TrackerError::persistence(err)
    }
}

fn http_message(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("HTTP error ({}): {}", code, message),
        None => format!("HTTP error: {}", message),
    }
}

/// Result type alias for tracking operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::Internal {
            message: message.to_string(),
        })
    }
}
