//! # Travel Tracker
//!
//! Live location tracking and map synchronization for travel companion
//! clients.
//!
//! This library provides:
//! - Continuous position sampling with a movement filter ([`GeoSampler`])
//! - Time and distance throttling of network publishes ([`LocationPublisher`])
//! - A resilient STOMP publish/subscribe client with bounded reconnection
//!   ([`MessagingClient`])
//! - Reconciliation of server-pushed places against a map overlay
//!   ([`MarkerReconciler`])
//! - An orchestrating [`TrackingSession`] that wires them together on a
//!   single event loop
//!
//! The device, the broker, the map and storage are collaborators injected as
//! traits: [`PositionSource`], [`MessagingTransport`], [`MapSurface`] and
//! [`PersistenceSlot`].
//!
//! ## Features
//!
//! - **`http`** - [`HttpSessionIssuer`] for issuing session identifiers
//! - **`persistence`** - [`SqliteSlot`] persistence backend
//! - **`full`** - Enable all features

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackerError};

// Configuration with production defaults
pub mod config;
pub use config::{MessagingConfig, PublishPolicy, SamplerConfig, TrackerConfig};

// Geographic utilities (haversine distance)
pub mod geo_utils;

// Key/value persistence slot
pub mod slot;
pub use slot::{MemorySlot, PersistenceSlot, LAST_POSITION_KEY, SESSION_ID_KEY};
#[cfg(feature = "persistence")]
pub use slot::SqliteSlot;

// Session identifier issuance
pub mod issuer;
pub use issuer::SessionIssuer;
#[cfg(feature = "http")]
pub use issuer::HttpSessionIssuer;

// Stable per-session correlation identifier
pub mod identity;
pub use identity::SessionIdentity;

// Position sampling with movement filter
pub mod sampler;
pub use sampler::{
    ChannelPositionSource, GeoSampler, PositionEvent, PositionFeed, PositionSender, PositionSink,
    PositionSource, SampleOutcome, WatchId, WatchOptions,
};

// Network throttle gate
pub mod publisher;
pub use publisher::{LocationPublisher, LocationUpdate, PublishOutcome};

// STOMP 1.2 frame codec
pub mod stomp;

// Publish/subscribe connection lifecycle
pub mod messaging;
pub use messaging::{
    ConnectRequest, ConnectionState, EventSink, LinkChannels, MessagingClient, MessagingTransport,
    StompTransport, SubscriptionId, TextLink, TransportEvent,
};

// Map overlay
pub mod map;
pub use map::{MapSurface, MarkerIcon, PlaceMarker, PlaceRecord};

// Point-of-interest reconciliation
pub mod reconciler;
pub use reconciler::{MarkerReconciler, ReconcilePlan};

// Orchestrator
pub mod session;
pub use session::{SessionNotice, SessionSnapshot, TrackingHandle, TrackingSession};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("travel_tracker"),
    );
}

/// Initialize logging for iOS (unified logging)
#[cfg(target_os = "ios")]
pub fn init_logging() {
    use log::LevelFilter;

    let _ = oslog::OsLogger::new("travel_tracker")
        .level_filter(LevelFilter::Debug)
        .init();
}

#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub fn init_logging() {
    // No-op elsewhere; the host installs its own logger
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use travel_tracker::GpsPoint;
/// let point = GpsPoint::new(37.5665, 126.9780); // Seoul
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A device fix. Immutable once produced by the position source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            captured_at,
        }
    }

    /// A fix captured now.
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude, Utc::now())
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// A correlation session issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(alias = "sessionId")]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_validity() {
        assert!(GpsPoint::new(0.0, 0.0).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_position_json_shape() {
        let pos = Position::now(37.5, 127.0);
        let json = serde_json::to_value(pos).unwrap();
        assert!(json.get("capturedAt").is_some());
        let back: Position = serde_json::from_value(json).unwrap();
        assert_eq!(back, pos);
    }

    #[test]
    fn test_session_accepts_backend_shape() {
        let session: Session = serde_json::from_str(r#"{"sessionId": "s-42"}"#).unwrap();
        assert_eq!(session.id, "s-42");
    }
}
