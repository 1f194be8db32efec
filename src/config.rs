//! Engine configuration.
//!
//! Every threshold the engine uses lives here with its production default.
//! Configs deserialize from JSON with missing fields falling back to the
//! defaults, and a handful of deployment settings can be overridden from the
//! environment.

use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// GeoSampler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Minimum movement from the last accepted sample, in meters
    pub min_distance_meters: f64,
    /// Time to wait after a source failure before resubscribing
    #[serde(with = "millis")]
    pub error_cooldown: Duration,
    /// Ask the source for its most accurate fixes
    pub high_accuracy: bool,
    /// Maximum age of a cached fix the source may hand back
    #[serde(with = "millis")]
    pub maximum_age: Duration,
    /// How long the source may take to produce a fix
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min_distance_meters: 20.0,
            error_cooldown: Duration::from_secs(10),
            high_accuracy: true,
            maximum_age: Duration::ZERO,
            timeout: Duration::from_secs(10),
        }
    }
}

/// LocationPublisher throttle gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishPolicy {
    /// Minimum time between two transmissions
    #[serde(with = "millis")]
    pub min_interval: Duration,
    /// Minimum latitude or longitude change, in degrees (~11 m)
    pub min_delta_degrees: f64,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(5000),
            min_delta_degrees: 0.0001,
        }
    }
}

/// MessagingClient connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Broker endpoint handed to the transport
    pub broker_url: String,
    /// Bearer token sent in the connect handshake
    pub auth_token: Option<String>,
    /// Inbound topic is `{topic_prefix}{session_id}`
    pub topic_prefix: String,
    /// Fixed destination for outbound location updates
    pub publish_destination: String,
    /// Heartbeat interval, both directions
    #[serde(with = "millis")]
    pub heartbeat: Duration,
    /// Delay before each reconnect attempt
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    /// Consecutive reconnects allowed before giving up
    pub max_reconnect_attempts: u32,
    /// Upper bound on the connect handshake
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:8080/ws".to_string(),
            auth_token: None,
            topic_prefix: "/topic/location/".to_string(),
            publish_destination: "/app/location".to_string(),
            heartbeat: Duration::from_millis(4000),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl MessagingConfig {
    /// Inbound topic address for a session.
    pub fn topic_for(&self, session_id: &str) -> String {
        format!("{}{}", self.topic_prefix, session_id)
    }
}

/// Top-level configuration for a tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub sampler: SamplerConfig,
    pub publish: PublishPolicy,
    pub messaging: MessagingConfig,
    /// Fallback persistence of the last known position
    #[serde(with = "millis")]
    pub persist_interval: Duration,
    /// Endpoint that issues new session identifiers
    pub session_url: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            publish: PublishPolicy::default(),
            messaging: MessagingConfig::default(),
            persist_interval: Duration::from_secs(300),
            session_url: "http://localhost:8080/api/travel/session".to_string(),
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TrackerError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with deployment overrides read from the environment.
    ///
    /// The result is validated like [`from_json`](Self::from_json).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TRACKER_BROKER_URL") {
            config.messaging.broker_url = v;
        }
        if let Ok(v) = std::env::var("TRACKER_AUTH_TOKEN") {
            config.messaging.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("TRACKER_SESSION_URL") {
            config.session_url = v;
        }
        if let Some(ms) = parse_env::<u64>("TRACKER_HEARTBEAT_MS") {
            config.messaging.heartbeat = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("TRACKER_RECONNECT_DELAY_MS") {
            config.messaging.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_env::<u32>("TRACKER_MAX_RECONNECTS") {
            config.messaging.max_reconnect_attempts = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(TrackerError::Config {
                message: message.to_string(),
            })
        };

        if !(self.sampler.min_distance_meters >= 0.0) {
            return fail("sampler.min_distance_meters must be >= 0");
        }
        if !(self.publish.min_delta_degrees >= 0.0) {
            return fail("publish.min_delta_degrees must be >= 0");
        }
        if self.messaging.heartbeat.is_zero() {
            return fail("messaging.heartbeat must be positive");
        }
        if self.messaging.reconnect_delay.is_zero() {
            return fail("messaging.reconnect_delay must be positive");
        }
        if self.messaging.connect_timeout.is_zero() {
            return fail("messaging.connect_timeout must be positive");
        }
        if self.persist_interval.is_zero() {
            return fail("persist_interval must be positive");
        }
        if self.messaging.topic_prefix.is_empty() || self.messaging.publish_destination.is_empty()
        {
            return fail("messaging destinations must not be empty");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => {
            info!("[Config] {} = {}", key, raw);
            Some(v)
        }
        Err(e) => {
            warn!("[Config] Invalid {} value '{}': {}, using default", key, raw, e);
            None
        }
    }
}

/// Durations travel as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = TrackerConfig::default();
        assert_eq!(config.sampler.min_distance_meters, 20.0);
        assert_eq!(config.sampler.error_cooldown, Duration::from_secs(10));
        assert_eq!(config.publish.min_interval, Duration::from_millis(5000));
        assert_eq!(config.publish.min_delta_degrees, 0.0001);
        assert_eq!(config.messaging.heartbeat, Duration::from_millis(4000));
        assert_eq!(config.messaging.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.messaging.max_reconnect_attempts, 5);
        assert_eq!(config.persist_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_from_json_partial() {
        let config = TrackerConfig::from_json(
            r#"{"messaging": {"heartbeat": 10000, "topic_prefix": "/topic/poi/"}}"#,
        )
        .unwrap();
        assert_eq!(config.messaging.heartbeat, Duration::from_millis(10000));
        assert_eq!(config.messaging.topic_for("abc"), "/topic/poi/abc");
        // Untouched sections keep defaults
        assert_eq!(config.publish, PublishPolicy::default());
        assert_eq!(config.messaging.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let result = TrackerConfig::from_json(r#"{"messaging": {"heartbeat": 0}}"#);
        assert!(matches!(result, Err(TrackerError::Config { .. })));

        let result = TrackerConfig::from_json("not json");
        assert!(matches!(result, Err(TrackerError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let mut config = TrackerConfig::default();
        config.persist_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.messaging.reconnect_delay = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = TrackerConfig::default();
        config.messaging.connect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_env_validates() {
        // The only test in this binary that touches these variables
        std::env::set_var("TRACKER_HEARTBEAT_MS", "0");
        let result = TrackerConfig::from_env();
        assert!(matches!(result, Err(TrackerError::Config { .. })));

        std::env::set_var("TRACKER_HEARTBEAT_MS", "2500");
        std::env::set_var("TRACKER_SESSION_URL", "https://api.example.com/session");
        let config = TrackerConfig::from_env().unwrap();
        assert_eq!(config.messaging.heartbeat, Duration::from_millis(2500));
        assert_eq!(config.session_url, "https://api.example.com/session");

        std::env::remove_var("TRACKER_HEARTBEAT_MS");
        std::env::remove_var("TRACKER_SESSION_URL");
    }

    #[test]
    fn test_json_roundtrip_keeps_durations() {
        let config = TrackerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"persist_interval\":300000"));
        assert_eq!(TrackerConfig::from_json(&json).unwrap(), config);
    }
}
