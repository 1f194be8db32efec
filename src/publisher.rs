//! # LocationPublisher
//!
//! Throttle gate between accepted samples and the network.
//!
//! A position is transmitted only when at least `min_interval` (5000 ms)
//! has passed since the last transmission **and** the latitude or longitude
//! has moved more than `min_delta_degrees` (0.0001°) from the last
//! transmitted position. The very first offer always goes out.
//!
//! This gate is deliberately separate from the sampler's 20 m filter: the
//! sampler decides what the map shows, the publisher decides what the
//! backend receives.

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::PublishPolicy;
use crate::error::{Result, TrackerError};
use crate::geo_utils::max_axis_delta;
use crate::{GpsPoint, Position};

/// Outbound location message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub session_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// What happened to an offered position.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Sent,
    /// Less than `min_interval` since the last transmission
    TooSoon,
    /// Not far enough from the last transmitted position
    TooClose,
    /// The channel refused the send; nothing was recorded
    Rejected(TrackerError),
}

#[derive(Debug)]
pub struct LocationPublisher {
    policy: PublishPolicy,
    last_published: Option<GpsPoint>,
    last_publish_at: Option<Instant>,
}

impl LocationPublisher {
    pub fn new(policy: PublishPolicy) -> Self {
        Self {
            policy,
            last_published: None,
            last_publish_at: None,
        }
    }

    /// Offer an accepted sample; `send` is invoked only if the gate opens.
    ///
    /// A failed send leaves the throttle state untouched, so the next
    /// accepted sample is judged against the same last transmission.
    pub fn offer<F>(
        &mut self,
        position: &Position,
        session_id: &str,
        now: Instant,
        send: F,
    ) -> PublishOutcome
    where
        F: FnOnce(&LocationUpdate) -> Result<()>,
    {
        if let Some(outcome) = self.check(position, now) {
            return outcome;
        }

        let update = LocationUpdate {
            session_id: session_id.to_string(),
            latitude: position.latitude,
            longitude: position.longitude,
        };

        match send(&update) {
            Ok(()) => {
                self.last_published = Some(position.point());
                self.last_publish_at = Some(now);
                debug!(
                    "[LocationPublisher] Sent ({:.6}, {:.6})",
                    update.latitude, update.longitude
                );
                PublishOutcome::Sent
            }
            Err(e) => {
                debug!("[LocationPublisher] Dropped: {}", e);
                PublishOutcome::Rejected(e)
            }
        }
    }

    /// Gate check; `None` means the position should be transmitted.
    fn check(&self, position: &Position, now: Instant) -> Option<PublishOutcome> {
        let (Some(last), Some(at)) = (&self.last_published, self.last_publish_at) else {
            return None;
        };

        if now.saturating_duration_since(at) < self.policy.min_interval {
            return Some(PublishOutcome::TooSoon);
        }
        if max_axis_delta(last, &position.point()) <= self.policy.min_delta_degrees {
            return Some(PublishOutcome::TooClose);
        }
        None
    }

    pub fn last_published(&self) -> Option<GpsPoint> {
        self.last_published
    }
}
