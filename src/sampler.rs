//! # GeoSampler
//!
//! Continuous position sampling with a movement filter.
//!
//! The sampler subscribes to a [`PositionSource`] and forwards a fix only
//! when it lies more than `min_distance_meters` (20 m by default) from the
//! last *accepted* fix, measured with the haversine formula. Jitter around a
//! stationary device never reaches the map or the network.
//!
//! Every subscription is identified by a [`WatchId`] and every event carries
//! the id of the watch that produced it, so events that arrive after a watch
//! was released are recognized and dropped.
//!
//! On a source failure the watch is released and a cool-down starts
//! (10 s by default); `start` refuses to resubscribe until it has elapsed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::SamplerConfig;
use crate::error::{Result, TrackerError};
use crate::geo_utils::haversine_distance;
use crate::Position;

/// Identifies one subscription to the position source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Hints passed to the position source.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Maximum acceptable staleness of a cached fix
    pub maximum_age: Duration,
    pub timeout: Duration,
}

impl From<&SamplerConfig> for WatchOptions {
    fn from(config: &SamplerConfig) -> Self {
        Self {
            high_accuracy: config.high_accuracy,
            maximum_age: config.maximum_age,
            timeout: config.timeout,
        }
    }
}

/// Raw output of the position source.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Fix(Position),
    Failed(String),
}

/// Sender half handed to the sampler's owner; events are tagged with the
/// watch that produced them.
pub type PositionSender = mpsc::UnboundedSender<(WatchId, PositionEvent)>;

/// Where a position source delivers events for one watch.
#[derive(Debug, Clone)]
pub struct PositionSink {
    watch: WatchId,
    tx: PositionSender,
}

impl PositionSink {
    pub fn watch_id(&self) -> WatchId {
        self.watch
    }

    /// Deliver a fix. Returns false once the receiving side is gone.
    pub fn fix(&self, position: Position) -> bool {
        self.tx.send((self.watch, PositionEvent::Fix(position))).is_ok()
    }

    /// Deliver a failure. Returns false once the receiving side is gone.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx
            .send((self.watch, PositionEvent::Failed(message.into())))
            .is_ok()
    }
}

/// Device geolocation, provided by the host.
pub trait PositionSource: Send {
    /// Begin delivering events for `sink.watch_id()` until unsubscribed.
    fn subscribe(&mut self, options: &WatchOptions, sink: PositionSink) -> Result<()>;

    /// Stop delivering events for a watch. Unknown ids are ignored.
    fn unsubscribe(&mut self, watch: WatchId);
}

/// Result of feeding one event through the sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Moved far enough; forward to the map and publisher
    Accepted(Position),
    /// Within the movement threshold or invalid; dropped silently
    Rejected,
    /// Event from a watch that is no longer active
    Stale,
    /// The source failed; the watch was released and a cool-down started
    Failed(TrackerError),
}

// ============================================================================
// GeoSampler
// ============================================================================

pub struct GeoSampler {
    config: SamplerConfig,
    next_watch: u64,
    active: Option<WatchId>,
    last_accepted: Option<Position>,
    cooldown_until: Option<Instant>,
}

impl GeoSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            next_watch: 0,
            active: None,
            last_accepted: None,
            cooldown_until: None,
        }
    }

    /// Subscribe to the source.
    ///
    /// Starting an already running sampler returns the current watch. During
    /// the failure cool-down no subscription is attempted.
    pub fn start(
        &mut self,
        source: &mut dyn PositionSource,
        tx: &PositionSender,
        now: Instant,
    ) -> Result<WatchId> {
        if let Some(watch) = self.active {
            return Ok(watch);
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(TrackerError::PositionUnavailable {
                    message: format!("cooling down for {:?}", until - now),
                });
            }
            self.cooldown_until = None;
        }

        self.next_watch += 1;
        let watch = WatchId(self.next_watch);
        let sink = PositionSink {
            watch,
            tx: tx.clone(),
        };

        if let Err(e) = source.subscribe(&WatchOptions::from(&self.config), sink) {
            warn!("[GeoSampler] Subscribe failed: {}", e);
            self.cooldown_until = Some(now + self.config.error_cooldown);
            return Err(e);
        }

        info!("[GeoSampler] Watching positions ({:?})", watch);
        self.active = Some(watch);
        Ok(watch)
    }

    /// Release the active watch. Safe to call repeatedly.
    pub fn stop(&mut self, source: &mut dyn PositionSource) {
        if let Some(watch) = self.active.take() {
            source.unsubscribe(watch);
            debug!("[GeoSampler] Released {:?}", watch);
        }
    }

    /// Feed one event from the source through the filter.
    pub fn handle(
        &mut self,
        watch: WatchId,
        event: PositionEvent,
        source: &mut dyn PositionSource,
        now: Instant,
    ) -> SampleOutcome {
        if self.active != Some(watch) {
            return SampleOutcome::Stale;
        }

        match event {
            PositionEvent::Fix(position) => self.filter(position),
            PositionEvent::Failed(message) => {
                warn!(
                    "[GeoSampler] Position source failed: {}; cooling down {:?}",
                    message, self.config.error_cooldown
                );
                self.stop(source);
                self.cooldown_until = Some(now + self.config.error_cooldown);
                SampleOutcome::Failed(TrackerError::PositionUnavailable { message })
            }
        }
    }

    /// Apply the movement filter against the last accepted fix.
    pub fn filter(&mut self, position: Position) -> SampleOutcome {
        if !position.point().is_valid() {
            debug!(
                "[GeoSampler] Dropping invalid fix ({}, {})",
                position.latitude, position.longitude
            );
            return SampleOutcome::Rejected;
        }

        if let Some(last) = &self.last_accepted {
            let moved = haversine_distance(&last.point(), &position.point());
            if moved <= self.config.min_distance_meters {
                return SampleOutcome::Rejected;
            }
        }

        self.last_accepted = Some(position);
        SampleOutcome::Accepted(position)
    }

    /// When the failure cool-down ends, if one is running.
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn last_accepted(&self) -> Option<&Position> {
        self.last_accepted.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

// ============================================================================
// Channel-backed position source
// ============================================================================

#[derive(Debug, Default)]
struct FeedState {
    sink: Option<PositionSink>,
    options: Option<WatchOptions>,
    subscriptions: u32,
}

/// A [`PositionSource`] fed by the host through a [`PositionFeed`].
///
/// Platform geolocation callbacks push fixes into the feed; the feed drops
/// them while no watch is active.
pub struct ChannelPositionSource {
    state: Arc<Mutex<FeedState>>,
}

/// Host-side handle of a [`ChannelPositionSource`].
#[derive(Clone)]
pub struct PositionFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ChannelPositionSource {
    pub fn new() -> (Self, PositionFeed) {
        let state = Arc::new(Mutex::new(FeedState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            PositionFeed { state },
        )
    }
}

impl PositionSource for ChannelPositionSource {
    fn subscribe(&mut self, options: &WatchOptions, sink: PositionSink) -> Result<()> {
        let mut state = self.state.lock().map_err(|e| TrackerError::Internal {
            message: e.to_string(),
        })?;
        state.sink = Some(sink);
        state.options = Some(options.clone());
        state.subscriptions += 1;
        Ok(())
    }

    fn unsubscribe(&mut self, watch: WatchId) {
        if let Ok(mut state) = self.state.lock() {
            if state.sink.as_ref().map(PositionSink::watch_id) == Some(watch) {
                state.sink = None;
            }
        }
    }
}

impl PositionFeed {
    fn with_sink<F: FnOnce(&PositionSink) -> bool>(&self, f: F) -> bool {
        match self.state.lock() {
            Ok(state) => state.sink.as_ref().map(f).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Push a fix. Returns false when nobody is watching.
    pub fn push(&self, position: Position) -> bool {
        self.with_sink(|sink| sink.fix(position))
    }

    /// Report a platform failure. Returns false when nobody is watching.
    pub fn fail(&self, message: &str) -> bool {
        self.with_sink(|sink| sink.fail(message))
    }

    pub fn is_watching(&self) -> bool {
        self.state.lock().map(|s| s.sink.is_some()).unwrap_or(false)
    }

    /// Options requested by the most recent watch.
    pub fn options(&self) -> Option<WatchOptions> {
        self.state.lock().ok().and_then(|s| s.options.clone())
    }

    /// Total number of watches opened so far.
    pub fn subscription_count(&self) -> u32 {
        self.state.lock().map(|s| s.subscriptions).unwrap_or(0)
    }
}
