use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use super::transport::{
    ConnectRequest, EventSender, EventSink, MessagingTransport, SubscriptionId, TransportEvent,
};
use crate::config::MessagingConfig;
use crate::error::{OptionExt, Result, TrackerError};
use crate::map::PlaceRecord;
use crate::publisher::LocationUpdate;

/// Lifecycle of the pub/sub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not activated
    Idle,
    /// Handshake in flight
    Connecting,
    /// Subscribed; publishing allowed
    Connected,
    /// Waiting for the scheduled retry
    Reconnecting,
    /// Gave up; needs a manual restart
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Connection state machine over a [`MessagingTransport`].
///
/// One instance lives for the whole tracking session and is reused across
/// reconnects. Each connection attempt gets a new generation number; events
/// tagged with an older generation are ignored.
pub struct MessagingClient<T: MessagingTransport> {
    transport: T,
    config: MessagingConfig,
    events: EventSender,
    state: ConnectionState,
    /// Every state entered since the last `take_transitions`
    transitions: Vec<ConnectionState>,
    /// Consecutive entries into `Reconnecting` since the last `Connected`
    attempts: u32,
    generation: u64,
    session_id: Option<String>,
    /// Only ever refers to the current connection
    subscription: Option<SubscriptionId>,
    retry_at: Option<Instant>,
    /// Negotiated heart-beat of the current connection
    send_every: Option<Duration>,
    expect_every: Option<Duration>,
    last_inbound: Option<Instant>,
    last_sent: Option<Instant>,
}

impl<T: MessagingTransport> MessagingClient<T> {
    pub fn new(transport: T, config: MessagingConfig, events: EventSender) -> Self {
        Self {
            transport,
            config,
            events,
            state: ConnectionState::Idle,
            transitions: Vec::new(),
            attempts: 0,
            generation: 0,
            session_id: None,
            subscription: None,
            retry_at: None,
            send_every: None,
            expect_every: None,
            last_inbound: None,
            last_sent: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drain the states entered since the previous call, oldest first.
    ///
    /// A single call such as `activate` can pass through several states
    /// (`Connecting` then `Reconnecting` when the dial fails at once); each
    /// one is listed.
    pub fn take_transitions(&mut self) -> Vec<ConnectionState> {
        std::mem::take(&mut self.transitions)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// When the pending reconnect should run.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// When `heartbeat` next has work to do: our beat falls due or the
    /// broker's silence reaches two of its intervals. `None` when neither
    /// direction was negotiated or the client is not connected.
    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let send = self.send_every.zip(self.last_sent).map(|(every, at)| at + every);
        let watchdog = self
            .expect_every
            .zip(self.last_inbound)
            .map(|(every, at)| at + every * 2);
        match (send, watchdog) {
            (Some(send), Some(watchdog)) => Some(send.min(watchdog)),
            (send, watchdog) => send.or(watchdog),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.transitions.push(state);
        }
    }

    /// Start connecting for a session. Only valid from `Idle`.
    pub fn activate(&mut self, session_id: &str, now: Instant) {
        if self.state != ConnectionState::Idle {
            debug!("[MessagingClient] activate ignored in state {}", self.state);
            return;
        }
        info!("[MessagingClient] Activating for session {}", session_id);
        self.session_id = Some(session_id.to_string());
        self.attempts = 0;
        self.begin_connect(now);
    }

    /// Unsubscribe, close, and return to `Idle`.
    pub fn deactivate(&mut self) {
        if let Some(id) = self.subscription.take() {
            if let Err(e) = self.transport.unsubscribe(id) {
                debug!("[MessagingClient] Unsubscribe on deactivate failed: {}", e);
            }
        }
        self.transport.disconnect();
        // Invalidate anything still in flight from the old connection
        self.generation += 1;
        self.retry_at = None;
        self.clear_heartbeat();
        self.attempts = 0;
        if self.state != ConnectionState::Idle {
            info!("[MessagingClient] Deactivated (was {})", self.state);
        }
        self.set_state(ConnectionState::Idle);
    }

    /// Run the scheduled reconnect if it is due.
    pub fn retry_if_due(&mut self, now: Instant) {
        match self.retry_at {
            Some(at) if self.state == ConnectionState::Reconnecting && now >= at => {
                self.retry_at = None;
                info!("[MessagingClient] Reconnect attempt {}", self.attempts);
                self.begin_connect(now);
            }
            _ => {}
        }
    }

    fn begin_connect(&mut self, now: Instant) {
        self.set_state(ConnectionState::Connecting);
        self.generation += 1;

        let request = ConnectRequest {
            url: self.config.broker_url.clone(),
            auth_token: self.config.auth_token.clone(),
            heartbeat: self.config.heartbeat,
            timeout: self.config.connect_timeout,
        };
        let sink = EventSink::new(self.generation, self.events.clone());

        if let Err(e) = self.transport.connect(&request, sink) {
            self.connection_lost(&e.to_string(), now);
        }
    }

    /// Subscribe to the session topic on the fresh connection.
    fn subscribe_topic(&mut self) -> Result<()> {
        let session_id = self
            .session_id
            .as_deref()
            .ok_or_internal("subscribe without session")?;
        let topic = self.config.topic_for(session_id);
        let id = self
            .transport
            .subscribe(&topic)
            .map_err(|e| TrackerError::Subscription {
                topic: topic.clone(),
                message: e.to_string(),
            })?;
        debug!("[MessagingClient] Subscribed to {} as {:?}", topic, id);
        self.subscription = Some(id);
        Ok(())
    }

    fn clear_heartbeat(&mut self) {
        self.send_every = None;
        self.expect_every = None;
        self.last_inbound = None;
        self.last_sent = None;
    }

    fn connection_lost(&mut self, reason: &str, now: Instant) {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Failed) {
            return;
        }

        // The broker forgets subscriptions with the connection; nothing to release
        if let Some(id) = self.subscription.take() {
            debug!("[MessagingClient] {:?} ended with its connection", id);
        }
        self.attempts += 1;
        self.clear_heartbeat();

        if self.attempts > self.config.max_reconnect_attempts {
            let exhausted = TrackerError::ReconnectExhausted {
                attempts: self.config.max_reconnect_attempts,
            };
            warn!("[MessagingClient] {}; {}", reason, exhausted);
            self.retry_at = None;
            self.transport.disconnect();
            self.set_state(ConnectionState::Failed);
            return;
        }

        warn!(
            "[MessagingClient] {}; reconnect {}/{} in {:?}",
            reason, self.attempts, self.config.max_reconnect_attempts, self.config.reconnect_delay
        );
        self.retry_at = Some(now + self.config.reconnect_delay);
        self.set_state(ConnectionState::Reconnecting);
    }

    /// Process one event from the transport.
    ///
    /// Returns the place list when a well-formed payload arrived on the
    /// session topic.
    pub fn handle_event(
        &mut self,
        generation: u64,
        event: TransportEvent,
        now: Instant,
    ) -> Option<Vec<PlaceRecord>> {
        if generation != self.generation {
            debug!("[MessagingClient] Dropping event from generation {}", generation);
            return None;
        }

        match event {
            TransportEvent::Connected {
                send_every,
                expect_every,
            } => {
                if self.state != ConnectionState::Connecting {
                    return None;
                }
                match self.subscribe_topic() {
                    Ok(()) => {
                        self.attempts = 0;
                        self.send_every = send_every;
                        self.expect_every = expect_every;
                        self.last_inbound = Some(now);
                        self.last_sent = Some(now);
                        self.set_state(ConnectionState::Connected);
                        info!(
                            "[MessagingClient] Connected (heart-beat send {:?}, expect {:?})",
                            send_every, expect_every
                        );
                    }
                    Err(e) => self.connection_lost(&e.to_string(), now),
                }
                None
            }
            TransportEvent::Heartbeat => {
                self.last_inbound = Some(now);
                None
            }
            TransportEvent::Message { subscription, body } => {
                self.last_inbound = Some(now);
                if self.state != ConnectionState::Connected
                    || Some(subscription) != self.subscription
                {
                    return None;
                }
                match PlaceRecord::parse_list(&body) {
                    Ok(places) => Some(places),
                    Err(e) => {
                        warn!("[MessagingClient] Discarding payload: {}", e);
                        None
                    }
                }
            }
            TransportEvent::Closed { reason } => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    let reason = TrackerError::TransportDisconnected { reason }.to_string();
                    self.connection_lost(&reason, now);
                }
                None
            }
        }
    }

    /// Heartbeat tick: detect a silent broker, then send our beat if due.
    ///
    /// Both checks follow the intervals negotiated at `Connected`; a
    /// direction negotiated off is never checked.
    pub fn heartbeat(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected {
            return;
        }

        if let Some((every, at)) = self.expect_every.zip(self.last_inbound) {
            let silent_for = now.saturating_duration_since(at);
            if silent_for >= every * 2 {
                self.connection_lost(&format!("no traffic for {:?}", silent_for), now);
                return;
            }
        }

        if let Some((every, at)) = self.send_every.zip(self.last_sent) {
            if now >= at + every {
                self.last_sent = Some(now);
                if let Err(e) = self.transport.heartbeat() {
                    self.connection_lost(&e.to_string(), now);
                }
            }
        }
    }

    /// Publish a location update. Only permitted while `Connected`.
    pub fn publish(&mut self, update: &LocationUpdate) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(TrackerError::PublishRejected {
                reason: format!("connection is {}", self.state),
            });
        }

        let body = serde_json::to_string(update).map_err(|e| TrackerError::Internal {
            message: e.to_string(),
        })?;
        self.transport
            .publish(&self.config.publish_destination, body)
            .map_err(|e| TrackerError::PublishRejected {
                reason: e.to_string(),
            })
    }
}
