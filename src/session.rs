//! # TrackingSession
//!
//! Wires the sampler, publisher, messaging client and reconciler together.
//!
//! All component state is owned by a single tokio task running a `select!`
//! loop over position events, transport events, handle commands and timers
//! (reconnect deadline, heartbeat, periodic persistence, sampler cool-down,
//! identity retry). Inputs are handled strictly in arrival order and no
//! locks guard the components.
//!
//! The messaging client is activated only once both a session id and a
//! first accepted position exist.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::identity::SessionIdentity;
use crate::issuer::SessionIssuer;
use crate::map::{MapSurface, PlaceMarker};
use crate::messaging::{
    ConnectionState, EventReceiver, MessagingClient, MessagingTransport, TransportEvent,
};
use crate::publisher::{LocationPublisher, PublishOutcome};
use crate::reconciler::{self, MarkerReconciler};
use crate::sampler::{GeoSampler, PositionEvent, PositionSource, SampleOutcome, WatchId};
use crate::slot::{self, PersistenceSlot};
use crate::Position;

/// Something the presentation layer should surface to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// The position source failed; sampling resumes after the cool-down
    PositionUnavailable { message: String },
    ConnectionChanged(ConnectionState),
    /// Reconnection gave up; `TrackingHandle::reconnect` starts over
    ReconnectExhausted { attempts: u32 },
    /// No session id could be obtained. Transient failures are retried
    /// after the reconnect delay; permanent ones (rejected credentials,
    /// bad endpoint) are not.
    IdentityUnavailable { message: String, retrying: bool },
}

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub connection: ConnectionState,
    pub sampling: bool,
    /// Most recent accepted position
    pub last_position: Option<Position>,
    pub markers: Vec<PlaceMarker>,
    pub selected: Option<i64>,
}

enum Command {
    Stop(oneshot::Sender<()>),
    Recenter,
    Select(Option<i64>),
    Reconnect,
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Cheap, cloneable command surface of a running session.
///
/// The session stops when [`stop`](Self::stop) is called or when every
/// handle has been dropped.
#[derive(Clone)]
pub struct TrackingHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TrackingHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TrackerError::Internal {
                message: "tracking session has stopped".to_string(),
            })
    }

    /// Release the position watch and close the connection. Resolves once
    /// the session loop has finished; stopping twice is harmless.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Pan the map back to the last accepted position.
    pub fn recenter(&self) -> Result<()> {
        self.send(Command::Recenter)
    }

    /// Highlight a marker, or clear the highlight with `None`.
    pub fn select_marker(&self, id: Option<i64>) -> Result<()> {
        self.send(Command::Select(id))
    }

    pub fn marker_clicked(&self, id: i64) -> Result<()> {
        self.select_marker(Some(id))
    }

    /// A tap on empty map space clears the selection.
    pub fn map_clicked(&self) -> Result<()> {
        self.select_marker(None)
    }

    /// Start connecting again after reconnection gave up.
    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| TrackerError::Internal {
            message: "tracking session has stopped".to_string(),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// A configured session, ready to [`start`](Self::start).
pub struct TrackingSession<S, T, M> {
    config: TrackerConfig,
    source: S,
    transport: T,
    map: M,
    slot: Arc<dyn PersistenceSlot>,
    issuer: Arc<dyn SessionIssuer>,
    notices: Option<mpsc::UnboundedSender<SessionNotice>>,
}

impl<S, T, M> TrackingSession<S, T, M>
where
    S: PositionSource + 'static,
    T: MessagingTransport + 'static,
    M: MapSurface + 'static,
{
    /// Fails with [`TrackerError::Config`] when `config` does not validate.
    pub fn new(
        config: TrackerConfig,
        source: S,
        transport: T,
        map: M,
        slot: Arc<dyn PersistenceSlot>,
        issuer: Arc<dyn SessionIssuer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            transport,
            map,
            slot,
            issuer,
            notices: None,
        })
    }

    /// Receive [`SessionNotice`]s. Without a receiver notices are dropped.
    pub fn notices(&mut self) -> mpsc::UnboundedReceiver<SessionNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notices = Some(tx);
        rx
    }

    /// Spawn the session loop on the current tokio runtime.
    pub fn start(self) -> TrackingHandle {
        self.spawn().0
    }

    /// Like [`start`](Self::start), also returning the loop's join handle.
    pub fn spawn(self) -> (TrackingHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (position_tx, position_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (identity_tx, identity_rx) = mpsc::unbounded_channel();

        let identity = Arc::new(SessionIdentity::new(self.slot.clone(), self.issuer));
        let runner = Runner {
            sampler: GeoSampler::new(self.config.sampler.clone()),
            publisher: LocationPublisher::new(self.config.publish.clone()),
            client: MessagingClient::new(self.transport, self.config.messaging.clone(), event_tx),
            reconciler: MarkerReconciler::new(),
            source: self.source,
            map: self.map,
            slot: self.slot,
            identity,
            notices: self.notices,
            position_tx,
            identity_tx,
            session_id: None,
            self_marker_placed: false,
            identity_retry_at: None,
            config: self.config,
        };

        let task = tokio::spawn(runner.run(command_rx, position_rx, event_rx, identity_rx));
        (
            TrackingHandle {
                commands: command_tx,
            },
            task,
        )
    }
}

/// Pending forever when there is no deadline.
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Runner<S, T: MessagingTransport, M> {
    config: TrackerConfig,
    source: S,
    map: M,
    slot: Arc<dyn PersistenceSlot>,
    identity: Arc<SessionIdentity>,
    sampler: GeoSampler,
    publisher: LocationPublisher,
    client: MessagingClient<T>,
    reconciler: MarkerReconciler,
    notices: Option<mpsc::UnboundedSender<SessionNotice>>,
    position_tx: mpsc::UnboundedSender<(WatchId, PositionEvent)>,
    identity_tx: mpsc::UnboundedSender<Result<String>>,
    session_id: Option<String>,
    self_marker_placed: bool,
    identity_retry_at: Option<Instant>,
}

impl<S, T, M> Runner<S, T, M>
where
    S: PositionSource,
    T: MessagingTransport,
    M: MapSurface,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut positions: mpsc::UnboundedReceiver<(WatchId, PositionEvent)>,
        mut events: EventReceiver,
        mut identities: mpsc::UnboundedReceiver<Result<String>>,
    ) {
        let started = Instant::now();
        info!("[TrackingSession] Starting");
        self.resolve_identity();
        self.start_sampler(started);

        let persist_every = self.config.persist_interval;
        let mut persist = interval_at(started + persist_every, persist_every);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stop_ack = None;
        loop {
            let retry_at = self.client.retry_deadline();
            let cooldown_until = if self.sampler.is_running() {
                None
            } else {
                self.sampler.cooldown_deadline()
            };
            let identity_retry_at = self.identity_retry_at;
            let heartbeat_at = self.client.heartbeat_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop(ack)) => {
                        stop_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("[TrackingSession] All handles dropped");
                        break;
                    }
                },
                Some((watch, event)) = positions.recv() => {
                    self.on_position(watch, event, Instant::now());
                }
                Some((generation, event)) = events.recv() => {
                    self.on_transport_event(generation, event, Instant::now());
                }
                Some(result) = identities.recv() => self.on_identity(result, Instant::now()),
                _ = sleep_until_some(retry_at) => self.client.retry_if_due(Instant::now()),
                _ = sleep_until_some(cooldown_until) => self.start_sampler(Instant::now()),
                _ = sleep_until_some(identity_retry_at) => {
                    self.identity_retry_at = None;
                    self.resolve_identity();
                }
                _ = sleep_until_some(heartbeat_at) => self.client.heartbeat(Instant::now()),
                _ = persist.tick() => self.persist_last_position(),
            }

            self.report_transitions();
        }

        self.shutdown();
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    fn notify(&self, notice: SessionNotice) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice);
        }
    }

    /// Surface every state the client entered, in order.
    fn report_transitions(&mut self) {
        for state in self.client.take_transitions() {
            self.notify(SessionNotice::ConnectionChanged(state));
            if state == ConnectionState::Failed {
                self.notify(SessionNotice::ReconnectExhausted {
                    attempts: self.config.messaging.max_reconnect_attempts,
                });
            }
        }
    }

    /// Look up or issue the session id off the loop; the result comes back
    /// on the identity channel.
    fn resolve_identity(&self) {
        let identity = Arc::clone(&self.identity);
        let tx = self.identity_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(identity.ensure().await);
        });
    }

    fn on_identity(&mut self, result: Result<String>, now: Instant) {
        match result {
            Ok(id) => {
                info!("[TrackingSession] Session id {}", id);
                self.session_id = Some(id);
                self.activate_if_ready(now);
            }
            Err(e) => {
                let retrying = e.is_transient();
                if retrying {
                    let delay = self.config.messaging.reconnect_delay;
                    warn!("[TrackingSession] Identity unavailable: {}; retry in {:?}", e, delay);
                    self.identity_retry_at = Some(now + delay);
                } else {
                    warn!("[TrackingSession] Identity refused: {}; not retrying", e);
                }
                self.notify(SessionNotice::IdentityUnavailable {
                    message: e.to_string(),
                    retrying,
                });
            }
        }
    }

    /// Connect once both a session id and a first accepted fix exist.
    fn activate_if_ready(&mut self, now: Instant) {
        if self.client.state() != ConnectionState::Idle || self.sampler.last_accepted().is_none() {
            return;
        }
        if let Some(id) = &self.session_id {
            self.client.activate(id, now);
        }
    }

    fn start_sampler(&mut self, now: Instant) {
        if let Err(e) = self.sampler.start(&mut self.source, &self.position_tx, now) {
            self.notify(SessionNotice::PositionUnavailable {
                message: e.to_string(),
            });
        }
    }

    fn on_position(&mut self, watch: WatchId, event: PositionEvent, now: Instant) {
        match self.sampler.handle(watch, event, &mut self.source, now) {
            SampleOutcome::Accepted(position) => self.on_accepted(position, now),
            SampleOutcome::Failed(e) => self.notify(SessionNotice::PositionUnavailable {
                message: e.to_string(),
            }),
            SampleOutcome::Rejected | SampleOutcome::Stale => {}
        }
    }

    fn on_accepted(&mut self, position: Position, now: Instant) {
        let point = position.point();
        if self.self_marker_placed {
            self.map.move_self_marker(point);
        } else {
            self.map.place_self_marker(point);
            self.map.pan_to(point);
            self.self_marker_placed = true;
        }

        self.activate_if_ready(now);
        self.publish(&position, now);

        if let Err(e) = slot::store_position(self.slot.as_ref(), &position) {
            warn!("[TrackingSession] Could not persist position: {}", e);
        }
    }

    fn publish(&mut self, position: &Position, now: Instant) {
        let Some(session_id) = &self.session_id else {
            return;
        };
        let client = &mut self.client;
        let outcome = self
            .publisher
            .offer(position, session_id, now, |update| client.publish(update));
        if let PublishOutcome::Rejected(e) = outcome {
            debug!("[TrackingSession] Location not published: {}", e);
        }
    }

    fn on_transport_event(&mut self, generation: u64, event: TransportEvent, now: Instant) {
        let was_connected = self.client.state() == ConnectionState::Connected;
        if let Some(places) = self.client.handle_event(generation, event, now) {
            let plan = self.reconciler.reconcile(&places);
            reconciler::apply(&plan, &mut self.map);
        }

        // Fixes accepted while connecting were refused; offer the latest one
        if !was_connected && self.client.state() == ConnectionState::Connected {
            if let Some(position) = self.sampler.last_accepted().copied() {
                self.publish(&position, now);
            }
        }
    }

    fn persist_last_position(&self) {
        if let Some(position) = self.sampler.last_accepted() {
            match slot::store_position(self.slot.as_ref(), position) {
                Ok(()) => debug!("[TrackingSession] Periodic position save"),
                Err(e) => warn!("[TrackingSession] Periodic save failed: {}", e),
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Recenter => {
                if let Some(position) = self.sampler.last_accepted() {
                    self.map.pan_to(position.point());
                }
            }
            Command::Select(id) => {
                let plan = self.reconciler.select(id);
                reconciler::apply(&plan, &mut self.map);
            }
            Command::Reconnect => {
                if self.client.state() == ConnectionState::Failed {
                    info!("[TrackingSession] Manual reconnect");
                    self.client.deactivate();
                    self.activate_if_ready(Instant::now());
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the loop
            Command::Stop(_) => {}
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            connection: self.client.state(),
            sampling: self.sampler.is_running(),
            last_position: self.sampler.last_accepted().copied(),
            markers: self.reconciler.overlay().values().cloned().collect(),
            selected: self.reconciler.selected(),
        }
    }

    fn shutdown(&mut self) {
        self.sampler.stop(&mut self.source);
        self.client.deactivate();
        self.report_transitions();
        info!("[TrackingSession] Stopped");
    }
}
