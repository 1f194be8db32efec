//! Shared fakes for the session scenarios.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use travel_tracker::messaging::ConnectRequest;
use travel_tracker::{
    EventSink, GpsPoint, MapSurface, MarkerIcon, MessagingTransport, PlaceMarker, Result, Session,
    SessionIssuer, SubscriptionId, TrackerError, TransportEvent,
};

/// Let every task run until the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ============================================================================
// Map surface
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MapCall {
    Add(i64, MarkerIcon),
    Icon(i64, MarkerIcon),
    Remove(i64),
    PlaceSelf(GpsPoint),
    MoveSelf(GpsPoint),
    Pan(GpsPoint),
}

#[derive(Clone, Default)]
pub struct RecordingMap(Arc<Mutex<Vec<MapCall>>>);

impl RecordingMap {
    pub fn calls(&self) -> Vec<MapCall> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn record(&self, call: MapCall) {
        self.0.lock().unwrap().push(call);
    }
}

impl MapSurface for RecordingMap {
    fn add_marker(&mut self, marker: &PlaceMarker, icon: MarkerIcon) {
        self.record(MapCall::Add(marker.id, icon));
    }
    fn update_marker_icon(&mut self, id: i64, icon: MarkerIcon) {
        self.record(MapCall::Icon(id, icon));
    }
    fn remove_marker(&mut self, id: i64) {
        self.record(MapCall::Remove(id));
    }
    fn place_self_marker(&mut self, at: GpsPoint) {
        self.record(MapCall::PlaceSelf(at));
    }
    fn move_self_marker(&mut self, at: GpsPoint) {
        self.record(MapCall::MoveSelf(at));
    }
    fn pan_to(&mut self, at: GpsPoint) {
        self.record(MapCall::Pan(at));
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Wire {
    Connect,
    Subscribe(SubscriptionId, String),
    Unsubscribe(SubscriptionId),
    Publish(String, String),
    Heartbeat,
    Disconnect,
}

#[derive(Default)]
struct TransportState {
    sink: Option<EventSink>,
    log: Vec<Wire>,
    next_id: u64,
    current: Option<SubscriptionId>,
    /// Answer every connect with Closed instead of Connected
    refuse: bool,
    /// Negotiate heart-beats off in both directions
    quiet: bool,
}

#[derive(Clone, Default)]
pub struct FakeTransport(Arc<Mutex<TransportState>>);

impl FakeTransport {
    pub fn refusing() -> Self {
        let fake = Self::default();
        fake.set_refuse(true);
        fake
    }

    /// A broker that answers `heart-beat:0,0` and never beats.
    pub fn quiet() -> Self {
        let fake = Self::default();
        fake.0.lock().unwrap().quiet = true;
        fake
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.0.lock().unwrap().refuse = refuse;
    }

    pub fn log(&self) -> Vec<Wire> {
        self.0.lock().unwrap().log.clone()
    }

    pub fn connects(&self) -> usize {
        self.log().iter().filter(|w| **w == Wire::Connect).count()
    }

    pub fn heartbeats(&self) -> usize {
        self.log().iter().filter(|w| **w == Wire::Heartbeat).count()
    }

    pub fn published(&self) -> Vec<serde_json::Value> {
        self.log()
            .into_iter()
            .filter_map(|w| match w {
                Wire::Publish(_, body) => serde_json::from_str(&body).ok(),
                _ => None,
            })
            .collect()
    }

    /// Push a message on the current subscription.
    pub fn deliver(&self, body: &str) {
        let state = self.0.lock().unwrap();
        let subscription = state.current.expect("not subscribed");
        state.sink.as_ref().unwrap().emit(TransportEvent::Message {
            subscription,
            body: body.to_string(),
        });
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self) {
        let state = self.0.lock().unwrap();
        state.sink.as_ref().unwrap().emit(TransportEvent::Closed {
            reason: "network lost".to_string(),
        });
    }
}

impl MessagingTransport for FakeTransport {
    fn connect(&mut self, _request: &ConnectRequest, sink: EventSink) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.log.push(Wire::Connect);
        // Subscriptions do not outlive their connection
        state.current = None;
        if state.refuse {
            sink.emit(TransportEvent::Closed {
                reason: "connection refused".to_string(),
            });
        } else {
            let every = (!state.quiet).then(|| Duration::from_millis(4000));
            sink.emit(TransportEvent::Connected {
                send_every: every,
                expect_every: every,
            });
        }
        state.sink = Some(sink);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId> {
        let mut state = self.0.lock().unwrap();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.current = Some(id);
        state.log.push(Wire::Subscribe(id, topic.to_string()));
        Ok(id)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if state.current == Some(id) {
            state.current = None;
        }
        state.log.push(Wire::Unsubscribe(id));
        Ok(())
    }

    fn publish(&mut self, destination: &str, body: String) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.log.push(Wire::Publish(destination.to_string(), body));
        Ok(())
    }

    /// A live broker beats back.
    fn heartbeat(&mut self) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.log.push(Wire::Heartbeat);
        if let Some(sink) = &state.sink {
            sink.emit(TransportEvent::Heartbeat);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.0.lock().unwrap();
        state.sink = None;
        state.log.push(Wire::Disconnect);
    }
}

// ============================================================================
// Issuer
// ============================================================================

pub struct FakeIssuer {
    id: String,
    calls: AtomicU32,
    failures: AtomicU32,
    /// Answer every request with this HTTP status
    reject_with: Option<u16>,
}

impl FakeIssuer {
    pub fn new(id: &str) -> Arc<Self> {
        Self::failing(id, 0)
    }

    /// Fails the first `failures` requests.
    pub fn failing(id: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(failures),
            reject_with: None,
        })
    }

    /// The backend refuses every request, e.g. with 403 for bad credentials.
    pub fn rejecting(status: u16) -> Arc<Self> {
        Arc::new(Self {
            id: String::new(),
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            reject_with: Some(status),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SessionIssuer for FakeIssuer {
    fn issue(&self) -> BoxFuture<'_, Result<Session>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.reject_with {
                return Err(TrackerError::Http {
                    message: format!("Session endpoint returned {}", status),
                    status_code: Some(status),
                });
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TrackerError::Issuance {
                    message: "backend unavailable".to_string(),
                });
            }
            Ok(Session::new(self.id.clone()))
        }
        .boxed()
    }
}
