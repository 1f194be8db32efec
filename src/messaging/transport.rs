use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Result;

/// Handle of one topic subscription on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Something the transport observed on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake (including authentication) completed.
    ///
    /// Carries the negotiated heart-beat: how often we must send one and how
    /// often the broker promised to. `None` disables that direction.
    Connected {
        send_every: Option<Duration>,
        expect_every: Option<Duration>,
    },
    /// A message arrived on a subscription
    Message {
        subscription: SubscriptionId,
        body: String,
    },
    /// The broker's heart-beat
    Heartbeat,
    /// The connection is gone or the handshake failed
    Closed { reason: String },
}

/// Events tagged with the connection generation they belong to.
pub type EventSender = mpsc::UnboundedSender<(u64, TransportEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

/// Where a transport reports events for one connection attempt.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: EventSender,
}

impl EventSink {
    pub fn new(generation: u64, tx: EventSender) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns false once the receiving side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`
    pub auth_token: Option<String>,
    pub heartbeat: Duration,
    pub timeout: Duration,
}

/// The bidirectional pub/sub channel.
///
/// Calls return as soon as the work is queued; outcomes arrive as
/// [`TransportEvent`]s on the sink passed to the latest `connect`.
pub trait MessagingTransport: Send {
    /// Start a connection attempt, abandoning any previous one.
    fn connect(&mut self, request: &ConnectRequest, sink: EventSink) -> Result<()>;
    fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId>;
    fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()>;
    fn publish(&mut self, destination: &str, body: String) -> Result<()>;
    fn heartbeat(&mut self) -> Result<()>;
    /// Close the connection gracefully. Safe to call when not connected.
    fn disconnect(&mut self);
}
