//! # Messaging
//!
//! Publish/subscribe plumbing between the tracker and the coordination
//! backend.
//!
//! - [`MessagingTransport`] - the channel collaborator (connect, subscribe,
//!   publish, heartbeat). Everything it learns after a call returns (the
//!   handshake outcome, inbound messages, disconnects) comes back as a
//!   [`TransportEvent`] through the [`EventSink`] handed to `connect`.
//! - [`MessagingClient`] - the connection state machine with bounded
//!   reconnection, reused for the lifetime of a session.
//! - [`StompTransport`] - a transport speaking STOMP 1.2 over any
//!   [`TextLink`] (typically a WebSocket).

mod client;
mod stomp_transport;
mod transport;

pub use client::{ConnectionState, MessagingClient};
pub use stomp_transport::{LinkChannels, StompTransport, TextLink};
pub use transport::{
    ConnectRequest, EventReceiver, EventSender, EventSink, MessagingTransport, SubscriptionId,
    TransportEvent,
};
