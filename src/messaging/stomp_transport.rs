//! STOMP-over-text-link implementation of [`MessagingTransport`].
//!
//! The host provides a [`TextLink`] that can dial the broker URL and hand
//! back a pair of text channels (typically a WebSocket). Each `connect`
//! spawns one task that owns the link: it performs the STOMP handshake,
//! forwards queued outbound frames, and turns inbound frames into
//! [`TransportEvent`]s. Inbound text is reassembled, so a frame may span
//! several text messages.

use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::transport::{ConnectRequest, EventSink, MessagingTransport, SubscriptionId, TransportEvent};
use crate::error::{Result, TrackerError};
use crate::stomp::{Command, Frame, FrameBuffer, HeartBeat, Inbound};

/// Both directions of an established text connection.
pub struct LinkChannels {
    pub outgoing: UnboundedSender<String>,
    pub incoming: UnboundedReceiver<String>,
}

/// Dials the broker. Implemented by the host (WebSocket, SockJS, ...).
pub trait TextLink: Send + Sync + 'static {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<LinkChannels>>;
}

const SUBSCRIPTION_PREFIX: &str = "sub-";

pub struct StompTransport<L: TextLink> {
    link: Arc<L>,
    /// Encoded frames for the connection task
    outgoing: Option<UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    next_subscription: u64,
}

impl<L: TextLink> StompTransport<L> {
    pub fn new(link: L) -> Self {
        Self {
            link: Arc::new(link),
            outgoing: None,
            task: None,
            next_subscription: 0,
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or_else(|| not_connected("no connection"))?;
        tx.send(frame.encode())
            .map_err(|_| not_connected("connection task ended"))
    }
}

impl<L: TextLink> Drop for StompTransport<L> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn not_connected(reason: &str) -> TrackerError {
    TrackerError::TransportDisconnected {
        reason: reason.to_string(),
    }
}

impl<L: TextLink> MessagingTransport for StompTransport<L> {
    fn connect(&mut self, request: &ConnectRequest, sink: EventSink) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);

        let link = Arc::clone(&self.link);
        let request = request.clone();
        self.task = Some(tokio::spawn(async move {
            let generation = sink.generation();
            match run_connection(link, &request, &sink, rx).await {
                Ok(()) => debug!("[StompTransport] Connection {} closed", generation),
                Err(e) => {
                    warn!("[StompTransport] Connection {} lost: {}", generation, e);
                    sink.emit(TransportEvent::Closed {
                        reason: e.to_string(),
                    });
                }
            }
        }));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId> {
        let id = self.next_subscription;
        let frame = Frame::subscribe(&format!("{}{}", SUBSCRIPTION_PREFIX, id), topic);
        self.send_frame(&frame)?;
        self.next_subscription += 1;
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        self.send_frame(&Frame::unsubscribe(&format!("{}{}", SUBSCRIPTION_PREFIX, id.0)))
    }

    fn publish(&mut self, destination: &str, body: String) -> Result<()> {
        self.send_frame(&Frame::send(destination, body))
    }

    fn heartbeat(&mut self) -> Result<()> {
        let tx = self
            .outgoing
            .as_ref()
            .ok_or_else(|| not_connected("no connection"))?;
        tx.send("\n".to_string())
            .map_err(|_| not_connected("connection task ended"))
    }

    fn disconnect(&mut self) {
        if self.outgoing.is_some() {
            let _ = self.send_frame(&Frame::disconnect("disconnect"));
        }
        // Dropping the sender lets the task flush DISCONNECT and finish
        self.outgoing = None;
        self.task = None;
    }
}

/// STOMP virtual host for a broker URL: the authority without port.
fn virtual_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    if authority.starts_with('[') {
        // IPv6 literal
        return authority.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(authority);
    }
    authority.split(':').next().unwrap_or(authority)
}

async fn run_connection<L: TextLink>(
    link: Arc<L>,
    request: &ConnectRequest,
    sink: &EventSink,
    mut frames: UnboundedReceiver<String>,
) -> Result<()> {
    let mut buffer = FrameBuffer::new();
    let handshake = async {
        let mut channels = link.dial(&request.url).await?;
        let offer = HeartBeat::symmetric(request.heartbeat);
        let connect = Frame::connect(
            virtual_host(&request.url),
            request.auth_token.as_deref(),
            offer,
        );
        channels
            .outgoing
            .send(connect.encode())
            .map_err(|_| not_connected("link closed during handshake"))?;
        let (connected, early) = await_connected(&mut channels.incoming, &mut buffer).await?;
        Ok::<_, TrackerError>((channels, offer, connected, early))
    };

    let (mut channels, offer, connected, early) = timeout(request.timeout, handshake)
        .await
        .map_err(|_| TrackerError::Handshake {
            message: format!("no CONNECTED within {:?}", request.timeout),
        })??;

    let server = connected
        .get("heart-beat")
        .and_then(HeartBeat::parse)
        .unwrap_or(HeartBeat {
            outgoing_ms: 0,
            incoming_ms: 0,
        });
    let (send_every, expect_every) = offer.negotiate(&server);
    info!(
        "[StompTransport] Connected to {} (version {}, send {:?}, expect {:?})",
        virtual_host(&request.url),
        connected.get("version").unwrap_or("1.0"),
        send_every,
        expect_every
    );

    if !sink.emit(TransportEvent::Connected {
        send_every,
        expect_every,
    }) {
        return Ok(());
    }
    dispatch(early, sink)?;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(text) => channels
                    .outgoing
                    .send(text)
                    .map_err(|_| not_connected("link closed"))?,
                // Transport dropped its sender: graceful disconnect
                None => return Ok(()),
            },
            text = channels.incoming.recv() => match text {
                Some(text) => dispatch(buffer.push(&text)?, sink)?,
                None => return Err(not_connected("link closed by peer")),
            },
        }
    }
}

/// Wait for CONNECTED, ignoring heart-beats. ERROR fails the handshake.
///
/// Units that followed CONNECTED in the same text are returned with it.
async fn await_connected(
    incoming: &mut UnboundedReceiver<String>,
    buffer: &mut FrameBuffer,
) -> Result<(Frame, Vec<Inbound>)> {
    while let Some(text) = incoming.recv().await {
        let mut units = buffer.push(&text)?.into_iter();
        while let Some(inbound) = units.next() {
            match inbound {
                Inbound::Frame(frame) if frame.command == Command::Connected => {
                    return Ok((frame, units.collect()))
                }
                Inbound::Frame(frame) if frame.command == Command::Error => {
                    return Err(TrackerError::Handshake {
                        message: frame.get("message").unwrap_or("rejected").to_string(),
                    })
                }
                _ => {}
            }
        }
    }
    Err(not_connected("link closed during handshake"))
}

fn dispatch(units: Vec<Inbound>, sink: &EventSink) -> Result<()> {
    for inbound in units {
        let frame = match inbound {
            Inbound::Heartbeat => {
                sink.emit(TransportEvent::Heartbeat);
                continue;
            }
            Inbound::Frame(frame) => frame,
        };

        match frame.command {
            Command::Message => {
                let subscription = frame
                    .get("subscription")
                    .and_then(|s| s.strip_prefix(SUBSCRIPTION_PREFIX))
                    .and_then(|n| n.parse().ok());
                match subscription {
                    Some(id) => {
                        sink.emit(TransportEvent::Message {
                            subscription: SubscriptionId(id),
                            body: frame.body,
                        });
                    }
                    None => debug!("[StompTransport] MESSAGE without known subscription"),
                }
            }
            Command::Error => {
                return Err(not_connected(frame.get("message").unwrap_or("broker error")));
            }
            other => debug!("[StompTransport] Ignoring {}", other),
        }
    }
    Ok(())
}
