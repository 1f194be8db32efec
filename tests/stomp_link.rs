//! `MessagingClient` over a real `StompTransport`, with the broker side
//! played by the test through an in-memory text link.
//!
//! Run with: `cargo test --test stomp_link`

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Instant};
use travel_tracker::messaging::{
    EventReceiver, LinkChannels, MessagingClient, StompTransport, TextLink,
};
use travel_tracker::{ConnectionState, MessagingConfig, PlaceRecord, Result};

/// Broker end of one dialed connection.
struct Broker {
    from_client: UnboundedReceiver<String>,
    to_client: UnboundedSender<String>,
}

impl Broker {
    fn reply(&self, text: &str) {
        self.to_client.send(text.to_string()).unwrap();
    }

    /// Everything the client has sent so far.
    fn received(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            out.push(text);
        }
        out
    }
}

struct MemoryLink {
    accepted: UnboundedSender<Broker>,
}

impl TextLink for MemoryLink {
    fn dial(&self, _url: &str) -> BoxFuture<'static, Result<LinkChannels>> {
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let _ = self.accepted.send(Broker {
            from_client,
            to_client,
        });
        futures::future::ready(Ok(LinkChannels { outgoing, incoming })).boxed()
    }
}

struct Pair {
    client: MessagingClient<StompTransport<MemoryLink>>,
    events: EventReceiver,
    brokers: UnboundedReceiver<Broker>,
}

impl Pair {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (accepted, brokers) = mpsc::unbounded_channel();
        let (tx, events) = mpsc::unbounded_channel();
        let transport = StompTransport::new(MemoryLink { accepted });
        Self {
            client: MessagingClient::new(transport, MessagingConfig::default(), tx),
            events,
            brokers,
        }
    }

    /// Let the connection task run, hand its events to the client, then
    /// let whatever the client sent in response reach the broker.
    async fn pump(&mut self) -> Vec<Vec<PlaceRecord>> {
        sleep(Duration::from_millis(10)).await;
        let mut places = Vec::new();
        while let Ok((generation, event)) = self.events.try_recv() {
            if let Some(list) = self.client.handle_event(generation, event, Instant::now()) {
                places.push(list);
            }
        }
        sleep(Duration::from_millis(10)).await;
        places
    }

    /// Accept the next dial and complete the handshake.
    async fn accept(&mut self, heart_beat: &str) -> Broker {
        let mut broker = self.brokers.recv().await.unwrap();
        let connect = broker.from_client.recv().await.unwrap();
        assert!(connect.starts_with("CONNECT\n"));
        broker.reply(&format!(
            "CONNECTED\nversion:1.2\nheart-beat:{}\n\n\0",
            heart_beat
        ));
        self.pump().await;
        broker
    }

    fn state(&self) -> ConnectionState {
        self.client.state()
    }

    async fn tick_after(&mut self, wait: Duration) {
        sleep(wait).await;
        self.client.heartbeat(Instant::now());
        self.pump().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_opens_with_subscribe() {
    let mut pair = Pair::new();
    pair.client.activate("abc", Instant::now());

    let mut first = pair.accept("4000,4000").await;
    assert_eq!(pair.state(), ConnectionState::Connected);
    let sent = first.received();
    assert!(sent[0].starts_with("SUBSCRIBE\nid:sub-0\ndestination:/topic/location/abc\n"));

    drop(first);
    pair.pump().await;
    assert_eq!(pair.state(), ConnectionState::Reconnecting);

    sleep(Duration::from_secs(5)).await;
    pair.client.retry_if_due(Instant::now());
    let mut second = pair.accept("4000,4000").await;
    assert_eq!(pair.state(), ConnectionState::Connected);

    let sent = second.received();
    assert!(
        sent[0].starts_with("SUBSCRIBE\nid:sub-1\ndestination:/topic/location/abc\n"),
        "first frame on the new connection: {:?}",
        sent[0]
    );
    assert!(!sent.iter().any(|f| f.starts_with("UNSUBSCRIBE")));

    // A graceful stop releases the live subscription only
    pair.client.deactivate();
    sleep(Duration::from_millis(10)).await;
    let sent = second.received();
    assert!(sent[0].starts_with("UNSUBSCRIBE\nid:sub-1\n"));
    assert!(sent[1].starts_with("DISCONNECT\n"));
}

#[tokio::test(start_paused = true)]
async fn test_broker_without_heartbeats_keeps_quiet_link() {
    let mut pair = Pair::new();
    pair.client.activate("abc", Instant::now());
    let mut broker = pair.accept("0,0").await;
    assert_eq!(pair.client.heartbeat_deadline(), None);
    broker.received();

    for _ in 0..3 {
        pair.tick_after(Duration::from_secs(4)).await;
        assert_eq!(pair.state(), ConnectionState::Connected);
    }
    pair.tick_after(Duration::from_secs(60)).await;
    assert_eq!(pair.state(), ConnectionState::Connected);
    // No heart-beat EOLs went out
    assert!(broker.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_asymmetric_heartbeat_offer() {
    let mut pair = Pair::new();
    pair.client.activate("abc", Instant::now());
    // Broker beats every 10s and wants none from us
    let mut broker = pair.accept("10000,0").await;
    broker.received();

    pair.tick_after(Duration::from_secs(15)).await;
    assert_eq!(pair.state(), ConnectionState::Connected);

    broker.reply("\n");
    pair.pump().await;
    pair.tick_after(Duration::from_secs(19)).await;
    assert_eq!(pair.state(), ConnectionState::Connected);
    assert!(broker.received().is_empty());

    // Two of its intervals without a beat
    pair.tick_after(Duration::from_secs(2)).await;
    assert_eq!(pair.state(), ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_place_list_split_across_texts() {
    let mut pair = Pair::new();
    pair.client.activate("abc", Instant::now());
    let broker = pair.accept("4000,4000").await;

    broker.reply("MESSAGE\nsubscription:sub-0\nmessage-id:7\n\n[{\"id\": 3, ");
    assert!(pair.pump().await.is_empty());
    broker.reply("\"lat\": 37.5, \"lng\": 127.0}]\0");
    let places = pair.pump().await;

    assert_eq!(places.len(), 1);
    assert_eq!(places[0][0].id, 3);
    assert_eq!(pair.state(), ConnectionState::Connected);
}
