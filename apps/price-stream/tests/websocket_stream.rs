//! WebSocket Price Feed Integration Tests
//!
//! Runs the feed router on a random port and talks to it with a real
//! WebSocket client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use price_stream::application::ports::PricePublisher;
use price_stream::infrastructure::websocket;
use price_stream::{BroadcastConfig, BroadcastHub, BroadcastMessage, PriceKind, Symbol};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(hub: Arc<BroadcastHub>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, websocket::router(hub)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws/prices{query}"))
        .await
        .unwrap();
    client
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn message(symbol: &str, cents: i64) -> BroadcastMessage {
    BroadcastMessage {
        symbol: Symbol::new(symbol),
        kind: PriceKind::Realtime,
        value: Decimal::new(cents, 2),
        observed_at: Utc::now(),
        previous_value: None,
        daily_change: None,
        daily_change_percent: None,
    }
}

async fn wait_for_connections(hub: &BroadcastHub, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.stats().connections != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

#[tokio::test]
async fn filtered_connection_receives_only_its_symbols() {
    let hub = Arc::new(BroadcastHub::with_defaults());
    let addr = start_server(Arc::clone(&hub)).await;
    let mut client = connect(addr, "?symbols=aapl").await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack, json!({"type": "subscription", "filter": ["AAPL"]}));

    hub.publish(&message("MSFT", 40_000));
    hub.publish(&message("AAPL", 19_050));

    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "price");
    assert_eq!(frame["symbol"], "AAPL");
    assert_eq!(frame["value"], "190.50");
}

#[tokio::test]
async fn subscribe_command_widens_the_feed() {
    let hub = Arc::new(BroadcastHub::with_defaults());
    let addr = start_server(Arc::clone(&hub)).await;
    let mut client = connect(addr, "?symbols=AAPL").await;
    next_json(&mut client).await;

    client
        .send(Message::Text(
            r#"{"action":"subscribe","symbols":["msft"]}"#.into(),
        ))
        .await
        .unwrap();
    let ack = next_json(&mut client).await;
    assert_eq!(ack["filter"], json!(["AAPL", "MSFT"]));

    hub.publish(&message("MSFT", 40_000));
    let frame = next_json(&mut client).await;
    assert_eq!(frame["symbol"], "MSFT");
}

#[tokio::test]
async fn connection_without_filter_receives_everything() {
    let hub = Arc::new(BroadcastHub::with_defaults());
    let addr = start_server(Arc::clone(&hub)).await;
    let mut client = connect(addr, "").await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["filter"], "all");

    hub.publish(&message("GOOG", 17_000));
    hub.publish(&message("TSLA", 18_000));

    assert_eq!(next_json(&mut client).await["symbol"], "GOOG");
    assert_eq!(next_json(&mut client).await["symbol"], "TSLA");
}

#[tokio::test]
async fn disconnect_unregisters_promptly() {
    let hub = Arc::new(BroadcastHub::with_defaults());
    let addr = start_server(Arc::clone(&hub)).await;
    let mut client = connect(addr, "").await;
    next_json(&mut client).await;
    assert_eq!(hub.stats().connections, 1);

    client.close(None).await.unwrap();

    wait_for_connections(&hub, 0).await;
}

#[tokio::test]
async fn empty_unsubscribe_closes_the_feed() {
    let hub = Arc::new(BroadcastHub::with_defaults());
    let addr = start_server(Arc::clone(&hub)).await;
    let mut client = connect(addr, "?symbols=AAPL").await;
    next_json(&mut client).await;

    client
        .send(Message::Text(r#"{"action":"unsubscribe","symbols":[]}"#.into()))
        .await
        .unwrap();

    let closing = timeout(Duration::from_secs(2), client.next()).await.unwrap();
    assert!(matches!(closing, Some(Ok(Message::Close(_))) | None));
    wait_for_connections(&hub, 0).await;
}

#[tokio::test]
async fn full_hub_refuses_the_upgrade() {
    let hub = Arc::new(BroadcastHub::new(BroadcastConfig {
        queue_capacity: 8,
        max_connections: 1,
    }));
    let addr = start_server(Arc::clone(&hub)).await;
    let mut first = connect(addr, "").await;
    next_json(&mut first).await;

    let refused = connect_async(format!("ws://{addr}/ws/prices")).await;

    match refused {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected HTTP 503, got {:?}", other.map(|_| ())),
    }
    assert_eq!(hub.stats().connections, 1);
}
