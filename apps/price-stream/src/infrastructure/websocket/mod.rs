//! WebSocket Price Feed
//!
//! `GET /ws/prices` upgrades to a WebSocket that streams price frames from
//! the [`BroadcastHub`](crate::infrastructure::broadcast::BroadcastHub).
//!
//! # Protocol
//!
//! - `?symbols=AAPL,MSFT` restricts the feed to those symbols. Without the
//!   parameter the connection receives every symbol.
//! - Server frames are JSON text: `{"type":"price",...}` for changes,
//!   `{"type":"subscription","filter":...}` after connecting and after every
//!   command, `{"type":"error","message":...}` for rejected commands.
//! - Client commands: `{"action":"subscribe","symbols":[...]}` and
//!   `{"action":"unsubscribe","symbols":[...]}`. An unsubscribe with an empty
//!   list ends the stream.
//!
//! The connection is registered before the upgrade completes, so a full
//! hub answers `503` instead of accepting the socket.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::domain::pricing::Symbol;
use crate::domain::subscription::{ConnectionId, Subscription, SymbolFilter};
use crate::infrastructure::broadcast::SharedBroadcastHub;
use crate::infrastructure::metrics;

/// Path of the price feed.
pub const PRICE_FEED_PATH: &str = "/ws/prices";

// =============================================================================
// Router
// =============================================================================

/// Router serving the price feed.
pub fn router(hub: SharedBroadcastHub) -> Router {
    Router::new()
        .route(PRICE_FEED_PATH, get(upgrade_handler))
        .with_state(hub)
}

/// Query parameters of the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    /// Comma-separated symbols. Absent means every symbol.
    pub symbols: Option<String>,
}

impl FeedParams {
    /// Filter requested by the client.
    #[must_use]
    pub fn filter(&self) -> SymbolFilter {
        match self.symbols.as_deref().map(parse_symbols) {
            Some(symbols) if !symbols.is_empty() => SymbolFilter::symbols(symbols),
            _ => SymbolFilter::All,
        }
    }
}

fn parse_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .map(Symbol::new)
        .filter(|symbol| !symbol.is_empty())
        .collect()
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<FeedParams>,
    State(hub): State<SharedBroadcastHub>,
) -> Response {
    let (subscription, rx) = match hub.open_connection(params.filter()) {
        Ok(opened) => opened,
        Err(error) => {
            tracing::warn!(error = %error, "Refusing price feed connection");
            return (StatusCode::SERVICE_UNAVAILABLE, error.to_string()).into_response();
        }
    };

    let id = subscription.id;
    let failed_hub = Arc::clone(&hub);
    ws.on_failed_upgrade(move |error| {
        tracing::debug!(connection_id = id, error = %error, "WebSocket upgrade failed");
        failed_hub.unregister(id);
    })
    .on_upgrade(move |socket| serve_connection(socket, hub, subscription, rx))
}

// =============================================================================
// Connection Task
// =============================================================================

async fn serve_connection(
    socket: WebSocket,
    hub: SharedBroadcastHub,
    subscription: Subscription,
    mut rx: broadcast::Receiver<Arc<str>>,
) {
    let id = subscription.id;
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(connection_id = id, filter = ?subscription.filter, "Price feed connected");

    if sender
        .send(Message::Text(subscription_frame(&subscription).into()))
        .await
        .is_err()
    {
        hub.unregister(id);
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    metrics::record_frames_dropped(skipped);
                    tracing::debug!(connection_id = id, skipped, "Slow connection skipped frames");
                }
                // The hub dropped our sink.
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match handle_command(&hub, id, text.as_str()) {
                    CommandOutcome::Reply(reply) => {
                        if sender.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                    CommandOutcome::Close => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: Utf8Bytes::from_static("unsubscribed"),
                            })))
                            .await;
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(connection_id = id, error = %error, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    hub.unregister(id);
    tracing::info!(connection_id = id, "Price feed disconnected");
}

// =============================================================================
// Client Commands
// =============================================================================

/// Command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Add symbols to the connection's filter.
    Subscribe {
        /// Symbols to add.
        #[serde(default)]
        symbols: Vec<String>,
    },
    /// Remove symbols from the connection's filter. Empty closes the feed.
    Unsubscribe {
        /// Symbols to remove.
        #[serde(default)]
        symbols: Vec<String>,
    },
}

/// What the connection task does after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Send this frame back.
    Reply(String),
    /// Unregister and close the socket.
    Close,
}

/// Apply a client command to the hub.
pub fn handle_command(hub: &SharedBroadcastHub, id: ConnectionId, text: &str) -> CommandOutcome {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(error) => return CommandOutcome::Reply(error_frame(&format!("invalid command: {error}"))),
    };

    let updated = match command {
        ClientCommand::Subscribe { symbols } => {
            hub.subscribe_symbols(id, &normalize(&symbols))
        }
        ClientCommand::Unsubscribe { symbols } if symbols.is_empty() => {
            hub.unregister(id);
            return CommandOutcome::Close;
        }
        ClientCommand::Unsubscribe { symbols } => {
            hub.unsubscribe_symbols(id, &normalize(&symbols))
        }
    };

    updated.map_or(CommandOutcome::Close, |subscription| {
        CommandOutcome::Reply(subscription_frame(&subscription))
    })
}

fn normalize(symbols: &[String]) -> Vec<Symbol> {
    symbols
        .iter()
        .map(Symbol::new)
        .filter(|symbol| !symbol.is_empty())
        .collect()
}

fn subscription_frame(subscription: &Subscription) -> String {
    let filter = match &subscription.filter {
        SymbolFilter::All => json!("all"),
        SymbolFilter::Symbols(set) => {
            let mut symbols: Vec<&str> = set.iter().map(Symbol::as_str).collect();
            symbols.sort_unstable();
            json!(symbols)
        }
    };
    json!({ "type": "subscription", "filter": filter }).to_string()
}

fn error_frame(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}

// =============================================================================
// Tests
// =============================================================================
