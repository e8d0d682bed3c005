//! WebSocket push endpoint: a single `/ws` connection accepts
//! `{"action":"subscribe"|"unsubscribe"|"getStats","symbol":...,"types":[...]}`
//! control frames and, once subscribed, receives one push frame per matching
//! `DataEvent` the dispatch hub broadcasts.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{AppState, CandleResponse};
use crate::provider::DataEvent;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(websocket_handler))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    action: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    types: Vec<String>,
}

fn event_type_name(event: &DataEvent) -> &'static str {
    match event {
        DataEvent::Ticker { .. } => "TICKER",
        DataEvent::Kline(_) => "KLINE",
        DataEvent::Trade(_) => "TRADE",
        DataEvent::AggregateTrade(_) => "AGGREGATE_TRADE",
        DataEvent::OrderBook(_) => "ORDER_BOOK",
        DataEvent::BookTicker(_) => "BOOK_TICKER",
    }
}

fn event_symbol(event: &DataEvent) -> &str {
    match event {
        DataEvent::Ticker { symbol, .. } => symbol,
        DataEvent::Kline(c) => &c.symbol,
        DataEvent::Trade(t) | DataEvent::AggregateTrade(t) => &t.symbol,
        DataEvent::OrderBook(s) => &s.symbol,
        DataEvent::BookTicker(s) => &s.symbol,
    }
}

fn event_payload(event: &DataEvent) -> serde_json::Value {
    match event {
        DataEvent::Ticker { provider, symbol, price, timestamp } => json!({
            "provider": provider,
            "symbol": symbol,
            "price": price,
            "timestamp": timestamp,
        }),
        DataEvent::Kline(candle) => serde_json::to_value(CandleResponse::from(candle)).unwrap_or(serde_json::Value::Null),
        DataEvent::Trade(trade) | DataEvent::AggregateTrade(trade) => {
            serde_json::to_value(trade).unwrap_or(serde_json::Value::Null)
        }
        DataEvent::OrderBook(snapshot) => serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
        DataEvent::BookTicker(snapshot) => serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.hub.subscribe_events();
    // `(symbol, type)` pairs this connection currently wants pushed.
    let mut subscriptions: HashSet<(String, String)> = HashSet::new();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ws connection lagged behind event broadcast");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let type_name = event_type_name(&event);
                let key = (event_symbol(&event).to_string(), type_name.to_string());
                if !subscriptions.contains(&key) {
                    continue;
                }
                let frame = json!({ "type": type_name, "symbol": key.0, "data": event_payload(&event) });
                if socket.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        if text == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string())).await;
                            continue;
                        }
                        let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else { continue };
                        handle_client_message(&mut socket, &mut subscriptions, client_msg).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_message(socket: &mut WebSocket, subscriptions: &mut HashSet<(String, String)>, msg: ClientMessage) {
    match msg.action.as_str() {
        "subscribe" => {
            let Some(symbol) = msg.symbol else { return };
            for t in msg.types {
                subscriptions.insert((symbol.clone(), t));
            }
        }
        "unsubscribe" => {
            let Some(symbol) = msg.symbol else { return };
            for t in msg.types {
                subscriptions.remove(&(symbol.clone(), t));
            }
        }
        "getStats" => {
            let stats = json!({
                "type": "stats",
                "data": { "subscriptions": subscriptions.len() },
            });
            let _ = socket.send(Message::Text(stats.to_string())).await;
        }
        _ => {}
    }
}
