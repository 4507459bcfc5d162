//! Live Subscription — WebSocket endpoint streaming traffic snapshots and
//! deltas to the inspection UI.

use crate::events::EventObserver;
use crate::model::Event;
use crate::store::TrafficStore;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const PING_INTERVAL: Duration = Duration::from_secs(60);
const PONG_TIMEOUT: Duration = Duration::from_secs(90);
const BROADCAST_CAPACITY: usize = 1024;

/// A named, JSON-enveloped message sent to subscribers:
/// `{ "event": "<name>", "payload": ... }`.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    event: String,
    payload: T,
}

fn envelope<T: Serialize>(event: impl Into<String>, payload: T) -> Message {
    let event = event.into();
    let body = serde_json::to_string(&Envelope { event, payload })
        .unwrap_or_else(|_| "{\"event\":\"encode_error\",\"payload\":null}".to_string());
    Message::Text(body.into())
}

/// An incoming named event from a UI client. `payload` is left as raw
/// JSON since its shape varies by `event`.
#[derive(Deserialize)]
struct IncomingEnvelope {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Payload shape for `request_details` / `response_details` lookups.
#[derive(Deserialize)]
struct IdLookup {
    id: String,
}

/// Fans finished/updated traffic events out to every connected WebSocket
/// client, and hands new connections an initial snapshot from the store.
pub struct LiveSubscription {
    store: Arc<TrafficStore>,
    sender: broadcast::Sender<Message>,
    next_connection_id: AtomicU64,
}

impl LiveSubscription {
    pub fn new(store: Arc<TrafficStore>) -> Arc<Self> {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            store,
            sender,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Accept a hijacked TCP connection as a WebSocket client, serve its
    /// lifecycle to completion, and return once the client disconnects.
    pub async fn serve_connection(self: &Arc<Self>, stream: TcpStream) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(connection_id, "websocket handshake failed: {e}");
                return;
            }
        };

        let (mut write, mut read) = ws.split();

        let snapshot = self.store.list();
        if write
            .send(envelope("traffic_entries", snapshot))
            .await
            .is_err()
        {
            return;
        }

        let mut updates = self.sender.subscribe();
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        let mut awaiting_pong = false;
        let mut last_pong = tokio::time::Instant::now();

        loop {
            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Ok(msg) => {
                            if write.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(connection_id, skipped, "subscriber lagged, resending snapshot");
                            let snapshot = self.store.list();
                            if write.send(envelope("traffic_entries", snapshot)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                            last_pong = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_incoming(connection_id, &text) {
                                if write.send(reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(connection_id, "websocket read error: {e}");
                            break;
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                        debug!(connection_id, "client missed pong deadline, closing");
                        break;
                    }
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    awaiting_pong = true;
                }
            }
        }

        debug!(connection_id, "subscriber disconnected");
    }

    fn broadcast(&self, event: impl Into<String>, payload: impl Serialize) {
        let _ = self.sender.send(envelope(event, payload));
    }

    /// Handle one named event received from a UI client. `traffic_clear`
    /// mutates shared state and fans out to every subscriber; the rest
    /// are answered directly to the requesting connection.
    fn handle_incoming(&self, connection_id: u64, text: &str) -> Option<Message> {
        let incoming: IncomingEnvelope = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(connection_id, "ignoring malformed subscriber message: {e}");
                return None;
            }
        };

        match incoming.event.as_str() {
            "traffic_entries" => Some(envelope("traffic_entries", self.store.list())),
            "request_details" | "response_details" => {
                let lookup: IdLookup = serde_json::from_value(incoming.payload).ok()?;
                let entry = self.store.get(&lookup.id)?;
                Some(envelope(incoming.event, entry))
            }
            "traffic_clear" => {
                self.store.clear();
                self.broadcast("traffic_clear", serde_json::json!({}));
                None
            }
            "heartbeat" => Some(envelope("heartbeat", serde_json::json!({}))),
            other => {
                debug!(connection_id, event = other, "unrecognized subscriber event");
                None
            }
        }
    }
}

impl EventObserver for LiveSubscription {
    /// Only response-side events (including SSE lines and errors) produce
    /// a delta — `RequestObserved` alone does not, so a plain exchange
    /// yields exactly one `traffic_new_entry` per completion rather than
    /// one at insertion and another at completion. The Traffic Store
    /// observes events first (registration order on the Event Bus), so by
    /// the time this observer runs `self.store.get` already reflects the
    /// update being announced.
    fn on_event(&self, event: &Event) {
        match event {
            Event::RequestObserved { .. } => {}
            Event::ResponseObserved { id, .. } | Event::SSELine { id, .. } | Event::Error { id, .. } => {
                if let Some(entry) = self.store.get(id) {
                    self.broadcast("traffic_new_entry", entry)
                }
            }
            Event::TunnelEstablished { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_named_event() {
        let msg = envelope("traffic_clear", serde_json::json!({}));
        let Message::Text(text) = msg else {
            panic!("expected text message");
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["event"], "traffic_clear");
    }

    #[test]
    fn broadcast_without_subscribers_does_not_error() {
        let store = Arc::new(TrafficStore::new(10));
        let subscription = LiveSubscription::new(store);
        subscription.broadcast("heartbeat", serde_json::json!({}));
    }

    #[test]
    fn traffic_clear_request_empties_the_store() {
        let store = Arc::new(TrafficStore::new(10));
        store.insert(crate::model::TrafficEntry::new(
            "GET".into(),
            "http://example.test/".into(),
            "http".into(),
            "example.test".into(),
            "/".into(),
        ));
        let subscription = LiveSubscription::new(store.clone());
        let reply = subscription.handle_incoming(1, r#"{"event":"traffic_clear","payload":{}}"#);
        assert!(reply.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn response_details_lookup_returns_entry() {
        let store = Arc::new(TrafficStore::new(10));
        let mut entry = crate::model::TrafficEntry::new(
            "GET".into(),
            "http://example.test/".into(),
            "http".into(),
            "example.test".into(),
            "/".into(),
        );
        entry.id = "abc".into();
        store.insert(entry);
        let subscription = LiveSubscription::new(store);
        let reply = subscription
            .handle_incoming(1, r#"{"event":"response_details","payload":{"id":"abc"}}"#)
            .expect("lookup should resolve");
        let Message::Text(text) = reply else {
            panic!("expected text message");
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["event"], "response_details");
        assert_eq!(parsed["payload"]["id"], "abc");
    }
}
