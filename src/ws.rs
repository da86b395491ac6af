use crate::alerts::AlertDecision;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Wire envelope for everything the server pushes or answers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    fn new(kind: &str, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    fn reply(kind: &str, data: serde_json::Value, request_id: Option<String>) -> Self {
        Self {
            request_id,
            ..Self::new(kind, data)
        }
    }

    fn to_text(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[derive(Debug, Deserialize)]
struct ClientRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// Fan-out point for realtime updates. Slow clients lag on their own
/// broadcast receiver and simply skip missed frames.
#[derive(Clone)]
pub struct WsHub {
    tx: broadcast::Sender<String>,
}

impl WsHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn broadcast_system_update(
        &self,
        cpu_percent: f64,
        memory_percent: f64,
        disk_percent: f64,
        uptime_secs: u64,
    ) {
        let uptime = humantime::format_duration(Duration::from_secs(uptime_secs)).to_string();
        self.broadcast(Envelope::new(
            "system_update",
            json!({
                "cpu_usage": cpu_percent,
                "memory_usage": memory_percent,
                "disk_usage": disk_percent,
                "uptime": uptime,
            }),
        ));
    }

    pub fn broadcast_alert(&self, decision: &AlertDecision) {
        match serde_json::to_value(decision) {
            Ok(data) => self.broadcast(Envelope::new("alert", data)),
            Err(err) => warn!(error = %err, "failed to serialize alert for websocket"),
        }
    }

    fn broadcast(&self, envelope: Envelope) {
        if let Some(text) = envelope.to_text() {
            // Send only fails when no client is connected.
            let _ = self.tx.send(text);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Per-connection loop: forwards hub broadcasts and answers client
/// requests in place.
pub async fn handle_socket(socket: WebSocket, hub: WsHub) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = hub.subscribe();
    debug!(clients = hub.client_count(), "websocket client connected");

    loop {
        tokio::select! {
            broadcasted = rx.recv() => match broadcasted {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "websocket client lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = handle_client_text(&text) else {
                        continue;
                    };
                    let Some(reply_text) = reply.to_text() else {
                        continue;
                    };
                    if sink.send(Message::Text(reply_text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "websocket receive error");
                    break;
                }
            },
        }
    }

    debug!("websocket client disconnected");
}

fn handle_client_text(text: &str) -> Option<Envelope> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(err) => {
            return Some(Envelope::new(
                "error",
                json!({ "message": format!("malformed request: {err}") }),
            ));
        }
    };
    match request.kind.as_str() {
        "ping" => Some(Envelope::reply("pong", json!({}), request.request_id)),
        other => Some(Envelope::reply(
            "error",
            json!({ "message": format!("unknown request type '{other}'") }),
            request.request_id,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_missing_request_id() {
        let text = Envelope::new("system_update", json!({"cpu_usage": 1.5}))
            .to_text()
            .expect("serializable");
        assert!(text.contains("\"type\":\"system_update\""));
        assert!(text.contains("\"timestamp\""));
        assert!(!text.contains("request_id"));
    }

    #[test]
    fn ping_gets_pong_with_request_id() {
        let reply = handle_client_text(r#"{"type":"ping","request_id":"abc"}"#)
            .expect("reply expected");
        assert_eq!(reply.kind, "pong");
        assert_eq!(reply.request_id.as_deref(), Some("abc"));
    }

    #[test]
    fn unknown_type_and_garbage_get_error_frames() {
        let reply = handle_client_text(r#"{"type":"subscribe"}"#).expect("reply expected");
        assert_eq!(reply.kind, "error");
        assert!(reply.request_id.is_none());

        let reply = handle_client_text("not json").expect("reply expected");
        assert_eq!(reply.kind, "error");
    }

    #[tokio::test]
    async fn hub_broadcast_reaches_subscriber() {
        let hub = WsHub::new(8);
        let mut rx = hub.subscribe();
        hub.broadcast_system_update(12.5, 40.0, 55.0, 3600);
        let text = rx.recv().await.expect("frame");
        assert!(text.contains("\"cpu_usage\":12.5"));
        assert!(text.contains("1h"));
    }
}
