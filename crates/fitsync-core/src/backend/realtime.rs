//! Websocket change feed speaking the Phoenix channel protocol used by
//! hosted Postgres realtime services.
//!
//! Each [`RealtimeTransport::connect`] opens one socket, joins one
//! `postgres_changes` topic filtered server-side, and keeps it alive with
//! heartbeats. The returned stream ends when the socket closes or the
//! server reports a channel error.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use super::rest::RestConfig;
use crate::channel::{ChangeEvent, ChangeKind, ChangeStream, ChannelFilter, RealtimeTransport};
use crate::error::{Result, SyncError};

const SCHEMA: &str = "public";

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    #[serde(rename = "type", alias = "eventType")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// What a single incoming frame means for the subscription.
#[derive(Debug, PartialEq)]
enum FrameAction {
    Deliver(ChangeEvent),
    Ignore,
    Close(String),
}

fn topic_for(table: &str, filter: &ChannelFilter) -> String {
    format!("realtime:{}:{}:{}", SCHEMA, table, filter.to_expression())
}

fn join_frame(topic: &str, table: &str, filter: &ChannelFilter, token: &str) -> Value {
    json!({
        "topic": topic,
        "event": "phx_join",
        "ref": "1",
        "payload": {
            "config": {
                "postgres_changes": [{
                    "event": "*",
                    "schema": SCHEMA,
                    "table": table,
                    "filter": filter.to_expression(),
                }]
            },
            "access_token": token,
        }
    })
}

fn heartbeat_frame(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "ref": reference.to_string(),
        "payload": {},
    })
}

fn interpret(text: &str, topic: &str) -> Result<FrameAction> {
    let frame: Frame = serde_json::from_str(text).map_err(|e| SyncError::decode("realtime frame", e))?;
    if frame.topic != topic {
        return Ok(FrameAction::Ignore);
    }

    match frame.event.as_str() {
        "postgres_changes" => {
            let data = frame.payload.get("data").cloned().unwrap_or(Value::Null);
            let change: ChangePayload =
                serde_json::from_value(data).map_err(|e| SyncError::decode("realtime change", e))?;
            Ok(FrameAction::Deliver(ChangeEvent {
                table: change.table,
                kind: change.kind,
                record: change.record.unwrap_or_else(|| json!({})),
                old_record: change.old_record,
            }))
        }
        "phx_reply" => {
            let status = frame.payload.get("status").and_then(Value::as_str).unwrap_or("ok");
            if status == "ok" {
                Ok(FrameAction::Ignore)
            } else {
                Ok(FrameAction::Close(format!("join rejected: {}", frame.payload)))
            }
        }
        "phx_error" => Ok(FrameAction::Close("channel error".to_string())),
        "phx_close" => Ok(FrameAction::Close("channel closed".to_string())),
        _ => Ok(FrameAction::Ignore),
    }
}

/// Realtime transport over the store's websocket endpoint.
#[derive(Debug, Clone)]
pub struct RealtimeSocket {
    config: RestConfig,
    heartbeat: Duration,
}

impl RealtimeSocket {
    pub fn new(config: RestConfig, heartbeat: Duration) -> Self {
        Self { config, heartbeat }
    }

    pub fn socket_url(&self) -> String {
        let base = self.config.base_url();
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, self.config.anon_key)
    }
}

#[async_trait]
impl RealtimeTransport for RealtimeSocket {
    async fn connect(&self, table: &str, filter: &ChannelFilter) -> Result<ChangeStream> {
        let (socket, _) = tokio_tungstenite::connect_async(self.socket_url())
            .await
            .map_err(|e| SyncError::subscription(table, e))?;
        let (mut sink, mut source) = socket.split();

        let topic = topic_for(table, filter);
        let token = self
            .config
            .access_token
            .clone()
            .unwrap_or_else(|| self.config.anon_key.clone());
        sink.send(WsMessage::Text(join_frame(&topic, table, filter, &token).to_string()))
            .await
            .map_err(|e| SyncError::subscription(table, e))?;
        debug!(topic = %topic, "realtime channel joined");

        let (tx, mut rx) = mpsc::unbounded_channel::<Result<ChangeEvent>>();
        let heartbeat = self.heartbeat;
        let table_name = table.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            let mut reference: u64 = 1;

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    _ = ticker.tick() => {
                        reference += 1;
                        let frame = heartbeat_frame(reference).to_string();
                        if sink.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    incoming = source.next() => {
                        let text = match incoming {
                            Some(Ok(WsMessage::Text(text))) => text,
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = tx.send(Err(SyncError::subscription(&table_name, e)));
                                break;
                            }
                        };
                        match interpret(&text, &topic) {
                            Ok(FrameAction::Deliver(event)) => {
                                if tx.send(Ok(event)).is_err() {
                                    break;
                                }
                            }
                            Ok(FrameAction::Ignore) => {}
                            Ok(FrameAction::Close(reason)) => {
                                let _ = tx.send(Err(SyncError::subscription(&table_name, reason)));
                                break;
                            }
                            Err(e) => warn!(topic = %topic, error = %e, "skipping undecodable frame"),
                        }
                    }
                }
            }
            debug!(topic = %topic, "realtime socket closed");
        });

        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> ChannelFilter {
        ChannelFilter::new("recipient_id", "client-1").unwrap()
    }

    #[test]
    fn test_socket_url_from_https() {
        let socket = RealtimeSocket::new(
            RestConfig {
                url: "https://abc.supabase.co/".into(),
                anon_key: "anon".into(),
                access_token: None,
            },
            Duration::from_secs(25),
        );
        assert_eq!(
            socket.socket_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_join_frame_carries_filter() {
        let topic = topic_for("messages", &filter());
        let frame = join_frame(&topic, "messages", &filter(), "jwt");
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(
            frame["payload"]["config"]["postgres_changes"][0]["filter"],
            "recipient_id=eq.client-1"
        );
        assert_eq!(frame["payload"]["access_token"], "jwt");
    }

    #[test]
    fn test_interpret_insert() {
        let topic = topic_for("messages", &filter());
        let text = json!({
            "topic": topic,
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "record": {"id": "m-1", "recipient_id": "client-1"}
                }
            }
        })
        .to_string();

        match interpret(&text, &topic).unwrap() {
            FrameAction::Deliver(event) => {
                assert_eq!(event.kind, ChangeKind::Insert);
                assert_eq!(event.record["id"], "m-1");
                assert!(event.old_record.is_none());
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_interpret_other_topic_is_ignored() {
        let text = json!({"topic": "phoenix", "event": "phx_reply", "payload": {"status": "ok"}}).to_string();
        assert_eq!(interpret(&text, "realtime:x").unwrap(), FrameAction::Ignore);
    }

    #[test]
    fn test_interpret_rejected_join_closes() {
        let topic = topic_for("messages", &filter());
        let text = json!({
            "topic": topic,
            "event": "phx_reply",
            "payload": {"status": "error", "response": {"reason": "unauthorized"}}
        })
        .to_string();
        assert!(matches!(interpret(&text, &topic).unwrap(), FrameAction::Close(_)));
    }
}
