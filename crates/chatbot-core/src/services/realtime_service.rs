use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::auth_service::IdentityProvider;
use super::supabase::SupabaseConfig;
use crate::repositories::BoxFuture;
use crate::repositories::change_feed::{
    ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, ChatRecord, FeedError, TableRef,
};

const JOIN_REF: &str = "1";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

#[derive(Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<Value>,
}

impl PhoenixFrame {
    fn reference(&self) -> Option<String> {
        match &self.reference {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ChangePayload {
    data: ChangeData,
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

/// What an incoming websocket frame means for the subscription.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    Change(ChangeEvent),
    Reply {
        reference: Option<String>,
        ok: bool,
        message: String,
    },
    Closed(String),
    Ignored,
}

fn record(value: Value) -> Result<Option<ChatRecord>, FeedError> {
    match &value {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        _ => Ok(Some(serde_json::from_value(value)?)),
    }
}

/// Decode one text frame received on `topic`.
pub fn decode_frame(text: &str, topic: &str) -> Result<Incoming, FeedError> {
    let frame: PhoenixFrame = serde_json::from_str(text)?;

    if frame.topic != topic {
        // Heartbeat replies arrive on the "phoenix" topic.
        return Ok(match frame.event.as_str() {
            "phx_reply" if frame.payload["status"] != "ok" => Incoming::Reply {
                reference: frame.reference(),
                ok: false,
                message: frame.payload["response"].to_string(),
            },
            _ => Incoming::Ignored,
        });
    }

    match frame.event.as_str() {
        "postgres_changes" => {
            let payload: ChangePayload = serde_json::from_value(frame.payload)?;
            let kind = match payload.data.kind.as_str() {
                "INSERT" => ChangeKind::Insert,
                "UPDATE" => ChangeKind::Update,
                "DELETE" => ChangeKind::Delete,
                other => {
                    return Err(FeedError::Protocol {
                        message: format!("unknown change type {other}"),
                    });
                }
            };
            Ok(Incoming::Change(ChangeEvent {
                kind,
                old_record: record(payload.data.old_record)?,
                new_record: record(payload.data.record)?,
            }))
        }
        "phx_reply" => {
            let ok = frame.payload["status"] == "ok";
            Ok(Incoming::Reply {
                reference: frame.reference(),
                ok,
                message: frame.payload["response"].to_string(),
            })
        }
        "phx_error" => Ok(Incoming::Closed("channel error".into())),
        "phx_close" => Ok(Incoming::Closed("channel closed by server".into())),
        "system" if frame.payload["status"] == "error" => Ok(Incoming::Closed(
            frame.payload["message"]
                .as_str()
                .unwrap_or("system error")
                .to_string(),
        )),
        _ => Ok(Incoming::Ignored),
    }
}

pub fn join_frame(topic: &str, table: &TableRef, access_token: &str) -> Value {
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": [
                    {"event": "*", "schema": table.schema, "table": table.table}
                ]
            },
            "access_token": access_token
        },
        "ref": JOIN_REF
    })
}

pub fn heartbeat_frame(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string()
    })
}

enum Step {
    Heartbeat,
    Frame(Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>),
}

/// Supabase Realtime `postgres_changes` subscription over a websocket.
#[derive(Clone)]
pub struct SupabaseRealtimeFeed {
    config: SupabaseConfig,
    identity: Arc<dyn IdentityProvider>,
    heartbeat: Duration,
}

impl SupabaseRealtimeFeed {
    pub fn new(config: SupabaseConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            config,
            identity,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl ChangeFeed for SupabaseRealtimeFeed {
    fn subscribe(&self, table: TableRef) -> BoxFuture<'static, Result<ChangeStream, FeedError>> {
        let this = self.clone();

        Box::pin(async move {
            let token = this
                .identity
                .access_token()
                .await
                .map_err(|e| FeedError::Connect {
                    message: e.to_string(),
                })?
                .unwrap_or_else(|| this.config.anon_key.clone());

            let (socket, _) = tokio_tungstenite::connect_async(this.config.realtime_url())
                .await
                .map_err(|e| FeedError::Connect {
                    message: e.to_string(),
                })?;
            let (mut sink, mut source) = socket.split();

            let topic = format!("realtime:{}:{}", table.schema, table.table);
            sink.send(WsMessage::Text(
                join_frame(&topic, &table, &token).to_string(),
            ))
            .await?;

            // Wait for the join to be acknowledged before handing out the stream.
            let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
                while let Some(message) = source.next().await {
                    let WsMessage::Text(text) = message? else {
                        continue;
                    };
                    match decode_frame(&text, &topic)? {
                        Incoming::Reply {
                            reference,
                            ok,
                            message,
                        } if reference.as_deref() == Some(JOIN_REF) => {
                            return if ok {
                                Ok(())
                            } else {
                                Err(FeedError::Protocol {
                                    message: format!("join rejected: {message}"),
                                })
                            };
                        }
                        Incoming::Closed(reason) => return Err(FeedError::Closed { reason }),
                        _ => {}
                    }
                }
                Err::<(), FeedError>(FeedError::Closed {
                    reason: "socket closed before join".into(),
                })
            })
            .await
            .map_err(|_| FeedError::Connect {
                message: "timed out joining channel".into(),
            })?;
            joined?;

            info!(%topic, "Subscribed to realtime changes");

            let heartbeat = this.heartbeat;
            let stream: ChangeStream = Box::pin(async_stream::stream! {
                let mut ticker = tokio::time::interval(heartbeat);
                ticker.tick().await;
                let mut next_ref: u64 = 1;

                loop {
                    let step = tokio::select! {
                        _ = ticker.tick() => Step::Heartbeat,
                        frame = source.next() => Step::Frame(frame),
                    };

                    match step {
                        Step::Heartbeat => {
                            next_ref += 1;
                            let frame = heartbeat_frame(next_ref).to_string();
                            if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                                yield Err(FeedError::from(e));
                                break;
                            }
                        }
                        Step::Frame(None) => {
                            yield Err(FeedError::Closed { reason: "socket closed".into() });
                            break;
                        }
                        Step::Frame(Some(Err(e))) => {
                            yield Err(FeedError::from(e));
                            break;
                        }
                        Step::Frame(Some(Ok(WsMessage::Text(text)))) => {
                            match decode_frame(&text, &topic) {
                                Ok(Incoming::Change(event)) => {
                                    debug!(
                                        kind = ?event.kind,
                                        chat_id = ?event.chat_id(),
                                        "Realtime change"
                                    );
                                    yield Ok(event);
                                }
                                Ok(Incoming::Closed(reason)) => {
                                    yield Err(FeedError::Closed { reason });
                                    break;
                                }
                                Ok(Incoming::Reply { ok: false, message, .. }) => {
                                    warn!(%message, "Realtime request rejected");
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    yield Err(e);
                                    break;
                                }
                            }
                        }
                        Step::Frame(Some(Ok(WsMessage::Close(frame)))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "socket closed".into());
                            yield Err(FeedError::Closed { reason });
                            break;
                        }
                        Step::Frame(Some(Ok(_))) => {}
                    }
                }
            });

            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "realtime:public:chat";

    fn change(kind: &str, record: Value, old_record: Value) -> String {
        json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "chat",
                    "commit_timestamp": "2025-03-01T12:00:00Z",
                    "type": kind,
                    "record": record,
                    "old_record": old_record,
                    "columns": [],
                    "errors": null
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_decode_update() {
        let text = change(
            "UPDATE",
            json!({
                "cid": "c1",
                "user_id": "u1",
                "archived": true,
                "created_at": "2025-03-01T11:00:00Z"
            }),
            json!({"cid": "c1"}),
        );
        let Incoming::Change(event) = decode_frame(&text, TOPIC).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.new_record.as_ref().unwrap().archived, Some(true));
        assert_eq!(event.chat_id(), Some("c1"));
    }

    #[test]
    fn test_decode_delete_with_empty_record() {
        let text = change("DELETE", json!({}), json!({"cid": "c7"}));
        let Incoming::Change(event) = decode_frame(&text, TOPIC).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.new_record.is_none());
        assert_eq!(event.chat_id(), Some("c7"));
    }

    #[test]
    fn test_decode_insert() {
        let text = change(
            "INSERT",
            json!({"cid": "c2", "user_id": "u1", "archived": false}),
            Value::Null,
        );
        let Incoming::Change(event) = decode_frame(&text, TOPIC).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(event.kind, ChangeKind::Insert);
        assert!(event.old_record.is_none());
    }

    #[test]
    fn test_decode_join_reply_and_errors() {
        let ok = json!({"topic": TOPIC, "event": "phx_reply", "ref": "1",
            "payload": {"status": "ok", "response": {"postgres_changes": []}}})
        .to_string();
        assert!(matches!(
            decode_frame(&ok, TOPIC).unwrap(),
            Incoming::Reply { ok: true, reference: Some(ref r), .. } if r == "1"
        ));

        let error =
            json!({"topic": TOPIC, "event": "phx_error", "ref": null, "payload": {}}).to_string();
        assert!(matches!(decode_frame(&error, TOPIC).unwrap(), Incoming::Closed(_)));

        let system = json!({"topic": TOPIC, "event": "system", "payload":
            {"status": "error", "message": "permission denied", "extension": "postgres_changes"}})
        .to_string();
        assert_eq!(
            decode_frame(&system, TOPIC).unwrap(),
            Incoming::Closed("permission denied".into())
        );
    }

    #[test]
    fn test_unknown_change_type_is_protocol_error() {
        let text = change("TRUNCATE", Value::Null, Value::Null);
        assert!(matches!(decode_frame(&text, TOPIC), Err(FeedError::Protocol { .. })));
        assert!(matches!(decode_frame("not json", TOPIC), Err(FeedError::Decode(_))));
    }

    #[test]
    fn test_heartbeat_replies_are_ignored() {
        let reply = json!({"topic": "phoenix", "event": "phx_reply", "ref": "5",
            "payload": {"status": "ok", "response": {}}})
        .to_string();
        assert_eq!(decode_frame(&reply, TOPIC).unwrap(), Incoming::Ignored);
    }

    #[test]
    fn test_join_frame_shape() {
        let frame = join_frame(TOPIC, &TableRef::chats(), "jwt");
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["payload"]["access_token"], "jwt");
        assert_eq!(frame["payload"]["config"]["postgres_changes"][0]["table"], "chat");
    }
}
