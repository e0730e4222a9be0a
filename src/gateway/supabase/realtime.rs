//! Realtime insert feed over the Phoenix channel websocket.
//!
//! One websocket per subscription: join `realtime:chat:{id}` with a
//! `postgres_changes` filter on the messages table, heartbeat on the `phoenix`
//! topic, and forward each INSERT record until the subscription closes or the
//! channel fails.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::gateway::{ConversationId, GatewayError, Session, Subscription, SubscriptionEvent};
use crate::palaver::GatewayConfig;
use crate::palaver::messages::Message;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const FEED_BUFFER_SIZE: usize = 100;
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_REF: &str = "1";
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A Phoenix channel frame in the v1 JSON serializer's object form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    fn new(topic: &str, event: &str, payload: Value, reference: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference,
        }
    }

    fn to_text(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What an inbound frame means for the subscription.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Insert(Message),
    Joined,
    Failed(String),
    Ignore,
}

pub(crate) fn channel_topic(conversation_id: &ConversationId) -> String {
    format!("realtime:chat:{}", conversation_id)
}

/// `{url}/realtime/v1/websocket` with the scheme switched to ws(s).
pub(crate) fn websocket_url(config: &GatewayConfig) -> String {
    let base = if let Some(rest) = config.url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = config.url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        config.url.clone()
    };
    format!(
        "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        base, config.anon_key
    )
}

pub(crate) fn join_frame(conversation_id: &ConversationId, access_token: &str) -> PhoenixFrame {
    PhoenixFrame::new(
        &channel_topic(conversation_id),
        "phx_join",
        json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "filter": format!("chat_id=eq.{}", conversation_id),
                }],
            },
            "access_token": access_token,
        }),
        Some(JOIN_REF.to_string()),
    )
}

pub(crate) fn heartbeat_frame(reference: u64) -> PhoenixFrame {
    PhoenixFrame::new("phoenix", "heartbeat", json!({}), Some(reference.to_string()))
}

pub(crate) fn leave_frame(conversation_id: &ConversationId, reference: u64) -> PhoenixFrame {
    PhoenixFrame::new(
        &channel_topic(conversation_id),
        "phx_leave",
        json!({}),
        Some(reference.to_string()),
    )
}

fn reason_from(payload: &Value, fallback: &str) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .or_else(|| payload.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

pub(crate) fn classify(frame: &PhoenixFrame, topic: &str) -> Inbound {
    if frame.topic != topic {
        return Inbound::Ignore;
    }

    match frame.event.as_str() {
        "postgres_changes" => {
            let Some(data) = frame.payload.get("data") else {
                return Inbound::Ignore;
            };
            if data.get("type").and_then(Value::as_str) != Some("INSERT") {
                return Inbound::Ignore;
            }
            let Some(record) = data.get("record") else {
                return Inbound::Ignore;
            };
            match serde_json::from_value::<Message>(record.clone()) {
                Ok(message) => Inbound::Insert(message),
                Err(e) => {
                    tracing::warn!(
                        target: "palaver::gateway::supabase::realtime::classify",
                        "Skipping undecodable insert on {}: {}",
                        topic,
                        e
                    );
                    Inbound::Ignore
                }
            }
        }
        "phx_reply" => match frame.payload.get("status").and_then(Value::as_str) {
            Some("ok") if frame.reference.as_deref() == Some(JOIN_REF) => Inbound::Joined,
            Some("error") => Inbound::Failed(reason_from(&frame.payload, "join rejected")),
            _ => Inbound::Ignore,
        },
        "system" => match frame.payload.get("status").and_then(Value::as_str) {
            Some("error") => Inbound::Failed(reason_from(&frame.payload, "subscription error")),
            _ => Inbound::Ignore,
        },
        "phx_error" => Inbound::Failed("channel errored".to_string()),
        "phx_close" => Inbound::Failed("channel closed by server".to_string()),
        _ => Inbound::Ignore,
    }
}

fn decode_frame(text: &str) -> Option<PhoenixFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::debug!(
                target: "palaver::gateway::supabase::realtime::decode_frame",
                "Ignoring unparsable frame: {}",
                e
            );
            None
        }
    }
}

/// Opens the websocket and waits for the channel join to be acknowledged, so that
/// every insert committed after this returns is delivered.
pub(crate) async fn subscribe_inserts(
    config: &GatewayConfig,
    session: &Session,
    conversation_id: &ConversationId,
) -> Result<Subscription, GatewayError> {
    let url = websocket_url(config);
    let topic = channel_topic(conversation_id);

    let (mut socket, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| GatewayError::Realtime(format!("Failed to connect: {}", e)))?;

    let join = join_frame(conversation_id, &session.access_token).to_text()?;
    socket
        .send(WsMessage::Text(join))
        .await
        .map_err(|e| GatewayError::Realtime(format!("Failed to join {}: {}", topic, e)))?;

    let early = timeout(JOIN_TIMEOUT, await_join(&mut socket, &topic))
        .await
        .map_err(|_| GatewayError::Realtime(format!("Timed out joining {}", topic)))??;

    tracing::debug!(
        target: "palaver::gateway::supabase::realtime::subscribe_inserts",
        "Joined {}",
        topic
    );

    let (event_tx, event_rx) = mpsc::channel(FEED_BUFFER_SIZE);
    let (close_tx, close_rx) = oneshot::channel();

    for message in early {
        // Fresh channel with room to spare; cannot be full or closed yet
        let _ = event_tx.try_send(SubscriptionEvent::Insert(message));
    }

    tokio::spawn(pump(
        socket,
        conversation_id.clone(),
        config.heartbeat_interval,
        event_tx,
        close_rx,
    ));

    Ok(Subscription::new(conversation_id.clone(), event_rx, close_tx))
}

/// Reads until the join reply. Inserts that overtake the reply are kept.
async fn await_join(socket: &mut Socket, topic: &str) -> Result<Vec<Message>, GatewayError> {
    let mut early = Vec::new();
    loop {
        let frame = match socket.next().await {
            Some(Ok(WsMessage::Text(text))) => decode_frame(&text),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(GatewayError::Realtime(
                    "Socket closed before join".to_string(),
                ));
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => return Err(GatewayError::Realtime(e.to_string())),
        };

        let Some(frame) = frame else {
            continue;
        };
        match classify(&frame, topic) {
            Inbound::Joined => return Ok(early),
            Inbound::Insert(message) => early.push(message),
            Inbound::Failed(reason) => return Err(GatewayError::Realtime(reason)),
            Inbound::Ignore => {}
        }
    }
}

async fn pump(
    socket: Socket,
    conversation_id: ConversationId,
    heartbeat_interval: Duration,
    events: mpsc::Sender<SubscriptionEvent>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let topic = channel_topic(&conversation_id);
    let (mut sink, mut stream) = socket.split();
    let period = heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut next_ref: u64 = 2;

    let failure = loop {
        tokio::select! {
            // Fires on close and when the subscription is dropped
            _ = &mut close_rx => {
                let leave = leave_frame(&conversation_id, next_ref);
                if let Ok(text) = leave.to_text() {
                    let _ = sink.send(WsMessage::Text(text)).await;
                }
                let _ = sink.close().await;
                tracing::debug!(
                    target: "palaver::gateway::supabase::realtime::pump",
                    "Left {}",
                    topic
                );
                return;
            }
            _ = heartbeat.tick() => {
                let beat = heartbeat_frame(next_ref);
                next_ref += 1;
                let sent = match beat.to_text() {
                    Ok(text) => sink.send(WsMessage::Text(text)).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    break format!("Heartbeat failed: {}", e);
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break "Socket closed".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("Socket error: {}", e),
                };
                let Some(frame) = decode_frame(&text) else {
                    continue;
                };
                match classify(&frame, &topic) {
                    Inbound::Insert(message) => {
                        // Receiver gone means the close signal is on its way
                        let _ = events.send(SubscriptionEvent::Insert(message)).await;
                    }
                    Inbound::Failed(reason) => break reason,
                    Inbound::Joined | Inbound::Ignore => {}
                }
            }
        }
    };

    tracing::warn!(
        target: "palaver::gateway::supabase::realtime::pump",
        "Live feed {} failed: {}",
        topic,
        failure
    );
    let _ = events.send(SubscriptionEvent::Error(failure)).await;
}
