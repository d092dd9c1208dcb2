//! Discord gateway session: hello, identify, heartbeats, dispatch events.

use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpStream, time::Interval};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use botengine_core::{errors::Error, Result};

use crate::ingest::DiscordMessage;

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
pub const INTENTS: u64 = 1 | (1 << 9) | (1 << 12) | (1 << 15);

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;

const DEFAULT_HEARTBEAT_MS: u64 = 41_250;

/// One gateway payload.
#[derive(Debug, Deserialize)]
pub struct Frame {
    pub op: u64,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default)]
    pub s: Option<i64>,
    #[serde(default)]
    pub t: Option<String>,
}

pub fn parse_frame(text: &str) -> Option<Frame> {
    serde_json::from_str(text).ok()
}

pub fn identify_payload(token: &str) -> serde_json::Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "botengine",
                "device": "botengine",
            },
        },
    })
}

pub fn heartbeat_payload(sequence: Option<i64>) -> serde_json::Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

/// What the gateway handed us.
#[derive(Debug)]
pub enum GatewayEvent {
    Message(Box<DiscordMessage>),
    /// Discord asked us to reconnect, invalidated the session or closed the
    /// socket.
    Closed(String),
}

/// What a frame means for the session loop.
#[derive(Debug, PartialEq)]
pub enum Action {
    Ignore,
    HeartbeatNow,
    Reconnect(String),
    MessageCreate(serde_json::Value),
}

pub fn classify(frame: Frame) -> Action {
    match frame.op {
        OP_HEARTBEAT => Action::HeartbeatNow,
        OP_RECONNECT => Action::Reconnect("gateway requested a reconnect".to_string()),
        OP_INVALID_SESSION => Action::Reconnect("gateway invalidated the session".to_string()),
        OP_DISPATCH if frame.t.as_deref() == Some("MESSAGE_CREATE") => {
            Action::MessageCreate(frame.d)
        }
        _ => Action::Ignore,
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Gateway {
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
    heartbeat: Interval,
    sequence: Option<i64>,
}

impl Gateway {
    /// Connect, wait for hello and identify.
    pub async fn connect(url: &str, token: &str) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::External(format!("discord gateway connect failed: {e}")))?;
        let (mut write, mut read) = socket.split();

        let hello = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = parse_frame(&text).filter(|f| f.op == OP_HELLO) {
                        break frame;
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(Error::External(format!("discord gateway error: {e}")));
                }
                None => {
                    return Err(Error::External(
                        "discord gateway closed before hello".to_string(),
                    ));
                }
            }
        };
        let interval_ms = hello
            .d
            .get("heartbeat_interval")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_HEARTBEAT_MS);

        write
            .send(Message::text(identify_payload(token).to_string()))
            .await
            .map_err(|e| Error::External(format!("discord identify failed: {e}")))?;
        tracing::info!(heartbeat_ms = interval_ms, "discord gateway identified");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(interval_ms));
        // The first tick fires immediately; identify just went out.
        heartbeat.tick().await;

        Ok(Self {
            write,
            read,
            heartbeat,
            sequence: None,
        })
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        self.write
            .send(Message::text(heartbeat_payload(self.sequence).to_string()))
            .await
            .map_err(|e| Error::External(format!("discord heartbeat failed: {e}")))
    }

    /// Next message, keeping the session alive meanwhile.
    pub async fn next_event(&mut self) -> Result<GatewayEvent> {
        loop {
            tokio::select! {
                _ = self.heartbeat.tick() => self.send_heartbeat().await?,
                msg = self.read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(reason))) => {
                            return Ok(GatewayEvent::Closed(format!("gateway closed: {reason:?}")));
                        }
                        None => return Ok(GatewayEvent::Closed("gateway stream ended".to_string())),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(Error::External(format!("discord gateway error: {e}")));
                        }
                    };
                    let Some(frame) = parse_frame(&text) else {
                        continue;
                    };
                    if frame.s.is_some() {
                        self.sequence = frame.s;
                    }

                    match classify(frame) {
                        Action::Ignore => {}
                        Action::HeartbeatNow => self.send_heartbeat().await?,
                        Action::Reconnect(reason) => return Ok(GatewayEvent::Closed(reason)),
                        Action::MessageCreate(d) => match serde_json::from_value::<DiscordMessage>(d) {
                            Ok(m) => return Ok(GatewayEvent::Message(Box::new(m))),
                            Err(e) => tracing::warn!("unreadable MESSAGE_CREATE payload: {e}"),
                        },
                    }
                }
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!("discord gateway close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_cover_guild_and_direct_messages_with_content() {
        assert_eq!(INTENTS, 37377);
        assert_eq!(identify_payload("tok")["d"]["intents"], 37377);
        assert_eq!(identify_payload("tok")["d"]["token"], "tok");
    }

    #[test]
    fn heartbeat_carries_the_last_sequence() {
        assert_eq!(heartbeat_payload(None), json!({"op": 1, "d": null}));
        assert_eq!(heartbeat_payload(Some(12)), json!({"op": 1, "d": 12}));
    }

    #[test]
    fn frames_map_to_actions() {
        let frame = |s: &str| parse_frame(s).unwrap();

        assert_eq!(classify(frame(r#"{"op":1,"d":null}"#)), Action::HeartbeatNow);
        assert!(matches!(classify(frame(r#"{"op":7,"d":null}"#)), Action::Reconnect(_)));
        assert!(matches!(classify(frame(r#"{"op":9,"d":false}"#)), Action::Reconnect(_)));
        assert_eq!(
            classify(frame(r#"{"op":0,"s":3,"t":"MESSAGE_CREATE","d":{"id":"1"}}"#)),
            Action::MessageCreate(json!({"id": "1"}))
        );
        assert_eq!(
            classify(frame(r#"{"op":0,"s":1,"t":"READY","d":{}}"#)),
            Action::Ignore
        );
        assert_eq!(classify(frame(r#"{"op":11}"#)), Action::Ignore);
        assert!(parse_frame("not json").is_none());
    }
}
