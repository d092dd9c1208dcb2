//! The WhatsApp Web bridge process.
//!
//! stdout carries one JSON event per line; stdin takes one JSON command per
//! line. Non-JSON stdout lines (library console noise) are skipped.

use std::{collections::VecDeque, path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};

use botengine_core::{
    config::WorkerCommand,
    domain::SessionId,
    errors::Error,
    ports::{QrAuthPort, QrEvent, ReplyPort},
    relay::InboundMessage,
    Result,
};

const STDERR_TAIL_MAX_LINES: usize = 50;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        data: String,
    },
    Authenticated,
    Ready {
        #[serde(default)]
        name: Option<String>,
    },
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Message(BridgeMessage),
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BridgeMessage {
    pub id: String,
    pub chat_id: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub chat_name: Option<String>,
    /// Sender id (`<number>@c.us`).
    pub from: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub body: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub mentioned: bool,
    #[serde(default)]
    pub media: Option<BridgeMedia>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BridgeMedia {
    #[serde(default)]
    pub mimetype: Option<String>,
    /// Base64 payload.
    pub data: String,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Reply {
        chat_id: &'a str,
        text: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        quoted_id: Option<&'a str>,
    },
}

pub fn parse_event(line: &str) -> Option<BridgeEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            tracing::warn!("unparseable bridge event: {e}");
            None
        }
    }
}

#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > STDERR_TAIL_MAX_LINES {
            self.lines.pop_front();
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

pub struct Bridge {
    child: Child,
    events: Lines<BufReader<ChildStdout>>,
    stdin: Arc<Mutex<ChildStdin>>,
    stderr_tail: Arc<Mutex<StderrTail>>,
}

impl Bridge {
    /// Launch the bridge for one session. Its browser profile lives under
    /// `data_dir`.
    pub fn spawn(cmd: &WorkerCommand, session: &SessionId, data_dir: &Path) -> Result<Self> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .arg("--session")
            .arg(session.as_str())
            .arg("--data-path")
            .arg(data_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::External(format!(
                "failed to launch whatsapp bridge {}: {e}",
                cmd.program.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("bridge stdin was not captured".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::debug!(target: "whatsapp_bridge", "{line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        tracing::info!(pid = child.id(), "whatsapp bridge started");
        Ok(Self {
            child,
            events: BufReader::new(stdout).lines(),
            stdin: Arc::new(Mutex::new(stdin)),
            stderr_tail,
        })
    }

    /// Next event; `None` once the bridge closed its stdout.
    pub async fn next(&mut self) -> Result<Option<BridgeEvent>> {
        while let Some(line) = self.events.next_line().await? {
            if let Some(ev) = parse_event(&line) {
                return Ok(Some(ev));
            }
        }

        let stderr = self.stderr_tail.lock().await.snapshot();
        if stderr.trim().is_empty() {
            tracing::error!("whatsapp bridge closed its output");
        } else {
            tracing::error!("whatsapp bridge closed its output; stderr (tail):\n{stderr}");
        }
        Ok(None)
    }

    pub fn replies(&self) -> BridgeReplies {
        BridgeReplies {
            stdin: self.stdin.clone(),
        }
    }

    pub async fn shutdown(mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            tracing::warn!("failed to stop whatsapp bridge: {e}");
        }
    }
}

#[async_trait]
impl QrAuthPort for Bridge {
    async fn next_event(&mut self) -> Result<Option<QrEvent>> {
        loop {
            let Some(ev) = self.next().await? else {
                return Ok(None);
            };
            let mapped = match ev {
                BridgeEvent::Qr { data } => QrEvent::Challenge(data),
                BridgeEvent::Authenticated => QrEvent::Authenticated,
                BridgeEvent::Ready { name } => QrEvent::Ready { name },
                BridgeEvent::AuthFailure { message } => QrEvent::Failure(message),
                BridgeEvent::Message(_) | BridgeEvent::Other => continue,
            };
            return Ok(Some(mapped));
        }
    }
}

/// Write side of the bridge; shared with the relay.
#[derive(Clone)]
pub struct BridgeReplies {
    stdin: Arc<Mutex<ChildStdin>>,
}

#[async_trait]
impl ReplyPort for BridgeReplies {
    async fn reply(&self, to: &InboundMessage, text: &str) -> Result<()> {
        let cmd = BridgeCommand::Reply {
            chat_id: &to.chat_id,
            text,
            quoted_id: Some(to.message_id.as_str()),
        };
        let mut line = serde_json::to_vec(&cmd)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }
}
