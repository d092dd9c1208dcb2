//! Steady-state message pipeline of an authenticated worker:
//! normalize -> phishing sample -> optional security alert -> agent reply.

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    agent::ConversationAgent,
    domain::{MediaKind, Source},
    ports::{PhishingPort, ReplyPort},
    utils::{remove_file_if_exists, truncate_text},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sender {
    pub user_id: String,
    pub name: String,
    pub username: Option<String>,
    pub is_bot: bool,
}

/// A downloaded attachment staged on local disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub filename: String,
    pub size: u64,
    pub mime_type: Option<String>,
    /// Local staging path; never sent to the API.
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// A platform message after ingestion.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub platform: Source,
    pub message_id: String,
    /// Platform chat identifier used to route replies.
    pub chat_id: String,
    pub chat_kind: ChatKind,
    pub chat_title: Option<String>,
    pub sender: Sender,
    /// Display name of the account the worker runs as.
    pub recipient: String,
    pub text: String,
    pub media: MediaKind,
    pub mime_type: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Whether the message mentions our account.
    pub mentioned: bool,
    pub timestamp: DateTime<Utc>,
}

/// Payload submitted to the phishing-detection API.
#[derive(Clone, Debug, Serialize)]
pub struct Sample {
    pub sample: SampleBody,
}

#[derive(Clone, Debug, Serialize)]
pub struct SampleBody {
    pub message_id: String,
    pub platform: Source,
    pub chat_type: ChatKind,
    pub from: String,
    pub to: String,
    pub sender_info: SenderInfo,
    pub message_content: MessageContent,
    pub timestamp: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SenderInfo {
    pub user_id: String,
    pub username: String,
    pub is_bot: u8,
}

#[derive(Clone, Debug, Serialize)]
pub struct MessageContent {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Sample {
    pub fn from_message(msg: &InboundMessage) -> Self {
        Self {
            sample: SampleBody {
                message_id: msg.message_id.clone(),
                platform: msg.platform,
                chat_type: msg.chat_kind,
                from: msg.sender.name.clone(),
                to: msg.recipient.clone(),
                sender_info: SenderInfo {
                    user_id: msg.sender.user_id.clone(),
                    username: msg
                        .sender
                        .username
                        .clone()
                        .unwrap_or_else(|| "N/A".to_string()),
                    is_bot: u8::from(msg.sender.is_bot),
                },
                message_content: MessageContent {
                    text: msg.text.clone(),
                    attachments: msg.attachments.clone(),
                },
                timestamp: msg.timestamp.to_rfc3339(),
            },
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.sample.message_content.attachments
    }
}

/// Raw phishing API response.
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict(pub serde_json::Value);

impl Verdict {
    /// Text to forward to the chat as a security alert, if the API produced one.
    pub fn technical_text(&self) -> Option<&str> {
        self.0
            .pointer("/bot_responses/technical_response/text")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_phishing(&self) -> bool {
        self.0
            .pointer("/analysis_results/is_phishing")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

pub fn security_alert(technical_text: &str) -> String {
    format!("Security Alert: {technical_text}")
}

/// Groups only get a reply when they mention us.
pub fn should_respond(msg: &InboundMessage) -> bool {
    msg.chat_kind == ChatKind::Private || msg.mentioned
}

/// What the agent is asked. Media-only messages get a short description of
/// what was sent instead of an empty prompt.
pub fn agent_input(msg: &InboundMessage, verdict: Option<&Verdict>) -> String {
    if !msg.text.trim().is_empty() {
        return msg.text.clone();
    }
    if verdict.is_some_and(|v| v.is_phishing()) {
        return format!(
            "[Suspicious content was detected in the {} that was sent]",
            msg.media.as_str()
        );
    }
    match msg.media {
        MediaKind::Image => "[The user sent an image]".to_string(),
        MediaKind::Audio => "[The user sent a voice message or audio file]".to_string(),
        MediaKind::Video => "[The user sent a video]".to_string(),
        MediaKind::Document => format!(
            "[The user sent a file of type: {}]",
            msg.mime_type.as_deref().unwrap_or("unknown")
        ),
        MediaKind::Text | MediaKind::Unknown => "[The user sent a media file]".to_string(),
    }
}

/// What the relay did with one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub alert: Option<String>,
    pub reply: Option<String>,
}

/// Collaborators a worker prepares before its handshake; the reply channel
/// only exists once the platform client is connected.
pub struct RelayParts {
    pub agent: ConversationAgent,
    pub phishing: Option<Arc<dyn PhishingPort>>,
}

impl RelayParts {
    pub fn into_relay(self, replies: Arc<dyn ReplyPort>) -> Relay {
        Relay::new(self.agent, self.phishing, replies)
    }
}

pub struct Relay {
    agent: ConversationAgent,
    phishing: Option<Arc<dyn PhishingPort>>,
    replies: Arc<dyn ReplyPort>,
}

impl Relay {
    pub fn new(
        agent: ConversationAgent,
        phishing: Option<Arc<dyn PhishingPort>>,
        replies: Arc<dyn ReplyPort>,
    ) -> Self {
        Self {
            agent,
            phishing,
            replies,
        }
    }

    /// Process one inbound message. Failures of the phishing API, the agent or
    /// a reply are logged; the relay keeps going.
    pub async fn handle(&self, msg: &InboundMessage) -> RelayOutcome {
        let mut outcome = RelayOutcome::default();
        if msg.sender.is_bot {
            self.cleanup(msg);
            return outcome;
        }

        tracing::info!(
            platform = %msg.platform,
            message_id = %msg.message_id,
            media = msg.media.as_str(),
            "inbound from {}: {}",
            msg.sender.name,
            truncate_text(&msg.text, 80)
        );

        let verdict = match &self.phishing {
            Some(api) => api.submit(&Sample::from_message(msg)).await,
            None => None,
        };
        self.cleanup(msg);

        if let Some(text) = verdict.as_ref().and_then(|v| v.technical_text()) {
            let alert = security_alert(text);
            match self.replies.reply(msg, &alert).await {
                Ok(()) => outcome.alert = Some(alert),
                Err(e) => tracing::warn!("failed to send security alert: {e}"),
            }
        }

        if !should_respond(msg) {
            tracing::debug!(message_id = %msg.message_id, "group message without mention; not replying");
            return outcome;
        }

        let input = agent_input(msg, verdict.as_ref());
        match self.agent.respond(&msg.sender.user_id, &input).await {
            Ok(reply) => match self.replies.reply(msg, &reply).await {
                Ok(()) => outcome.reply = Some(reply),
                Err(e) => tracing::warn!("failed to send reply: {e}"),
            },
            Err(e) => tracing::error!(sender = %msg.sender.user_id, "agent failed: {e}"),
        }
        outcome
    }

    fn cleanup(&self, msg: &InboundMessage) {
        for a in &msg.attachments {
            if let Err(e) = remove_file_if_exists(&a.file_path) {
                tracing::warn!(path = %a.file_path.display(), "failed to delete staged attachment: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ports::{AgentPort, ChatTurn},
        Error, Result,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn message(chat_kind: ChatKind, text: &str) -> InboundMessage {
        InboundMessage {
            platform: Source::Telegram,
            message_id: "42".to_string(),
            chat_id: "-100".to_string(),
            chat_kind,
            chat_title: None,
            sender: Sender {
                user_id: "7".to_string(),
                name: "Mallory".to_string(),
                username: None,
                is_bot: false,
            },
            recipient: "BotEngine".to_string(),
            text: text.to_string(),
            media: MediaKind::Text,
            mime_type: None,
            attachments: Vec::new(),
            mentioned: false,
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    struct EchoAgent;

    #[async_trait]
    impl AgentPort for EchoAgent {
        async fn invoke(&self, input: &str, _history: &[ChatTurn]) -> Result<String> {
            Ok(format!("echo: {input}"))
        }
    }

    struct FixedPhishing(Option<serde_json::Value>);

    #[async_trait]
    impl PhishingPort for FixedPhishing {
        async fn submit(&self, sample: &Sample) -> Option<Verdict> {
            // The sample must be serializable and must not leak local paths.
            let body = serde_json::to_string(sample).unwrap();
            assert!(!body.contains("file_path"));
            self.0.clone().map(Verdict)
        }
    }

    #[derive(Default)]
    struct RecordingReplies {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ReplyPort for RecordingReplies {
        async fn reply(&self, _to: &InboundMessage, text: &str) -> Result<()> {
            if self.fail {
                return Err(Error::External("chat unavailable".to_string()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn relay(verdict: Option<serde_json::Value>, replies: Arc<RecordingReplies>) -> Relay {
        Relay::new(
            ConversationAgent::new(Arc::new(EchoAgent)),
            Some(Arc::new(FixedPhishing(verdict))),
            replies,
        )
    }

    #[test]
    fn sample_has_the_api_shape() {
        let mut msg = message(ChatKind::Group, "click here");
        msg.sender.username = Some("mal".to_string());
        msg.attachments.push(Attachment {
            kind: MediaKind::Image,
            filename: "telegram_42.jpg".to_string(),
            size: 10,
            mime_type: Some("image/jpeg".to_string()),
            file_path: PathBuf::from("/tmp/telegram_42.jpg"),
        });

        let v = serde_json::to_value(Sample::from_message(&msg)).unwrap();
        assert_eq!(
            v,
            json!({
                "sample": {
                    "message_id": "42",
                    "platform": "telegram",
                    "chat_type": "group",
                    "from": "Mallory",
                    "to": "BotEngine",
                    "sender_info": {"user_id": "7", "username": "mal", "is_bot": 0},
                    "message_content": {
                        "text": "click here",
                        "attachments": [{
                            "type": "image",
                            "filename": "telegram_42.jpg",
                            "size": 10,
                            "mime_type": "image/jpeg"
                        }]
                    },
                    "timestamp": "2024-05-01T10:00:00+00:00"
                }
            })
        );
    }

    #[test]
    fn media_only_messages_get_a_description() {
        let mut msg = message(ChatKind::Private, "");
        msg.media = MediaKind::Audio;
        assert_eq!(agent_input(&msg, None), "[The user sent a voice message or audio file]");

        msg.media = MediaKind::Document;
        msg.mime_type = Some("application/pdf".to_string());
        assert_eq!(agent_input(&msg, None), "[The user sent a file of type: application/pdf]");

        let flagged = Verdict(json!({"analysis_results": {"is_phishing": true}}));
        assert!(agent_input(&msg, Some(&flagged)).contains("Suspicious content"));

        let msg = message(ChatKind::Private, "hello");
        assert_eq!(agent_input(&msg, Some(&flagged)), "hello");
    }

    #[tokio::test]
    async fn private_chat_gets_alert_and_reply() {
        let replies = Arc::new(RecordingReplies::default());
        let verdict = json!({"bot_responses": {"technical_response": {"text": "Known phishing domain"}}});
        let out = relay(Some(verdict), replies.clone())
            .handle(&message(ChatKind::Private, "hi"))
            .await;

        assert_eq!(out.alert.as_deref(), Some("Security Alert: Known phishing domain"));
        assert_eq!(out.reply.as_deref(), Some("echo: hi"));
        assert_eq!(
            replies.sent.lock().unwrap().clone(),
            vec![
                "Security Alert: Known phishing domain".to_string(),
                "echo: hi".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn group_reply_requires_a_mention() {
        let replies = Arc::new(RecordingReplies::default());
        let r = relay(None, replies.clone());

        let out = r.handle(&message(ChatKind::Group, "hi all")).await;
        assert_eq!(out, RelayOutcome::default());

        let mut mentioned = message(ChatKind::Group, "@bot hi");
        mentioned.mentioned = true;
        let out = r.handle(&mentioned).await;
        assert_eq!(out.reply.as_deref(), Some("echo: @bot hi"));
        assert_eq!(replies.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn staged_attachments_are_deleted_and_failures_do_not_stop_the_relay() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("telegram_42");
        std::fs::write(&staged, b"img").unwrap();

        let mut msg = message(ChatKind::Private, "");
        msg.media = MediaKind::Image;
        msg.attachments.push(Attachment {
            kind: MediaKind::Image,
            filename: "telegram_42".to_string(),
            size: 3,
            mime_type: Some("image/jpeg".to_string()),
            file_path: staged.clone(),
        });

        let replies = Arc::new(RecordingReplies {
            fail: true,
            ..Default::default()
        });
        let out = relay(None, replies).handle(&msg).await;

        assert_eq!(out, RelayOutcome::default());
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn bot_senders_are_ignored() {
        let replies = Arc::new(RecordingReplies::default());
        let mut msg = message(ChatKind::Private, "beep");
        msg.sender.is_bot = true;
        let out = relay(None, replies.clone()).handle(&msg).await;
        assert_eq!(out, RelayOutcome::default());
        assert!(replies.sent.lock().unwrap().is_empty());
    }
}
