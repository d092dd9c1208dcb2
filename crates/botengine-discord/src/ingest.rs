use chrono::{DateTime, Utc};
use serde::Deserialize;

use botengine_core::{
    domain::{MediaKind, Source},
    relay::{ChatKind, InboundMessage, Sender},
};

use crate::rest::BotUser;

#[derive(Clone, Debug, Deserialize)]
pub struct DiscordAuthor {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiscordMention {
    pub id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiscordAttachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// The fields of a `MESSAGE_CREATE` payload the relay uses.
#[derive(Clone, Debug, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub author: DiscordAuthor,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub mentions: Vec<DiscordMention>,
    #[serde(default)]
    pub attachments: Vec<DiscordAttachment>,
}

impl DiscordMessage {
    pub fn is_from(&self, user: &BotUser) -> bool {
        self.author.id == user.id
    }
}

fn media_of(msg: &DiscordMessage) -> (MediaKind, Option<String>) {
    match msg.attachments.first() {
        None => (MediaKind::Text, None),
        Some(a) => {
            let mime = a.content_type.clone().filter(|m| !m.trim().is_empty());
            (MediaKind::from_mime(mime.as_deref()), mime)
        }
    }
}

/// Attachments are classified but not downloaded: Discord keeps no local
/// staging area.
pub fn normalize(msg: DiscordMessage, me: &BotUser) -> InboundMessage {
    let (media, mime_type) = media_of(&msg);
    let chat_kind = match msg.guild_id {
        Some(_) => ChatKind::Group,
        None => ChatKind::Private,
    };
    let mentioned = msg.mentions.iter().any(|m| m.id == me.id);
    let timestamp = msg
        .timestamp
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    InboundMessage {
        platform: Source::Discord,
        message_id: msg.id,
        chat_id: msg.channel_id,
        chat_kind,
        chat_title: None,
        sender: Sender {
            user_id: msg.author.id,
            name: msg
                .author
                .global_name
                .unwrap_or_else(|| msg.author.username.clone()),
            username: Some(msg.author.username),
            is_bot: msg.author.bot,
        },
        recipient: me.username.clone(),
        text: msg.content,
        media,
        mime_type,
        attachments: Vec::new(),
        mentioned,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn me() -> BotUser {
        BotUser {
            id: "42".to_string(),
            username: "relay".to_string(),
        }
    }

    fn message(payload: serde_json::Value) -> DiscordMessage {
        serde_json::from_value(payload).unwrap()
    }

    #[test]
    fn guild_message_mentioning_the_bot() {
        let msg = message(json!({
            "id": "1001",
            "channel_id": "7",
            "guild_id": "55",
            "author": {"id": "9", "username": "mallory", "global_name": "Mallory"},
            "content": "<@42> check this link",
            "timestamp": "2024-05-01T09:30:00.000000+00:00",
            "mentions": [{"id": "42", "username": "relay"}],
            "attachments": [],
            "tts": false
        }));
        assert!(!msg.is_from(&me()));

        let inbound = normalize(msg, &me());
        assert_eq!(inbound.platform, Source::Discord);
        assert_eq!(inbound.chat_kind, ChatKind::Group);
        assert!(inbound.mentioned);
        assert_eq!(inbound.sender.name, "Mallory");
        assert_eq!(inbound.sender.username.as_deref(), Some("mallory"));
        assert_eq!(inbound.recipient, "relay");
        assert_eq!(inbound.media, MediaKind::Text);
        assert_eq!(
            inbound.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn direct_message_with_an_image() {
        let msg = message(json!({
            "id": "1002",
            "channel_id": "8",
            "author": {"id": "9", "username": "mallory", "bot": false},
            "content": "",
            "attachments": [{"id": "3", "filename": "x.png", "content_type": "image/png", "size": 10}]
        }));

        let inbound = normalize(msg, &me());
        assert_eq!(inbound.chat_kind, ChatKind::Private);
        assert!(!inbound.mentioned);
        assert_eq!(inbound.media, MediaKind::Image);
        assert_eq!(inbound.mime_type.as_deref(), Some("image/png"));
        assert!(inbound.attachments.is_empty());
        assert_eq!(inbound.sender.name, "mallory");
    }

    #[test]
    fn own_messages_are_recognized() {
        let msg = message(json!({
            "id": "1003",
            "channel_id": "8",
            "author": {"id": "42", "username": "relay", "bot": true},
            "content": "hi"
        }));
        assert!(msg.is_from(&me()));
        assert!(normalize(msg, &me()).sender.is_bot);
    }
}
