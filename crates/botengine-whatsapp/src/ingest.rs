use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};

use botengine_core::{
    domain::{MediaKind, Source},
    errors::Error,
    relay::{Attachment, ChatKind, InboundMessage, Sender},
    Result,
};

use crate::bridge::{BridgeMedia, BridgeMessage};

const FALLBACK_MIME: &str = "application/octet-stream";

/// File extension for a MIME type: the subtype without parameters.
pub fn extension_for(mime: Option<&str>) -> String {
    mime.and_then(|m| m.split(';').next())
        .and_then(|m| m.split_once('/'))
        .map(|(_, sub)| sub.trim())
        .filter(|sub| !sub.is_empty())
        .unwrap_or("bin")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Staging file name; WhatsApp message ids contain `@` and `.`, which are
/// kept, anything else outside `[A-Za-z0-9_-]` is replaced.
pub fn staged_name(message_id: &str, at: DateTime<Utc>, mime: Option<&str>) -> String {
    let id: String = message_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '@' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "whatsapp_{id}_{}.{}",
        at.format("%Y%m%dT%H%M%S%3fZ"),
        extension_for(mime)
    )
}

async fn stage_media(
    media: &BridgeMedia,
    message_id: &str,
    media_dir: &Path,
) -> Result<Attachment> {
    let bytes = BASE64_STANDARD
        .decode(media.data.trim())
        .map_err(|e| Error::External(format!("invalid media payload: {e}")))?;

    let mime = media.mimetype.as_deref().filter(|m| !m.trim().is_empty());
    let filename = staged_name(message_id, Utc::now(), mime);
    let file_path = media_dir.join(&filename);

    tokio::fs::create_dir_all(media_dir).await?;
    tokio::fs::write(&file_path, &bytes).await?;

    Ok(Attachment {
        kind: MediaKind::from_mime(mime),
        filename,
        size: bytes.len() as u64,
        mime_type: Some(mime.unwrap_or(FALLBACK_MIME).to_string()),
        file_path,
    })
}

/// Normalize one bridge message. Media is decoded into `media_dir`; a payload
/// that cannot be staged leaves the message without attachments.
pub async fn normalize(msg: BridgeMessage, recipient: &str, media_dir: &Path) -> InboundMessage {
    let (media, mime_type) = match &msg.media {
        None => (MediaKind::Text, None),
        Some(m) => {
            let mime = m.mimetype.clone().filter(|m| !m.trim().is_empty());
            (MediaKind::from_mime(mime.as_deref()), mime)
        }
    };

    let mut attachments = Vec::new();
    if let Some(m) = &msg.media {
        match stage_media(m, &msg.id, media_dir).await {
            Ok(a) => {
                tracing::info!(message_id = %msg.id, size = a.size, kind = a.kind.as_str(), "attachment staged");
                attachments.push(a);
            }
            Err(e) => tracing::error!(message_id = %msg.id, "attachment not staged: {e}"),
        }
    }

    let timestamp = msg
        .timestamp
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);
    let chat_kind = if msg.is_group {
        ChatKind::Group
    } else {
        ChatKind::Private
    };
    let name = msg
        .sender_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    InboundMessage {
        platform: Source::WhatsApp,
        message_id: msg.id,
        chat_id: msg.chat_id,
        chat_kind,
        chat_title: msg.chat_name.filter(|_| msg.is_group),
        sender: Sender {
            user_id: msg.from,
            name,
            username: None,
            is_bot: false,
        },
        recipient: recipient.to_string(),
        text: msg.body,
        media,
        mime_type,
        attachments,
        mentioned: msg.mentioned,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(media: Option<BridgeMedia>) -> BridgeMessage {
        BridgeMessage {
            id: "false_34600@c.us_3EB0A1".to_string(),
            chat_id: "120363@g.us".to_string(),
            is_group: true,
            chat_name: Some("Family".to_string()),
            from: "34600@c.us".to_string(),
            sender_name: None,
            from_me: false,
            body: String::new(),
            timestamp: Some(1_714_557_600),
            mentioned: true,
            media,
        }
    }

    #[test]
    fn extensions_come_from_the_mime_subtype() {
        assert_eq!(extension_for(Some("image/jpeg")), "jpeg");
        assert_eq!(extension_for(Some("audio/ogg; codecs=opus")), "ogg");
        assert_eq!(extension_for(Some("application/vnd.ms-excel")), "vnd_ms_excel");
        assert_eq!(extension_for(Some("garbage")), "bin");
        assert_eq!(extension_for(None), "bin");
    }

    #[test]
    fn staged_names_stay_inside_the_media_dir() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let name = staged_name("false_1@c.us_AB/../x", at, Some("image/png"));
        assert_eq!(name, "whatsapp_false_1@c.us_AB_.._x_20240501T100000000Z.png");
        assert!(!name.contains('/'));
    }

    #[tokio::test]
    async fn media_is_decoded_and_staged() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("temp_media");
        let msg = message(Some(BridgeMedia {
            mimetype: Some("audio/ogg; codecs=opus".to_string()),
            data: BASE64_STANDARD.encode(b"voice"),
        }));

        let inbound = normalize(msg, "Ana", &media_dir).await;

        assert_eq!(inbound.chat_kind, ChatKind::Group);
        assert_eq!(inbound.chat_title.as_deref(), Some("Family"));
        assert_eq!(inbound.sender.name, "Unknown");
        assert_eq!(inbound.media, MediaKind::Audio);
        assert!(inbound.mentioned);
        assert_eq!(inbound.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        let [a] = inbound.attachments.as_slice() else {
            panic!("expected one attachment");
        };
        assert_eq!(a.kind, MediaKind::Audio);
        assert_eq!(a.size, 5);
        assert!(a.filename.ends_with(".ogg"));
        assert_eq!(std::fs::read(&a.file_path).unwrap(), b"voice");
    }

    #[tokio::test]
    async fn broken_media_still_yields_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut msg = message(Some(BridgeMedia {
            mimetype: None,
            data: "%%%".to_string(),
        }));
        msg.body = "see attached".to_string();

        let inbound = normalize(msg, "Ana", dir.path()).await;
        assert!(inbound.attachments.is_empty());
        assert_eq!(inbound.media, MediaKind::Document);
        assert_eq!(inbound.text, "see attached");
    }
}
