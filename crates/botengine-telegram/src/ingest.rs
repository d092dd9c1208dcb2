//! Turns MTProto messages into `InboundMessage`s.

use std::path::Path;

use chrono::{DateTime, Utc};
use grammers_client::{
    types::{Chat, Downloadable, Media, Message},
    Client,
};

use botengine_core::{
    domain::{MediaKind, Source},
    relay::{Attachment, ChatKind, InboundMessage, Sender},
};

/// Telegram serves photos as JPEG.
const PHOTO_MIME: &str = "image/jpeg";

pub fn chat_kind(chat: &Chat) -> ChatKind {
    match chat {
        Chat::User(_) => ChatKind::Private,
        Chat::Group(_) | Chat::Channel(_) => ChatKind::Group,
    }
}

/// Content kind and reported MIME type of a message's media.
pub fn classify(media: Option<&Media>) -> (MediaKind, Option<String>) {
    match media {
        None => (MediaKind::Text, None),
        Some(Media::Photo(_)) => (MediaKind::Image, Some(PHOTO_MIME.to_string())),
        Some(Media::Document(d)) => {
            let mime = d.mime_type().map(str::to_string).filter(|m| !m.is_empty());
            (MediaKind::from_mime(mime.as_deref()), mime)
        }
        Some(_) => (MediaKind::Unknown, None),
    }
}

/// Staging file name for a downloaded attachment.
pub fn staged_name(message_id: i32, at: DateTime<Utc>) -> String {
    format!("telegram_{message_id}_{}", at.format("%Y%m%d_%H%M%S"))
}

fn sender_of(msg: &Message) -> Sender {
    match msg.sender() {
        Some(Chat::User(u)) => {
            let name = u.full_name();
            Sender {
                user_id: u.id().to_string(),
                name: if name.trim().is_empty() {
                    "Unknown".to_string()
                } else {
                    name
                },
                username: u.username().map(str::to_string),
                is_bot: u.is_bot(),
            }
        }
        Some(other) => Sender {
            user_id: other.id().to_string(),
            name: other.name().to_string(),
            username: other.username().map(str::to_string),
            is_bot: false,
        },
        None => Sender {
            user_id: msg.chat().id().to_string(),
            name: "Unknown".to_string(),
            username: None,
            is_bot: false,
        },
    }
}

async fn stage_media(
    client: &Client,
    media: Media,
    kind: MediaKind,
    mime: Option<String>,
    message_id: i32,
    media_dir: &Path,
) -> Option<Attachment> {
    if let Err(e) = tokio::fs::create_dir_all(media_dir).await {
        tracing::error!(dir = %media_dir.display(), "cannot create media directory: {e}");
        return None;
    }

    let filename = staged_name(message_id, Utc::now());
    let file_path = media_dir.join(&filename);
    if let Err(e) = client
        .download_media(&Downloadable::Media(media), &file_path)
        .await
    {
        tracing::error!(message_id, "attachment download failed: {e}");
        return None;
    }

    let size = match tokio::fs::metadata(&file_path).await {
        Ok(m) => m.len(),
        Err(e) => {
            tracing::error!(message_id, "downloaded attachment is unreadable: {e}");
            return None;
        }
    };

    tracing::info!(message_id, size, kind = kind.as_str(), "attachment staged");
    Some(Attachment {
        kind,
        filename,
        size,
        mime_type: mime,
        file_path,
    })
}

/// Normalize one incoming message. Media is downloaded into `media_dir`; a
/// failed download leaves the message without attachments.
pub async fn normalize(
    client: &Client,
    msg: &Message,
    recipient: &str,
    media_dir: &Path,
) -> InboundMessage {
    let chat = msg.chat();
    let kind = chat_kind(&chat);
    let media = msg.media();
    let (media_kind, mime_type) = classify(media.as_ref());

    let mut attachments = Vec::new();
    if let Some(media) = media {
        if let Some(a) =
            stage_media(client, media, media_kind, mime_type.clone(), msg.id(), media_dir).await
        {
            attachments.push(a);
        }
    }

    InboundMessage {
        platform: Source::Telegram,
        message_id: msg.id().to_string(),
        chat_id: chat.id().to_string(),
        chat_kind: kind,
        chat_title: match kind {
            ChatKind::Group => Some(chat.name().to_string()),
            ChatKind::Private => None,
        },
        sender: sender_of(msg),
        recipient: recipient.to_string(),
        text: msg.text().to_string(),
        media: media_kind,
        mime_type,
        attachments,
        mentioned: msg.mentioned(),
        timestamp: msg.date(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn staged_names_carry_message_id_and_time() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 3, 7).unwrap();
        assert_eq!(staged_name(812, at), "telegram_812_20240501_090307");
    }

    #[test]
    fn text_messages_have_no_mime() {
        assert_eq!(classify(None), (MediaKind::Text, None));
    }
}
