use std::{fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Chat platform a session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    WhatsApp,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Telegram, Platform::WhatsApp];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::WhatsApp => "whatsapp",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "telegram" | "tg" => Ok(Platform::Telegram),
            "whatsapp" | "wa" => Ok(Platform::WhatsApp),
            other => Err(Error::Config(format!("unknown platform: {other}"))),
        }
    }
}

/// Where a relayed message came from: a session platform, or Discord, which
/// runs as one static bot identity outside the session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Telegram,
    WhatsApp,
    Discord,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Telegram => "telegram",
            Source::WhatsApp => "whatsapp",
            Source::Discord => "discord",
        }
    }
}

impl From<Platform> for Source {
    fn from(p: Platform) -> Self {
        match p {
            Platform::Telegram => Source::Telegram,
            Platform::WhatsApp => Source::WhatsApp,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session identifier, unique within a platform.
///
/// Every artifact path is derived from it, so only `[A-Za-z0-9_-]` is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

const SESSION_ID_MAX_LEN: usize = 64;

fn session_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id.len() > SESSION_ID_MAX_LEN {
            Some("longer than 64 characters")
        } else if !session_id_re().is_match(&id) {
            Some("only letters, digits, '_' and '-' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidSession {
                id,
                reason: reason.to_string(),
            }),
            None => Ok(Self(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// A session is identified by its platform plus its id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub platform: Platform,
    pub id: SessionId,
}

impl SessionKey {
    pub fn new(platform: Platform, id: SessionId) -> Self {
        Self { platform, id }
    }

    pub fn parse(platform: &str, id: &str) -> Result<Self> {
        Ok(Self {
            platform: platform.parse()?,
            id: SessionId::new(id)?,
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform, self.id)
    }
}

/// Per-session connection parameters the operator supplies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Kind of content carried by an inbound message, decided once at ingestion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Unknown,
}

impl MediaKind {
    /// Classify a media attachment by MIME type. `None` means the platform did
    /// not report one, which is treated as a generic document.
    pub fn from_mime(mime: Option<&str>) -> Self {
        let Some(mime) = mime.map(|m| m.trim().to_lowercase()).filter(|m| !m.is_empty()) else {
            return MediaKind::Document;
        };

        if mime.starts_with("audio/") || mime == "application/ogg" {
            MediaKind::Audio
        } else if mime.starts_with("image/") {
            MediaKind::Image
        } else if mime.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Document
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Unknown => "unknown",
        }
    }
}
