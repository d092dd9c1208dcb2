//! Ports implemented by adapter crates (chat platforms, agent, phishing API).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    relay::{InboundMessage, Sample, Verdict},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One remembered exchange line of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversational agent. Stateless: the caller owns the history.
#[async_trait]
pub trait AgentPort: Send + Sync {
    async fn invoke(&self, input: &str, history: &[ChatTurn]) -> Result<String>;
}

/// Phishing-detection API. Failures are swallowed by the implementation and
/// reported as `None`; the relay never stops on them.
#[async_trait]
pub trait PhishingPort: Send + Sync {
    async fn submit(&self, sample: &Sample) -> Option<Verdict>;
}

/// Sends text back into the chat a message came from.
#[async_trait]
pub trait ReplyPort: Send + Sync {
    async fn reply(&self, to: &InboundMessage, text: &str) -> Result<()>;
}

/// Outcome of submitting a verification code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeVerdict {
    Accepted,
    /// The platform refused the code; the operator may try again.
    Rejected(String),
}

/// Phone + one-time-code login (Telegram).
#[async_trait]
pub trait CodeAuthPort: Send {
    /// Open the connection. Returns whether stored credentials are already
    /// authorized.
    async fn connect(&mut self) -> Result<bool>;

    /// Ask the platform to send a login code to the session's phone.
    async fn request_code(&mut self) -> Result<()>;

    async fn submit_code(&mut self, code: &str) -> Result<CodeVerdict>;
}

/// Events of a QR pairing login (WhatsApp).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrEvent {
    /// A fresh challenge payload to encode as a QR image.
    Challenge(String),
    /// The platform confirmed the scan.
    Authenticated,
    /// The client is fully ready to relay messages.
    Ready { name: Option<String> },
    Failure(String),
}

#[async_trait]
pub trait QrAuthPort: Send {
    /// Next pairing event, or `None` once the platform side has gone away.
    async fn next_event(&mut self) -> Result<Option<QrEvent>>;
}

/// Turns QR challenges into something an operator can scan.
#[async_trait]
pub trait QrPresenter: Send + Sync {
    /// Render a challenge payload as a displayable data URI.
    fn render(&self, payload: &str) -> Result<String>;

    /// Called once the rendered challenge has been published.
    async fn published(&self, _data_url: &str) {}
}
