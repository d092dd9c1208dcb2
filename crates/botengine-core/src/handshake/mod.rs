//! Worker-side authentication state machine.
//!
//! A handshake only talks to the control panel through signal facts: the
//! status fact carries `connected` / `authenticated`, the need-input, QR and
//! error facts carry everything else.

mod code;
mod qr;

pub use code::CodeHandshake;
pub use qr::QrHandshake;

use std::fmt;

use crate::{
    signals::{AuthMarker, Fact, SessionSignals},
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    Connecting,
    NeedsInput,
    Verifying,
    Connected,
    Authenticated,
    Failed(String),
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Disconnected => f.write_str("disconnected"),
            AuthState::Connecting => f.write_str("connecting"),
            AuthState::NeedsInput => f.write_str("needs_input"),
            AuthState::Verifying => f.write_str("verifying"),
            AuthState::Connected => f.write_str("connected"),
            AuthState::Authenticated => f.write_str("authenticated"),
            AuthState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Sequence of states a handshake went through, with the publishing side
/// effects every handshake shares.
#[derive(Debug)]
struct Progress {
    signals: SessionSignals,
    trail: Vec<AuthState>,
}

impl Progress {
    fn new(signals: SessionSignals) -> Self {
        Self {
            signals,
            trail: vec![AuthState::Disconnected],
        }
    }

    fn state(&self) -> &AuthState {
        // Never empty: starts with `Disconnected`.
        &self.trail[self.trail.len() - 1]
    }

    fn enter(&mut self, next: AuthState) {
        tracing::info!(session = %self.signals.key(), "auth: {} -> {}", self.state(), next);
        self.trail.push(next);
    }

    /// Drop facts a previous worker run may have left behind.
    fn clear_stale(&self) -> Result<()> {
        let platform = self.signals.key().platform;
        self.signals.clear(Fact::Error)?;
        self.signals.clear(Fact::Code)?;
        self.signals.clear(Fact::needs_input(platform))?;
        Ok(())
    }

    fn connected(&mut self) -> Result<()> {
        self.signals.clear(Fact::Error)?;
        self.signals.publish_status(AuthMarker::Connected)?;
        self.enter(AuthState::Connected);
        Ok(())
    }

    /// Publish a fatal error. Best effort: the worker is about to exit anyway.
    fn fail(&mut self, err: &Error) {
        let text = err.to_string();
        tracing::error!(session = %self.signals.key(), "auth failed: {text}");

        let platform = self.signals.key().platform;
        if let Err(e) = self.signals.clear(Fact::needs_input(platform)) {
            tracing::warn!("failed to clear need-input fact: {e}");
        }
        if let Err(e) = self.signals.write(Fact::Error, &text) {
            tracing::warn!("failed to publish error fact: {e}");
        }
        self.enter(AuthState::Failed(text));
    }
}

/// Publish the terminal `authenticated` status once the relay is up.
pub fn mark_authenticated(signals: &SessionSignals) -> Result<()> {
    signals.publish_status(AuthMarker::Authenticated)?;
    tracing::info!(session = %signals.key(), "auth: authenticated");
    Ok(())
}

/// Publish a worker-level failure that happened outside a handshake
/// (configuration, relay startup).
pub fn publish_failure(signals: &SessionSignals, err: &Error) {
    if let Err(e) = signals.write(Fact::Error, &err.to_string()) {
        tracing::warn!(session = %signals.key(), "failed to publish error fact: {e}");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{
        config::PollBudget,
        domain::{Platform, SessionId, SessionKey},
        signals::{SessionSignals, SignalStore},
    };
    use std::time::Duration;

    pub fn signals(dir: &std::path::Path, platform: Platform, id: &str) -> SessionSignals {
        SignalStore::new(dir).session(SessionKey::new(platform, SessionId::new(id).unwrap()))
    }

    pub fn fast_budget(attempts: u32) -> PollBudget {
        PollBudget {
            interval: Duration::from_millis(10),
            attempts,
        }
    }
}
