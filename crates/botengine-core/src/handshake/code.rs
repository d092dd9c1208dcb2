use tokio::time::sleep;

use super::{AuthState, Progress};
use crate::{
    config::PollBudget,
    ports::{CodeAuthPort, CodeVerdict},
    signals::{Fact, SessionSignals},
    Error, Result,
};

/// Placeholder content of the need-code fact; only its presence matters.
const NEEDS_CODE_MARKER: &str = "waiting";

/// Phone + code login driven through signal facts.
///
/// The operator answers `needs_code` by writing the `code` fact; the handshake
/// consumes it. A rejected code is reported through the error fact and the
/// handshake goes back to waiting on whatever is left of the poll budget.
pub struct CodeHandshake<P> {
    port: P,
    budget: PollBudget,
    progress: Progress,
}

impl<P: CodeAuthPort> CodeHandshake<P> {
    pub fn new(port: P, signals: SessionSignals, budget: PollBudget) -> Self {
        Self {
            port,
            budget,
            progress: Progress::new(signals),
        }
    }

    pub fn state(&self) -> &AuthState {
        self.progress.state()
    }

    /// Every state entered so far, oldest first.
    pub fn trail(&self) -> &[AuthState] {
        &self.progress.trail
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Drive the handshake to `Connected`. On error the error fact has been
    /// written and the state is `Failed`.
    pub async fn run(&mut self) -> Result<()> {
        match self.drive().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.progress.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.progress.enter(AuthState::Connecting);
        self.progress.clear_stale()?;

        if self.port.connect().await? {
            return self.progress.connected();
        }

        let signals = self.progress.signals.clone();
        signals.clear(Fact::AuthStatus)?;
        self.port.request_code().await?;
        signals.write(Fact::NeedsCode, NEEDS_CODE_MARKER)?;
        self.progress.enter(AuthState::NeedsInput);

        let mut remaining = self.budget.attempts;
        loop {
            let Some(code) = self.wait_for_code(&signals, &mut remaining).await? else {
                signals.clear(Fact::NeedsCode)?;
                return Err(Error::Timeout(format!(
                    "no verification code received within {:?}",
                    self.budget.total()
                )));
            };

            // An error fact never outlives the prompt while a retry is possible.
            signals.clear(Fact::Error)?;
            signals.clear(Fact::NeedsCode)?;
            self.progress.enter(AuthState::Verifying);

            match self.port.submit_code(&code).await? {
                CodeVerdict::Accepted => return self.progress.connected(),
                CodeVerdict::Rejected(reason) => {
                    tracing::warn!(session = %signals.key(), "verification code rejected: {reason}");
                    signals.write(Fact::NeedsCode, NEEDS_CODE_MARKER)?;
                    signals.write(Fact::Error, &reason)?;
                    self.progress.enter(AuthState::NeedsInput);
                }
            }
        }
    }

    /// Poll the code fact, one attempt per interval, consuming it on sight.
    async fn wait_for_code(
        &self,
        signals: &SessionSignals,
        remaining: &mut u32,
    ) -> Result<Option<String>> {
        while *remaining > 0 {
            *remaining -= 1;
            if let Some(code) = signals.take(Fact::Code)? {
                if !code.is_empty() {
                    return Ok(Some(code));
                }
            }
            sleep(self.budget.interval).await;
        }
        Ok(None)
    }
}
