use tokio::time::{timeout_at, Instant};

use super::{AuthState, Progress};
use crate::{
    config::PollBudget,
    ports::{QrAuthPort, QrEvent, QrPresenter},
    signals::{Fact, SessionSignals},
    Error, Result,
};

/// QR pairing login driven by platform events.
///
/// Each challenge replaces the `qr_data_url` fact. The scan confirmation
/// removes it and publishes `connected`; `ready` ends the handshake. The whole
/// exchange must finish within the poll budget.
pub struct QrHandshake<P, R> {
    port: P,
    presenter: R,
    budget: PollBudget,
    progress: Progress,
}

impl<P: QrAuthPort, R: QrPresenter> QrHandshake<P, R> {
    pub fn new(port: P, presenter: R, signals: SessionSignals, budget: PollBudget) -> Self {
        Self {
            port,
            presenter,
            budget,
            progress: Progress::new(signals),
        }
    }

    pub fn state(&self) -> &AuthState {
        self.progress.state()
    }

    pub fn trail(&self) -> &[AuthState] {
        &self.progress.trail
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Drive the pairing to `Connected`. Returns the account display name when
    /// the platform reports one.
    pub async fn run(&mut self) -> Result<Option<String>> {
        match self.drive().await {
            Ok(name) => Ok(name),
            Err(e) => {
                self.progress.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<Option<String>> {
        self.progress.enter(AuthState::Connecting);
        self.progress.clear_stale()?;
        let signals = self.progress.signals.clone();
        // Whether stored credentials still work is only known once the
        // platform answers.
        signals.clear(Fact::AuthStatus)?;

        let deadline = Instant::now() + self.budget.total();
        loop {
            let event = match timeout_at(deadline, self.port.next_event()).await {
                Ok(event) => event?,
                Err(_) => {
                    signals.clear(Fact::QrDataUrl)?;
                    return Err(Error::Timeout(format!(
                        "QR code not scanned within {:?}",
                        self.budget.total()
                    )));
                }
            };

            match event {
                None => {
                    return Err(Error::External(
                        "WhatsApp client exited before the session was ready".to_string(),
                    ));
                }
                Some(QrEvent::Challenge(payload)) => {
                    let data_url = self.presenter.render(&payload)?;
                    signals.write(Fact::QrDataUrl, &data_url)?;
                    if self.progress.state() != &AuthState::NeedsInput {
                        self.progress.enter(AuthState::NeedsInput);
                    }
                    self.presenter.published(&data_url).await;
                }
                Some(QrEvent::Authenticated) => {
                    signals.clear(Fact::QrDataUrl)?;
                    self.progress.enter(AuthState::Verifying);
                    self.progress.connected()?;
                }
                Some(QrEvent::Ready { name }) => {
                    if self.progress.state() != &AuthState::Connected {
                        signals.clear(Fact::QrDataUrl)?;
                        self.progress.connected()?;
                    }
                    return Ok(name);
                }
                Some(QrEvent::Failure(msg)) => {
                    return Err(Error::External(format!("authentication failure: {msg}")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::Platform,
        handshake::test_support::*,
        signals::AuthMarker,
    };
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tokio::time::sleep;

    /// Replays scripted events; `None` entries stall forever.
    struct FakeBridge {
        events: VecDeque<Option<QrEvent>>,
        observed: Arc<Mutex<Vec<Option<String>>>>,
        signals: SessionSignals,
    }

    #[async_trait]
    impl QrAuthPort for FakeBridge {
        async fn next_event(&mut self) -> Result<Option<QrEvent>> {
            // Record what the panel would see before each event.
            self.observed
                .lock()
                .unwrap()
                .push(self.signals.read(Fact::QrDataUrl));
            match self.events.pop_front() {
                Some(Some(ev)) => Ok(Some(ev)),
                Some(None) => {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
                None => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct FakePresenter {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QrPresenter for FakePresenter {
        fn render(&self, payload: &str) -> Result<String> {
            Ok(format!("data:image/png;base64,{payload}"))
        }

        async fn published(&self, data_url: &str) {
            self.published.lock().unwrap().push(data_url.to_string());
        }
    }

    fn bridge(signals: &SessionSignals, events: Vec<Option<QrEvent>>) -> FakeBridge {
        FakeBridge {
            events: events.into(),
            observed: Arc::new(Mutex::new(Vec::new())),
            signals: signals.clone(),
        }
    }

    #[tokio::test]
    async fn refreshed_challenges_replace_the_qr_until_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let signals = signals(dir.path(), Platform::WhatsApp, "bob");
        let port = bridge(
            &signals,
            vec![
                Some(QrEvent::Challenge("first".to_string())),
                Some(QrEvent::Challenge("second".to_string())),
                Some(QrEvent::Authenticated),
                Some(QrEvent::Ready {
                    name: Some("Bob".to_string()),
                }),
            ],
        );
        let observed = port.observed.clone();

        let mut hs = QrHandshake::new(port, FakePresenter::default(), signals.clone(), fast_budget(100));
        let name = hs.run().await.unwrap();

        assert_eq!(name.as_deref(), Some("Bob"));
        assert_eq!(
            observed.lock().unwrap().clone(),
            vec![
                None,
                Some("data:image/png;base64,first".to_string()),
                Some("data:image/png;base64,second".to_string()),
                None,
            ]
        );
        assert_eq!(
            hs.trail(),
            &[
                AuthState::Disconnected,
                AuthState::Connecting,
                AuthState::NeedsInput,
                AuthState::Verifying,
                AuthState::Connected,
            ]
        );
        assert!(!signals.exists(Fact::QrDataUrl));
        assert_eq!(signals.auth_marker(), Some(AuthMarker::Connected));
        assert_eq!(hs.presenter.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stored_credentials_go_straight_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let signals = signals(dir.path(), Platform::WhatsApp, "carol");
        signals.write(Fact::QrDataUrl, "data:stale").unwrap();
        signals.write(Fact::Error, "old").unwrap();

        let port = bridge(&signals, vec![Some(QrEvent::Ready { name: None })]);
        let mut hs = QrHandshake::new(port, FakePresenter::default(), signals.clone(), fast_budget(10));
        hs.run().await.unwrap();

        assert_eq!(signals.auth_marker(), Some(AuthMarker::Connected));
        assert!(!signals.exists(Fact::QrDataUrl));
        assert!(!signals.exists(Fact::Error));
    }

    #[tokio::test]
    async fn unscanned_qr_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let signals = signals(dir.path(), Platform::WhatsApp, "dave");
        let port = bridge(
            &signals,
            vec![Some(QrEvent::Challenge("only".to_string())), None],
        );

        let mut hs = QrHandshake::new(port, FakePresenter::default(), signals.clone(), fast_budget(5));
        let err = hs.run().await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(signals.read(Fact::Error).unwrap().contains("timeout"));
        assert!(!signals.exists(Fact::QrDataUrl));
        assert_eq!(signals.auth_marker(), None);
    }

    #[tokio::test]
    async fn auth_failure_and_bridge_exit_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let signals = signals(dir.path(), Platform::WhatsApp, "erin");

        let port = bridge(&signals, vec![Some(QrEvent::Failure("restore failed".to_string()))]);
        let mut hs = QrHandshake::new(port, FakePresenter::default(), signals.clone(), fast_budget(10));
        assert!(hs.run().await.is_err());
        assert!(signals.read(Fact::Error).unwrap().contains("restore failed"));

        let port = bridge(&signals, vec![]);
        let mut hs = QrHandshake::new(port, FakePresenter::default(), signals.clone(), fast_budget(10));
        assert!(hs.run().await.is_err());
        assert!(matches!(hs.state(), AuthState::Failed(_)));
    }
}
