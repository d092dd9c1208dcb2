//! Operator-facing control loop: derives each session's state from signal
//! facts plus worker liveness, renders it, and applies operator commands.

use std::{fmt::Write as _, str::FromStr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    time::sleep,
};

use crate::{
    config::PanelConfig,
    domain::{Platform, SessionCredentials, SessionId, SessionKey},
    errors::Error,
    signals::{AuthMarker, Fact, SignalStore},
    supervisor::{Liveness, SessionStatus, WorkerSupervisor},
    utils::truncate_text,
    Result,
};

/// State shown to the operator for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisplayState {
    Stopped,
    Starting,
    AwaitingCode { last_error: Option<String> },
    AwaitingScan { qr_data_url: String },
    /// A code was submitted and the worker has not consumed it yet.
    Verifying,
    Connected,
    Ready,
    Failed { reason: String },
}

impl DisplayState {
    /// States that change without operator action and deserve a fast refresh.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DisplayState::Starting
                | DisplayState::Verifying
                | DisplayState::Connected
                | DisplayState::AwaitingScan { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionView {
    pub key: SessionKey,
    pub credentials: SessionCredentials,
    pub pid: Option<u32>,
    pub state: DisplayState,
    /// Status marker left on disk; shown for stopped sessions.
    pub last_marker: Option<AuthMarker>,
}

/// Derive what the operator sees from durable facts and liveness only.
pub fn derive_view(status: &SessionStatus, store: &SignalStore) -> SessionView {
    let key = &status.key;
    let marker = store.auth_marker(key);
    let error = store.error(key);

    let (pid, state) = match &status.liveness {
        Liveness::Stopped => (None, DisplayState::Stopped),
        Liveness::Exited { pid, code } => {
            let reason = error.clone().unwrap_or_else(|| match code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker exited".to_string(),
            });
            (Some(*pid), DisplayState::Failed { reason })
        }
        Liveness::Running { pid } => {
            let needs_input = Fact::needs_input(key.platform);
            let state = if marker == Some(AuthMarker::Authenticated) {
                DisplayState::Ready
            } else if store.exists(key, Fact::Code) {
                DisplayState::Verifying
            } else if store.exists(key, needs_input) {
                match key.platform {
                    Platform::Telegram => DisplayState::AwaitingCode {
                        last_error: error.clone(),
                    },
                    Platform::WhatsApp => DisplayState::AwaitingScan {
                        qr_data_url: store.read(key, needs_input).unwrap_or_default(),
                    },
                }
            } else if marker == Some(AuthMarker::Connected) {
                DisplayState::Connected
            } else if let Some(reason) = error.clone() {
                DisplayState::Failed { reason }
            } else {
                DisplayState::Starting
            };
            (Some(*pid), state)
        }
    };

    SessionView {
        key: key.clone(),
        credentials: status.credentials.clone(),
        pid,
        state,
        last_marker: marker,
    }
}

/// Delay before the next render: short while anything is in flight.
pub fn next_delay(views: &[SessionView], fast: Duration, slow: Duration) -> Duration {
    if views.iter().any(|v| v.state.is_transient()) {
        fast
    } else {
        slow
    }
}

pub fn render(views: &[SessionView], store: &SignalStore) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "BotEngine sessions ({})", store.root().display());
    if views.is_empty() {
        out.push_str("  (no sessions; `help` lists commands)\n");
        return out;
    }

    for v in views {
        let detail = match &v.state {
            DisplayState::Stopped => match v.last_marker {
                Some(m) => format!("stopped (last status: {})", m.as_str()),
                None => "stopped".to_string(),
            },
            DisplayState::Starting => "connecting...".to_string(),
            DisplayState::AwaitingCode { last_error } => {
                let mut s = format!("waiting for code: `code {} <code>`", v.key.id);
                if let Some(e) = last_error {
                    let _ = write!(s, " (last error: {})", truncate_text(e, 120));
                }
                s
            }
            DisplayState::AwaitingScan { qr_data_url } => format!(
                "scan the QR code in {} ({} bytes)",
                store.path(&v.key, Fact::QrDataUrl).display(),
                qr_data_url.len()
            ),
            DisplayState::Verifying => "verifying code...".to_string(),
            DisplayState::Connected => "connected, starting relay...".to_string(),
            DisplayState::Ready => "authenticated and relaying".to_string(),
            DisplayState::Failed { reason } => {
                format!("FAILED: {} (`clear` to start over)", truncate_text(reason, 160))
            }
        };
        let pid = v.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:<9} {:<20} pid {:<8} {}",
            v.key.platform.as_str(),
            v.key.id.as_str(),
            pid,
            detail
        );
    }
    out
}

pub const HELP: &str = "\
commands:
  start telegram <id> <phone>     launch a Telegram session
  start whatsapp <id> [email]     launch a WhatsApp session (QR mailed to email)
  restart <platform> <id>         relaunch with stored credentials
  stop <platform> <id>            kill the worker, keep its state
  clear <platform> <id>           stop and delete everything of the session
  code <id> <code>                answer a Telegram verification request
  list                            re-render now
  quit                            leave the panel (workers keep running)";

/// An operator command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start {
        key: SessionKey,
        credentials: SessionCredentials,
    },
    Restart(SessionKey),
    Stop(SessionKey),
    Clear(SessionKey),
    Code {
        id: SessionId,
        code: String,
    },
    List,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let usage = |u: &str| Error::Config(format!("usage: {u}"));

        match parts.as_slice() {
            ["start", platform, id, rest @ ..] => {
                let key = SessionKey::parse(platform, id)?;
                let credentials = match (key.platform, rest) {
                    (Platform::Telegram, [phone]) => SessionCredentials {
                        phone: Some(phone.to_string()),
                        email: None,
                    },
                    (Platform::Telegram, _) => return Err(usage("start telegram <id> <phone>")),
                    (Platform::WhatsApp, []) => SessionCredentials::default(),
                    (Platform::WhatsApp, [email]) => SessionCredentials {
                        phone: None,
                        email: Some(email.to_string()),
                    },
                    (Platform::WhatsApp, _) => return Err(usage("start whatsapp <id> [email]")),
                };
                Ok(Command::Start { key, credentials })
            }
            ["restart", platform, id] => Ok(Command::Restart(SessionKey::parse(platform, id)?)),
            ["stop", platform, id] => Ok(Command::Stop(SessionKey::parse(platform, id)?)),
            ["clear", platform, id] => Ok(Command::Clear(SessionKey::parse(platform, id)?)),
            ["code", id, code] => Ok(Command::Code {
                id: SessionId::new(*id)?,
                code: code.to_string(),
            }),
            ["list"] | ["ls"] | [] => Ok(Command::List),
            ["help"] | ["?"] => Ok(Command::Help),
            ["quit"] | ["exit"] | ["q"] => Ok(Command::Quit),
            [cmd, ..] => Err(Error::Config(format!("unknown command `{cmd}`; try `help`"))),
        }
    }
}

/// Result of applying a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Message(String),
    Quit,
}

pub struct ControlLoop {
    cfg: Arc<PanelConfig>,
    supervisor: Arc<WorkerSupervisor>,
}

impl ControlLoop {
    pub fn new(cfg: Arc<PanelConfig>, supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { cfg, supervisor }
    }

    pub async fn views(&self) -> Vec<SessionView> {
        let store = self.supervisor.store();
        self.supervisor
            .snapshot()
            .await
            .iter()
            .map(|s| derive_view(s, store))
            .collect()
    }

    pub async fn apply(&self, cmd: Command) -> Result<Applied> {
        let msg = match cmd {
            Command::Start { key, credentials } => {
                let pid = self.supervisor.start(&key, credentials).await?;
                format!("started {key} (pid {pid})")
            }
            Command::Restart(key) => {
                let pid = self.supervisor.restart(&key).await?;
                format!("restarted {key} (pid {pid})")
            }
            Command::Stop(key) => {
                if self.supervisor.stop(&key).await? {
                    format!("stopped {key}")
                } else {
                    format!("{key} was not running")
                }
            }
            Command::Clear(key) => {
                self.supervisor.clear(&key).await?;
                format!("cleared {key}")
            }
            Command::Code { id, code } => self.submit_code(id, &code).await?,
            Command::List => String::new(),
            Command::Help => HELP.to_string(),
            Command::Quit => return Ok(Applied::Quit),
        };
        Ok(Applied::Message(msg))
    }

    async fn submit_code(&self, id: SessionId, code: &str) -> Result<String> {
        let key = SessionKey::new(Platform::Telegram, id);
        if !self.supervisor.is_known(&key).await {
            return Err(Error::InvalidSession {
                id: key.id.to_string(),
                reason: "no telegram session with this id".to_string(),
            });
        }

        let store = self.supervisor.store();
        if !store.exists(&key, Fact::NeedsCode) {
            return Err(Error::Config(format!("{key} is not waiting for a code")));
        }
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Config("the code must be letters/digits only".to_string()));
        }

        store.write(&key, Fact::Code, code)?;
        Ok(format!("code sent to {key}"))
    }

    /// Pick up sessions left on disk by an earlier panel. Returns how many
    /// were found.
    pub async fn attach(&self) -> Result<usize> {
        let found = self.supervisor.discover().await?;
        if !found.is_empty() {
            tracing::info!("discovered {} session(s) on disk", found.len());
        }
        Ok(found.len())
    }

    /// The session table as the panel would draw it.
    pub async fn frame(&self) -> String {
        render(&self.views().await, self.supervisor.store())
    }

    /// Render and handle operator input until `quit`. The panel keeps
    /// polling after its input ends.
    pub async fn run<R, W>(&self, input: R, mut out: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = self.attach().await {
            tracing::warn!("session discovery failed: {e}");
        }

        let mut lines = input.lines();
        let mut input_open = true;
        let mut notice = String::new();

        loop {
            let views = self.views().await;
            let mut frame = render(&views, self.supervisor.store());
            if !notice.is_empty() {
                frame.push_str(&notice);
                frame.push('\n');
                notice.clear();
            }
            frame.push_str("> ");
            out.write_all(frame.as_bytes()).await?;
            out.flush().await?;

            let delay = next_delay(&views, self.cfg.poll_fast, self.cfg.poll_slow);

            tokio::select! {
                _ = sleep(delay) => {}
                line = lines.next_line(), if input_open => match line {
                    Ok(Some(line)) => {
                        let applied = match line.parse::<Command>() {
                            Ok(cmd) => self.apply(cmd).await,
                            Err(e) => Err(e),
                        };
                        match applied {
                            Ok(Applied::Quit) => break,
                            Ok(Applied::Message(m)) => notice = m,
                            Err(e) => notice = format!("error: {e}"),
                        }
                    }
                    Ok(None) => input_open = false,
                    Err(e) => {
                        tracing::warn!("failed to read operator input: {e}");
                        input_open = false;
                    }
                },
            }
        }

        out.write_all(b"bye; running workers keep running\n").await?;
        out.flush().await?;
        Ok(())
    }
}
