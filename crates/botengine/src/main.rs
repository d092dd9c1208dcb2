use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::Instrument;

use botengine_core::{
    agent::ConversationAgent,
    config::{
        AgentSettings, DiscordConfig, PanelConfig, PhishingSettings, WorkerConfig, WorkerIdentity,
    },
    control::{Applied, Command, ControlLoop},
    domain::{Platform, SessionCredentials, SessionId, SessionKey},
    handshake::publish_failure,
    ports::PhishingPort,
    relay::RelayParts,
    signals::SignalStore,
    supervisor::WorkerSupervisor,
};
use botengine_openai::OpenAiAgent;
use botengine_phishing::PhishingClient;

#[derive(Parser)]
#[command(name = "botengine")]
#[command(about = "Run Telegram and WhatsApp relay sessions from one control panel, or a Discord relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Interactive control panel (the default)
    Panel,
    /// Print the session table once
    Status,
    /// Start a session; the contact is the phone (Telegram) or the QR
    /// notification e-mail (WhatsApp)
    Start {
        platform: Platform,
        id: String,
        contact: Option<String>,
    },
    Restart {
        platform: Platform,
        id: String,
    },
    Stop {
        platform: Platform,
        id: String,
    },
    /// Stop a session and delete everything it left on disk
    Clear {
        platform: Platform,
        id: String,
    },
    /// Hand a Telegram verification code to a waiting session
    Code { id: String, code: String },
    /// Relay a Discord bot (DISCORD_TOKEN) in the foreground
    Discord,
    /// Run one session's worker (launched by the panel)
    #[command(hide = true)]
    Worker { platform: Platform },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Cmd::Panel) {
        Cmd::Worker { platform } => {
            botengine_core::logging::init("botengine_worker")?;
            worker(platform).await
        }
        Cmd::Discord => {
            botengine_core::logging::init("botengine_discord")?;
            discord().await
        }
        Cmd::Panel => {
            botengine_core::logging::init("botengine")?;
            let panel = control_loop()?;
            panel
                .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await?;
            Ok(())
        }
        other => {
            botengine_core::logging::init("botengine")?;
            one_shot(other).await
        }
    }
}

fn control_loop() -> Result<ControlLoop> {
    let cfg = Arc::new(PanelConfig::load().context("loading panel configuration")?);
    let supervisor = Arc::new(WorkerSupervisor::new(cfg.clone()));
    Ok(ControlLoop::new(cfg, supervisor))
}

async fn one_shot(cmd: Cmd) -> Result<()> {
    let panel = control_loop()?;
    panel.attach().await?;

    let cmd = match cmd {
        Cmd::Status => {
            print!("{}", panel.frame().await);
            return Ok(());
        }
        Cmd::Start {
            platform,
            id,
            contact,
        } => {
            let credentials = match platform {
                Platform::Telegram => SessionCredentials {
                    phone: contact,
                    email: None,
                },
                Platform::WhatsApp => SessionCredentials {
                    phone: None,
                    email: contact,
                },
            };
            Command::Start {
                key: SessionKey::new(platform, SessionId::new(id)?),
                credentials,
            }
        }
        Cmd::Restart { platform, id } => {
            Command::Restart(SessionKey::new(platform, SessionId::new(id)?))
        }
        Cmd::Stop { platform, id } => Command::Stop(SessionKey::new(platform, SessionId::new(id)?)),
        Cmd::Clear { platform, id } => {
            Command::Clear(SessionKey::new(platform, SessionId::new(id)?))
        }
        Cmd::Code { id, code } => Command::Code {
            id: SessionId::new(id)?,
            code,
        },
        Cmd::Panel | Cmd::Discord | Cmd::Worker { .. } => anyhow::bail!("not a one-shot command"),
    };

    if let Applied::Message(msg) = panel.apply(cmd).await? {
        println!("{msg}");
    }
    Ok(())
}

async fn worker(platform: Platform) -> Result<()> {
    let identity = WorkerIdentity::from_env(platform).context("reading worker identity")?;
    let signals = SignalStore::new(&identity.data_dir).session(identity.key.clone());
    let span = tracing::info_span!("worker", platform = %platform, session = %identity.key.id);

    async move {
        tracing::info!("worker starting");
        let result = run_session(identity).await;
        match &result {
            Ok(()) => tracing::info!("worker stopped"),
            Err(e) => {
                tracing::error!("worker failed: {e}");
                publish_failure(&signals, e);
            }
        }
        result
    }
    .instrument(span)
    .await?;
    Ok(())
}

fn relay_parts(
    agent: &AgentSettings,
    phishing: Option<PhishingSettings>,
) -> botengine_core::Result<RelayParts> {
    let agent = OpenAiAgent::new(agent)?;
    let phishing: Option<Arc<dyn PhishingPort>> = match phishing {
        Some(settings) => Some(Arc::new(PhishingClient::new(settings)?)),
        None => None,
    };
    Ok(RelayParts {
        agent: ConversationAgent::new(Arc::new(agent)),
        phishing,
    })
}

async fn run_session(identity: WorkerIdentity) -> botengine_core::Result<()> {
    let cfg = WorkerConfig::load(identity)?;
    let parts = relay_parts(&cfg.agent, cfg.phishing.clone())?;

    match cfg.identity.key.platform {
        Platform::Telegram => botengine_telegram::run_worker(cfg, parts).await,
        Platform::WhatsApp => botengine_whatsapp::run_worker(cfg, parts).await,
    }
}

async fn discord() -> Result<()> {
    let cfg = DiscordConfig::load().context("loading discord configuration")?;
    let parts = relay_parts(&cfg.agent, cfg.phishing.clone())?;
    botengine_discord::run(cfg, parts).await?;
    Ok(())
}
