use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{Platform, SessionId, SessionKey},
    errors::Error,
    Result,
};

// Environment handed from the panel to a worker.
pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_DATA_PATH: &str = "DATA_PATH";
pub const ENV_PHONE_NUMBER: &str = "PHONE_NUMBER";
pub const ENV_API_ID: &str = "API_ID";
pub const ENV_API_HASH: &str = "API_HASH";
pub const ENV_QR_EMAIL: &str = "WHATSAPP_QR_EMAIL";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_WHATSAPP_BRIDGE: &str = "WHATSAPP_BRIDGE";
pub const ENV_DISCORD_TOKEN: &str = "DISCORD_TOKEN";
/// Tags a worker's environment with its platform so a later panel can tell
/// its own workers apart from unrelated processes.
pub const ENV_WORKER_PLATFORM: &str = "BOTENGINE_PLATFORM";

/// Ambient variables a worker inherits from the panel. Everything else is
/// dropped so no other session's identifiers or secrets leak into it.
const DEFAULT_PASSTHROUGH: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "TMPDIR",
    "RUST_LOG",
    "RUST_BACKTRACE",
    "OPENAI_MODEL",
    "OPENAI_BASE_URL",
    "PHISHING_API_USER",
    "PHISHING_API_PASSWORD",
    "TOKEN_URL",
    "PHISHING_API_URL",
    "EMAIL_HOST",
    "EMAIL_PORT",
    "EMAIL_USER",
    "EMAIL_PASS",
    "PUPPETEER_EXECUTABLE_PATH",
    "AUTH_POLL_INTERVAL_MS",
    "AUTH_POLL_ATTEMPTS",
];

const DEFAULT_BRIDGE_SCRIPT: &str = "bridge/whatsapp-bridge.js";

/// Program + arguments used to launch a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Configuration of the control panel process.
#[derive(Clone, Debug)]
pub struct PanelConfig {
    /// Root for every durable artifact (signals, credentials, registry).
    pub data_dir: PathBuf,

    pub telegram_worker: WorkerCommand,
    pub whatsapp_worker: WorkerCommand,
    pub passthrough_env: Vec<String>,

    // Global credentials handed to workers at launch.
    pub openai_api_key: Option<String>,
    pub telegram_api_id: Option<String>,
    pub telegram_api_hash: Option<String>,
    /// Bridge command line for WhatsApp workers. Workers run inside the data
    /// directory, so the default script path is made absolute here.
    pub whatsapp_bridge: String,

    /// Re-render cadence while some session is mid-handshake.
    pub poll_fast: Duration,
    /// Re-render cadence when every session is settled.
    pub poll_slow: Duration,
}

impl PanelConfig {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Workers run inside the data directory, so a relative path would be
        // resolved twice.
        let data_dir = match env_path(ENV_DATA_PATH) {
            Some(p) => std::path::absolute(p)?,
            None => env::current_dir()?,
        };
        fs::create_dir_all(&data_dir)?;

        // Workers are this same binary in `worker` mode unless overridden.
        let program = match env_path("BOTENGINE_WORKER_PROGRAM") {
            Some(p) => p,
            None => env::current_exe()?,
        };
        let worker = |platform: Platform| WorkerCommand {
            program: program.clone(),
            args: vec!["worker".to_string(), platform.as_str().to_string()],
        };

        let mut passthrough_env: Vec<String> =
            DEFAULT_PASSTHROUGH.iter().map(|s| s.to_string()).collect();
        for extra in parse_csv(env_str("WORKER_ENV_PASSTHROUGH")) {
            if !passthrough_env.contains(&extra) {
                passthrough_env.push(extra);
            }
        }

        Ok(Self {
            data_dir,
            telegram_worker: worker(Platform::Telegram),
            whatsapp_worker: worker(Platform::WhatsApp),
            passthrough_env,
            openai_api_key: env_str(ENV_OPENAI_API_KEY).and_then(non_empty),
            telegram_api_id: env_str(ENV_API_ID).and_then(non_empty),
            telegram_api_hash: env_str(ENV_API_HASH).and_then(non_empty),
            whatsapp_bridge: match env_str(ENV_WHATSAPP_BRIDGE).and_then(non_empty) {
                Some(line) => line,
                None => format!(
                    "node {}",
                    env::current_dir()?.join(DEFAULT_BRIDGE_SCRIPT).display()
                ),
            },
            poll_fast: Duration::from_millis(env_u64("PANEL_POLL_FAST_MS").unwrap_or(3_000)),
            poll_slow: Duration::from_millis(env_u64("PANEL_POLL_SLOW_MS").unwrap_or(15_000)),
        })
    }

    pub fn worker_command(&self, platform: Platform) -> &WorkerCommand {
        match platform {
            Platform::Telegram => &self.telegram_worker,
            Platform::WhatsApp => &self.whatsapp_worker,
        }
    }
}

/// Which session a worker process serves. Resolved before anything else so
/// later configuration errors can still be published to the right error fact.
#[derive(Clone, Debug)]
pub struct WorkerIdentity {
    pub key: SessionKey,
    pub data_dir: PathBuf,
}

impl WorkerIdentity {
    pub fn from_env(platform: Platform) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let id = env_str(ENV_SESSION_ID)
            .and_then(non_empty)
            .ok_or_else(|| Error::Config(format!("{ENV_SESSION_ID} is required")))?;
        // Workers run inside the data directory, so a relative path would be
        // resolved twice.
        let data_dir = match env_path(ENV_DATA_PATH) {
            Some(p) => std::path::absolute(p)?,
            None => env::current_dir()?,
        };
        fs::create_dir_all(&data_dir)?;

        Ok(Self {
            key: SessionKey::new(platform, SessionId::new(id)?),
            data_dir,
        })
    }
}

#[derive(Clone, Debug)]
pub struct TelegramSettings {
    pub phone: String,
    pub api_id: i32,
    pub api_hash: String,
}

#[derive(Clone, Debug)]
pub struct WhatsAppSettings {
    pub qr_email: Option<String>,
    pub bridge: WorkerCommand,
}

#[derive(Clone, Debug)]
pub struct PhishingSettings {
    pub user: String,
    pub password: String,
    pub token_url: String,
    pub api_url: String,
}

#[derive(Clone, Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Budget for waiting on operator input during a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub attempts: u32,
}

impl PollBudget {
    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        // 5 s x 60 = 5 minutes.
        Self {
            interval: Duration::from_secs(5),
            attempts: 60,
        }
    }
}

/// Configuration of one worker process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub identity: WorkerIdentity,
    pub agent: AgentSettings,
    pub telegram: Option<TelegramSettings>,
    pub whatsapp: Option<WhatsAppSettings>,
    pub phishing: Option<PhishingSettings>,
    pub smtp: Option<SmtpSettings>,
    pub poll: PollBudget,
    /// Where downloaded attachments are staged before upload.
    pub media_dir: PathBuf,
}

impl WorkerConfig {
    pub fn load(identity: WorkerIdentity) -> Result<Self> {
        let agent = load_agent()?;

        let telegram = match identity.key.platform {
            Platform::Telegram => Some(load_telegram()?),
            Platform::WhatsApp => None,
        };
        let whatsapp = match identity.key.platform {
            Platform::WhatsApp => Some(load_whatsapp()?),
            Platform::Telegram => None,
        };

        let phishing = load_phishing();
        let smtp = load_smtp();

        let default_poll = PollBudget::default();
        let poll = PollBudget {
            interval: env_u64("AUTH_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(default_poll.interval),
            attempts: env_u32("AUTH_POLL_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(default_poll.attempts),
        };

        let media_dir = identity.data_dir.join("temp_media");

        Ok(Self {
            identity,
            agent,
            telegram,
            whatsapp,
            phishing,
            smtp,
            poll,
            media_dir,
        })
    }
}

#[derive(Clone, Debug)]
pub struct DiscordSettings {
    pub token: String,
    /// REST base, e.g. `https://discord.com/api/v10`.
    pub api_base: String,
}

/// Configuration of the Discord relay. Discord runs as one bot identity, with
/// no session, handshake or data directory.
#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub discord: DiscordSettings,
    pub agent: AgentSettings,
    pub phishing: Option<PhishingSettings>,
}

impl DiscordConfig {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let token = env_str(ENV_DISCORD_TOKEN)
            .and_then(non_empty)
            .ok_or_else(|| Error::Config(format!("{ENV_DISCORD_TOKEN} is required")))?;

        Ok(Self {
            discord: DiscordSettings {
                token: token.trim().to_string(),
                api_base: env_str("DISCORD_API_BASE")
                    .and_then(non_empty)
                    .unwrap_or_else(|| "https://discord.com/api/v10".to_string()),
            },
            agent: load_agent()?,
            phishing: load_phishing(),
        })
    }
}

fn load_agent() -> Result<AgentSettings> {
    let api_key = env_str(ENV_OPENAI_API_KEY)
        .and_then(non_empty)
        .ok_or_else(|| Error::Config(format!("{ENV_OPENAI_API_KEY} is required")))?;
    Ok(AgentSettings {
        api_key,
        model: env_str("OPENAI_MODEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "gpt-4o".to_string()),
        base_url: env_str("OPENAI_BASE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
    })
}

fn load_telegram() -> Result<TelegramSettings> {
    let phone = env_str(ENV_PHONE_NUMBER).and_then(non_empty);
    let api_id = env_str(ENV_API_ID).and_then(non_empty);
    let api_hash = env_str(ENV_API_HASH).and_then(non_empty);

    let (Some(phone), Some(api_id), Some(api_hash)) = (phone, api_id, api_hash) else {
        return Err(Error::Config(format!(
            "{ENV_PHONE_NUMBER}, {ENV_API_ID} and {ENV_API_HASH} are required for Telegram"
        )));
    };
    let api_id = api_id
        .trim()
        .parse::<i32>()
        .map_err(|_| Error::Config(format!("{ENV_API_ID} must be an integer")))?;

    Ok(TelegramSettings {
        phone: phone.trim().to_string(),
        api_id,
        api_hash: api_hash.trim().to_string(),
    })
}

fn load_whatsapp() -> Result<WhatsAppSettings> {
    let bridge_line = env_str(ENV_WHATSAPP_BRIDGE)
        .and_then(non_empty)
        .unwrap_or_else(|| format!("node {DEFAULT_BRIDGE_SCRIPT}"));
    let mut parts = bridge_line.split_whitespace().map(|s| s.to_string());
    let program = parts
        .next()
        .ok_or_else(|| Error::Config("WHATSAPP_BRIDGE is empty".to_string()))?;

    Ok(WhatsAppSettings {
        qr_email: env_str(ENV_QR_EMAIL).and_then(non_empty),
        bridge: WorkerCommand {
            program: PathBuf::from(program),
            args: parts.collect(),
        },
    })
}

fn load_phishing() -> Option<PhishingSettings> {
    let settings = phishing_from_env();
    if settings.is_none() {
        tracing::warn!("phishing API settings incomplete; samples will not be submitted");
    }
    settings
}

fn phishing_from_env() -> Option<PhishingSettings> {
    Some(PhishingSettings {
        user: env_str("PHISHING_API_USER").and_then(non_empty)?,
        password: env_str("PHISHING_API_PASSWORD").and_then(non_empty)?,
        token_url: env_str("TOKEN_URL").and_then(non_empty)?,
        api_url: env_str("PHISHING_API_URL").and_then(non_empty)?,
    })
}

fn load_smtp() -> Option<SmtpSettings> {
    Some(SmtpSettings {
        host: env_str("EMAIL_HOST").and_then(non_empty)?,
        port: env_str("EMAIL_PORT")?.trim().parse().ok()?,
        user: env_str("EMAIL_USER").and_then(non_empty)?,
        pass: env_str("EMAIL_PASS").and_then(non_empty)?,
    })
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_budget_defaults_to_five_minutes() {
        let b = PollBudget::default();
        assert_eq!(b.total(), Duration::from_secs(300));
    }

    #[test]
    fn unquote_strips_matching_quotes_only() {
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("'abc'"), "abc");
        assert_eq!(unquote("\"abc'"), "\"abc'");
        assert_eq!(unquote("\""), "\"");
    }

    #[test]
    fn parse_csv_skips_blanks() {
        assert_eq!(
            parse_csv(Some(" A, ,B ,".to_string())),
            vec!["A".to_string(), "B".to_string()]
        );
        assert!(parse_csv(None).is_empty());
    }

    #[test]
    fn passthrough_never_includes_session_scoped_vars() {
        for var in [
            ENV_SESSION_ID,
            ENV_PHONE_NUMBER,
            ENV_API_ID,
            ENV_API_HASH,
            ENV_QR_EMAIL,
            ENV_OPENAI_API_KEY,
            ENV_WHATSAPP_BRIDGE,
            ENV_WORKER_PLATFORM,
        ] {
            assert!(!DEFAULT_PASSTHROUGH.contains(&var), "{var} must not pass through");
        }
    }
}
