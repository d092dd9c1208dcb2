//! Filesystem-backed signal facts shared by the control panel and workers.
//!
//! Each fact is one small text file at a path derived from
//! `(platform, session, fact)`. Presence of the file IS the fact; absence means
//! "not known yet / not needed". There is no locking: writers replace files
//! atomically and readers accept a value that is one poll interval stale.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    domain::{Platform, SessionId, SessionKey},
    utils::{atomic_write, remove_file_if_exists},
    Result,
};

/// Kind of fact exchanged through the data directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fact {
    /// Worker is waiting for a verification code (Telegram).
    NeedsCode,
    /// Operator-supplied code; consumed (deleted) by the worker.
    Code,
    /// `connected` | `authenticated`.
    AuthStatus,
    /// Last error text.
    Error,
    /// Current QR challenge as a data URI (WhatsApp).
    QrDataUrl,
}

impl Fact {
    pub const ALL: [Fact; 5] = [
        Fact::NeedsCode,
        Fact::Code,
        Fact::AuthStatus,
        Fact::Error,
        Fact::QrDataUrl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Fact::NeedsCode => "needs_code",
            Fact::Code => "code",
            Fact::AuthStatus => "auth_status",
            Fact::Error => "error",
            Fact::QrDataUrl => "qr_data_url",
        }
    }

    /// The fact a worker publishes while it waits on the operator.
    pub fn needs_input(platform: Platform) -> Fact {
        match platform {
            Platform::Telegram => Fact::NeedsCode,
            Platform::WhatsApp => Fact::QrDataUrl,
        }
    }
}

pub const AUTH_CONNECTED: &str = "connected";
pub const AUTH_AUTHENTICATED: &str = "authenticated";

/// Value of the auth-status fact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMarker {
    Connected,
    Authenticated,
}

impl AuthMarker {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMarker::Connected => AUTH_CONNECTED,
            AuthMarker::Authenticated => AUTH_AUTHENTICATED,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            AUTH_CONNECTED => Some(AuthMarker::Connected),
            AUTH_AUTHENTICATED => Some(AuthMarker::Authenticated),
            _ => None,
        }
    }
}

/// Signal facts rooted at the data directory.
#[derive(Clone, Debug)]
pub struct SignalStore {
    root: PathBuf,
}

impl SignalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &SessionKey, fact: Fact) -> PathBuf {
        self.root
            .join(format!("{}_{}_{}.txt", key.platform, fact.name(), key.id))
    }

    /// Read a fact. Missing files and unexpected I/O errors both read as absent;
    /// the latter is logged because it usually means a permissions problem.
    pub fn read(&self, key: &SessionKey, fact: Fact) -> Option<String> {
        let path = self.path(key, fact);
        match fs::read_to_string(&path) {
            Ok(s) => Some(s.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to read signal: {e}");
                None
            }
        }
    }

    pub fn write(&self, key: &SessionKey, fact: Fact, value: &str) -> Result<()> {
        atomic_write(&self.path(key, fact), value.as_bytes())
    }

    /// Delete a fact. Returns whether it existed.
    pub fn clear(&self, key: &SessionKey, fact: Fact) -> Result<bool> {
        remove_file_if_exists(&self.path(key, fact))
    }

    pub fn exists(&self, key: &SessionKey, fact: Fact) -> bool {
        self.path(key, fact).is_file()
    }

    /// Read and delete a fact in one step (consumer side of a request).
    ///
    /// If the delete loses a race with another consumer the value is dropped,
    /// so exactly one reader acts on a given input.
    pub fn take(&self, key: &SessionKey, fact: Fact) -> Result<Option<String>> {
        let Some(value) = self.read(key, fact) else {
            return Ok(None);
        };
        if !self.clear(key, fact)? {
            return Ok(None);
        }
        Ok(Some(value))
    }

    pub fn auth_marker(&self, key: &SessionKey) -> Option<AuthMarker> {
        self.read(key, Fact::AuthStatus)
            .and_then(|s| AuthMarker::parse(&s))
    }

    /// Non-empty error text, if any.
    pub fn error(&self, key: &SessionKey) -> Option<String> {
        self.read(key, Fact::Error).filter(|s| !s.is_empty())
    }

    pub fn session(&self, key: SessionKey) -> SessionSignals {
        SessionSignals {
            store: self.clone(),
            key,
        }
    }

    // ============== Credential Artifacts ==============

    /// Telegram credential blob.
    pub fn telegram_session_file(&self, id: &SessionId) -> PathBuf {
        self.root.join(format!("chatbot_session_{id}.session"))
    }

    /// WhatsApp credential directory.
    pub fn whatsapp_session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(format!("session-{id}"))
    }

    /// Every file artifact that belongs to a session (directories excluded).
    pub fn session_files(&self, key: &SessionKey) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Fact::ALL.iter().map(|f| self.path(key, *f)).collect();
        if key.platform == Platform::Telegram {
            let blob = self.telegram_session_file(&key.id);
            let mut journal = blob.clone().into_os_string();
            journal.push("-journal");
            out.push(blob);
            out.push(PathBuf::from(journal));
        }
        out
    }

    /// Every directory artifact that belongs to a session.
    pub fn session_dirs(&self, key: &SessionKey) -> Vec<PathBuf> {
        match key.platform {
            Platform::Telegram => Vec::new(),
            Platform::WhatsApp => vec![self.whatsapp_session_dir(&key.id)],
        }
    }
}

/// Parse a data-directory entry name back to the session it belongs to.
///
/// Recognizes fact files, Telegram credential blobs and WhatsApp credential
/// directories. Anything else (including temp files) yields `None`.
pub fn parse_artifact_name(name: &str, is_dir: bool) -> Option<SessionKey> {
    if is_dir {
        let id = name.strip_prefix("session-")?;
        return SessionId::new(id)
            .ok()
            .map(|id| SessionKey::new(Platform::WhatsApp, id));
    }

    if let Some(rest) = name.strip_prefix("chatbot_session_") {
        let id = rest.strip_suffix(".session")?;
        return SessionId::new(id)
            .ok()
            .map(|id| SessionKey::new(Platform::Telegram, id));
    }

    let stem = name.strip_suffix(".txt")?;
    for platform in Platform::ALL {
        for fact in Fact::ALL {
            let prefix = format!("{}_{}_", platform, fact.name());
            if let Some(id) = stem.strip_prefix(&prefix) {
                if let Ok(id) = SessionId::new(id) {
                    return Some(SessionKey::new(platform, id));
                }
            }
        }
    }
    None
}

/// Signal facts bound to one session (the worker's view).
#[derive(Clone, Debug)]
pub struct SessionSignals {
    store: SignalStore,
    key: SessionKey,
}

impl SessionSignals {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub fn read(&self, fact: Fact) -> Option<String> {
        self.store.read(&self.key, fact)
    }

    pub fn write(&self, fact: Fact, value: &str) -> Result<()> {
        self.store.write(&self.key, fact, value)
    }

    pub fn clear(&self, fact: Fact) -> Result<bool> {
        self.store.clear(&self.key, fact)
    }

    pub fn exists(&self, fact: Fact) -> bool {
        self.store.exists(&self.key, fact)
    }

    pub fn take(&self, fact: Fact) -> Result<Option<String>> {
        self.store.take(&self.key, fact)
    }

    pub fn publish_status(&self, marker: AuthMarker) -> Result<()> {
        self.write(Fact::AuthStatus, marker.as_str())
    }

    pub fn auth_marker(&self) -> Option<AuthMarker> {
        self.store.auth_marker(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(platform: Platform, id: &str) -> SessionKey {
        SessionKey::new(platform, SessionId::new(id).unwrap())
    }

    #[test]
    fn paths_follow_data_directory_layout() {
        let store = SignalStore::new("/data");
        let alice = key(Platform::Telegram, "alice");
        assert_eq!(
            store.path(&alice, Fact::NeedsCode),
            PathBuf::from("/data/telegram_needs_code_alice.txt")
        );
        assert_eq!(
            store.path(&alice, Fact::Code),
            PathBuf::from("/data/telegram_code_alice.txt")
        );
        assert_eq!(
            store.path(&key(Platform::WhatsApp, "bob"), Fact::QrDataUrl),
            PathBuf::from("/data/whatsapp_qr_data_url_bob.txt")
        );
        assert_eq!(
            store.telegram_session_file(&alice.id),
            PathBuf::from("/data/chatbot_session_alice.session")
        );
    }

    #[test]
    fn read_write_clear_and_take() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path());
        let k = key(Platform::Telegram, "alice");

        assert_eq!(store.read(&k, Fact::Code), None);
        assert!(!store.exists(&k, Fact::Code));

        store.write(&k, Fact::Code, " 123456\n").unwrap();
        assert!(store.exists(&k, Fact::Code));
        assert_eq!(store.read(&k, Fact::Code).as_deref(), Some("123456"));

        assert_eq!(store.take(&k, Fact::Code).unwrap().as_deref(), Some("123456"));
        assert!(!store.exists(&k, Fact::Code));
        assert_eq!(store.take(&k, Fact::Code).unwrap(), None);

        store.write(&k, Fact::Error, "boom").unwrap();
        assert!(store.clear(&k, Fact::Error).unwrap());
        assert!(!store.clear(&k, Fact::Error).unwrap());
    }

    #[test]
    fn sessions_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path());
        let a = key(Platform::Telegram, "a");
        let b = key(Platform::Telegram, "b");
        let wa = key(Platform::WhatsApp, "a");

        store.write(&a, Fact::AuthStatus, AUTH_CONNECTED).unwrap();
        assert_eq!(store.auth_marker(&a), Some(AuthMarker::Connected));
        assert_eq!(store.auth_marker(&b), None);
        assert_eq!(store.auth_marker(&wa), None);
    }

    #[test]
    fn unknown_status_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path());
        let k = key(Platform::WhatsApp, "x");
        store.write(&k, Fact::AuthStatus, "garbage").unwrap();
        assert_eq!(store.auth_marker(&k), None);
    }

    #[test]
    fn empty_error_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SignalStore::new(dir.path());
        let k = key(Platform::Telegram, "x");
        store.write(&k, Fact::Error, "  ").unwrap();
        assert_eq!(store.error(&k), None);
    }

    #[test]
    fn parses_artifact_names() {
        assert_eq!(
            parse_artifact_name("telegram_needs_code_alice.txt", false),
            Some(key(Platform::Telegram, "alice"))
        );
        assert_eq!(
            parse_artifact_name("telegram_code_al_ice.txt", false),
            Some(key(Platform::Telegram, "al_ice"))
        );
        assert_eq!(
            parse_artifact_name("whatsapp_qr_data_url_bob.txt", false),
            Some(key(Platform::WhatsApp, "bob"))
        );
        assert_eq!(
            parse_artifact_name("chatbot_session_carol.session", false),
            Some(key(Platform::Telegram, "carol"))
        );
        assert_eq!(
            parse_artifact_name("session-dave", true),
            Some(key(Platform::WhatsApp, "dave"))
        );
        assert_eq!(parse_artifact_name("session-dave", false), None);
        assert_eq!(parse_artifact_name("chatbot_session_x.session-journal", false), None);
        assert_eq!(parse_artifact_name("sessions_config.json", false), None);
        assert_eq!(parse_artifact_name(".telegram_code_a.txt.tmp.1.0", false), None);
    }
}
