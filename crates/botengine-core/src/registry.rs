//! Durable session registry (`sessions_config.json`) and data-dir discovery.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Platform, SessionCredentials, SessionId, SessionKey},
    signals::parse_artifact_name,
    utils::{atomic_write, iso_timestamp_utc},
    Result,
};

pub const SESSIONS_CONFIG_FILE: &str = "sessions_config.json";

/// One session's durable record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(flatten)]
    pub credentials: SessionCredentials,
    /// Last pid launched for this session; only a liveness hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// On-disk shape: `platform -> session_id -> record`.
///
/// Keys stay plain strings so one malformed entry (or a platform this build
/// does not know) survives a read-modify-write untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct SessionsFile(BTreeMap<String, BTreeMap<String, SessionRecord>>);

#[derive(Clone, Debug)]
pub struct SessionRegistry {
    data_dir: PathBuf,
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let path = data_dir.join(SESSIONS_CONFIG_FILE);
        Self { data_dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> SessionsFile {
        let txt = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return SessionsFile::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to read sessions config: {e}");
                return SessionsFile::default();
            }
        };
        match serde_json::from_str(&txt) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "ignoring corrupt sessions config: {e}");
                SessionsFile::default()
            }
        }
    }

    fn save(&self, file: &SessionsFile) -> Result<()> {
        let txt = serde_json::to_string_pretty(file)?;
        atomic_write(&self.path, txt.as_bytes())
    }

    fn update<T>(&self, f: impl FnOnce(&mut SessionsFile) -> T) -> Result<T> {
        let mut file = self.load();
        let out = f(&mut file);
        self.save(&file)?;
        Ok(out)
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.load()
            .0
            .get(key.platform.as_str())
            .and_then(|m| m.get(key.id.as_str()))
            .cloned()
    }

    /// Insert or replace the credentials of a session, keeping its pid hint.
    pub fn upsert(&self, key: &SessionKey, credentials: &SessionCredentials) -> Result<()> {
        self.update(|file| {
            let rec = file
                .0
                .entry(key.platform.as_str().to_string())
                .or_default()
                .entry(key.id.as_str().to_string())
                .or_default();
            rec.credentials = credentials.clone();
            rec.updated_at = Some(iso_timestamp_utc());
        })
    }

    /// Record (or forget) the pid of the worker currently running a session.
    pub fn set_pid(&self, key: &SessionKey, pid: Option<u32>) -> Result<()> {
        self.update(|file| {
            if let Some(rec) = file
                .0
                .get_mut(key.platform.as_str())
                .and_then(|m| m.get_mut(key.id.as_str()))
            {
                rec.pid = pid;
            }
        })
    }

    /// Remove a session's record. Returns whether it existed.
    pub fn remove(&self, key: &SessionKey) -> Result<bool> {
        if self.get(key).is_none() {
            return Ok(false);
        }
        self.update(|file| {
            let platform = key.platform.as_str();
            let removed = file
                .0
                .get_mut(platform)
                .map(|m| m.remove(key.id.as_str()).is_some())
                .unwrap_or(false);
            if file.0.get(platform).is_some_and(|m| m.is_empty()) {
                file.0.remove(platform);
            }
            removed
        })
    }

    /// Valid records, skipping unknown platforms and malformed ids.
    pub fn list(&self) -> Vec<(SessionKey, SessionRecord)> {
        let mut out = Vec::new();
        for (platform, sessions) in self.load().0 {
            let Ok(platform) = platform.parse::<Platform>() else {
                continue;
            };
            for (id, rec) in sessions {
                match SessionId::new(id) {
                    Ok(id) => out.push((SessionKey::new(platform, id), rec)),
                    Err(e) => tracing::warn!("skipping sessions config entry: {e}"),
                }
            }
        }
        out
    }

    /// Find every session with traces in the data directory: registry records,
    /// credential blobs/directories and partial auth facts.
    pub fn discover(&self) -> Result<BTreeMap<SessionKey, SessionRecord>> {
        let mut found: BTreeMap<SessionKey, SessionRecord> = self.list().into_iter().collect();

        let entries = match fs::read_dir(&self.data_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if let Some(key) = parse_artifact_name(&name, is_dir) {
                found.entry(key).or_default();
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{Fact, SignalStore};

    fn key(platform: Platform, id: &str) -> SessionKey {
        SessionKey::new(platform, SessionId::new(id).unwrap())
    }

    fn phone(p: &str) -> SessionCredentials {
        SessionCredentials {
            phone: Some(p.to_string()),
            email: None,
        }
    }

    #[test]
    fn upsert_get_remove_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(dir.path());
        let alice = key(Platform::Telegram, "alice");

        reg.upsert(&alice, &phone("+34600000000")).unwrap();
        reg.set_pid(&alice, Some(4242)).unwrap();
        reg.upsert(&alice, &phone("+34611111111")).unwrap();

        let rec = SessionRegistry::new(dir.path()).get(&alice).unwrap();
        assert_eq!(rec.credentials.phone.as_deref(), Some("+34611111111"));
        assert_eq!(rec.pid, Some(4242));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(reg.path()).unwrap()).unwrap();
        assert_eq!(raw["telegram"]["alice"]["phone"], "+34611111111");

        assert!(reg.remove(&alice).unwrap());
        assert!(!reg.remove(&alice).unwrap());
        assert!(reg.get(&alice).is_none());
        assert!(reg.list().is_empty());
    }

    #[test]
    fn corrupt_config_reads_as_empty_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(dir.path());
        fs::write(reg.path(), "{not json").unwrap();

        assert!(reg.list().is_empty());
        reg.upsert(&key(Platform::WhatsApp, "bob"), &SessionCredentials::default())
            .unwrap();
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn unknown_entries_survive_updates() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(dir.path());
        fs::write(
            reg.path(),
            r#"{"discord": {"main": {}}, "telegram": {"bad/id": {"phone": "1"}}}"#,
        )
        .unwrap();

        reg.upsert(&key(Platform::Telegram, "ok"), &phone("2")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(reg.path()).unwrap()).unwrap();
        assert!(raw["discord"]["main"].is_object());
        assert_eq!(raw["telegram"]["bad/id"]["phone"], "1");
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn discover_finds_artifacts_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(dir.path());
        let store = SignalStore::new(dir.path());

        fs::write(dir.path().join("chatbot_session_carol.session"), b"blob").unwrap();
        fs::create_dir_all(dir.path().join("session-dave")).unwrap();
        store
            .write(&key(Platform::Telegram, "erin"), Fact::NeedsCode, "waiting")
            .unwrap();
        reg.upsert(&key(Platform::Telegram, "frank"), &phone("+1")).unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let found = reg.discover().unwrap();
        let keys: Vec<String> = found.keys().map(|k| k.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "telegram/carol".to_string(),
                "telegram/erin".to_string(),
                "telegram/frank".to_string(),
                "whatsapp/dave".to_string(),
            ]
        );
        assert_eq!(
            found[&key(Platform::Telegram, "frank")]
                .credentials
                .phone
                .as_deref(),
            Some("+1")
        );
    }

    #[test]
    fn discover_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::new(dir.path().join("missing"));
        assert!(reg.discover().unwrap().is_empty());
    }
}
