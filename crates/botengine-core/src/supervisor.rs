//! One worker process per (platform, session): start, stop, restart, clear,
//! discover.

use std::{collections::BTreeMap, ffi::OsString, fs::OpenOptions, path::PathBuf, process::Stdio, sync::Arc};

use tokio::{process::Child, process::Command, sync::Mutex};

use crate::{
    config::{
        PanelConfig, ENV_API_HASH, ENV_API_ID, ENV_DATA_PATH, ENV_OPENAI_API_KEY,
        ENV_PHONE_NUMBER, ENV_QR_EMAIL, ENV_SESSION_ID, ENV_WHATSAPP_BRIDGE, ENV_WORKER_PLATFORM,
    },
    domain::{Platform, SessionCredentials, SessionKey},
    errors::Error,
    process,
    registry::SessionRegistry,
    signals::SignalStore,
    utils::{remove_dir_if_exists, remove_file_if_exists},
    Result,
};

/// Liveness of a session's worker as seen by the supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Known, but no worker launched (or it was stopped).
    Stopped,
    Running { pid: u32 },
    /// A worker was launched and is gone without being stopped.
    Exited { pid: u32, code: Option<i32> },
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running { .. })
    }
}

/// A known session plus the liveness of its worker.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub key: SessionKey,
    pub credentials: SessionCredentials,
    pub liveness: Liveness,
}

enum Worker {
    /// Spawned by this supervisor.
    Owned(Child),
    /// Found alive at discovery; only the pid is known.
    Adopted(u32),
    /// Gone on its own; kept so the view can report the failure.
    Exited { pid: u32, code: Option<i32> },
}

impl Worker {
    fn pid(&self) -> Option<u32> {
        match self {
            Worker::Owned(child) => child.id(),
            Worker::Adopted(pid) => Some(*pid),
            Worker::Exited { .. } => None,
        }
    }

    /// Refresh and report liveness, reaping an owned child that exited.
    fn poll(&mut self) -> Liveness {
        match self {
            Worker::Owned(child) => {
                let pid = child.id().unwrap_or_default();
                match child.try_wait() {
                    Ok(None) => Liveness::Running { pid },
                    Ok(Some(status)) => {
                        let code = status.code();
                        *self = Worker::Exited { pid, code };
                        Liveness::Exited { pid, code }
                    }
                    Err(e) => {
                        tracing::warn!(pid, "failed to poll worker: {e}");
                        Liveness::Running { pid }
                    }
                }
            }
            Worker::Adopted(pid) => {
                let pid = *pid;
                if process::is_alive(pid) {
                    Liveness::Running { pid }
                } else {
                    *self = Worker::Exited { pid, code: None };
                    Liveness::Exited { pid, code: None }
                }
            }
            Worker::Exited { pid, code } => Liveness::Exited {
                pid: *pid,
                code: *code,
            },
        }
    }

    /// Kill the worker and its process group. Returns whether anything was
    /// still running.
    async fn terminate(&mut self) -> Result<bool> {
        match self {
            Worker::Owned(child) => {
                // If it's already exited, `try_wait` reaps it.
                if child.try_wait()?.is_some() {
                    return Ok(false);
                }
                let Some(pid) = child.id() else {
                    return Ok(false);
                };
                let killed = process::kill_tree(pid)?;
                child.wait().await?;
                Ok(killed)
            }
            Worker::Adopted(pid) => process::kill_tree(*pid),
            Worker::Exited { .. } => Ok(false),
        }
    }
}

struct Tracked {
    credentials: SessionCredentials,
    worker: Option<Worker>,
}

impl Tracked {
    fn liveness(&mut self) -> Liveness {
        match self.worker.as_mut() {
            Some(w) => w.poll(),
            None => Liveness::Stopped,
        }
    }
}

/// Spawns, tracks and terminates session workers.
pub struct WorkerSupervisor {
    cfg: Arc<PanelConfig>,
    store: SignalStore,
    registry: SessionRegistry,
    sessions: Mutex<BTreeMap<SessionKey, Tracked>>,
}

impl WorkerSupervisor {
    pub fn new(cfg: Arc<PanelConfig>) -> Self {
        let store = SignalStore::new(&cfg.data_dir);
        let registry = SessionRegistry::new(&cfg.data_dir);
        Self {
            cfg,
            store,
            registry,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Where a session's worker writes its logs.
    pub fn worker_log_path(&self, key: &SessionKey) -> PathBuf {
        self.cfg
            .data_dir
            .join(format!("{}_worker_{}.log", key.platform, key.id))
    }

    /// Launch a worker for `key`, stopping any worker already tracked for it.
    ///
    /// Auth facts are left alone; the credential record is upserted.
    pub async fn start(&self, key: &SessionKey, credentials: SessionCredentials) -> Result<u32> {
        let session_env = self.session_env(key, &credentials)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(prev) = sessions.get_mut(key).and_then(|t| t.worker.as_mut()) {
            match prev.terminate().await {
                Ok(true) => tracing::info!(session = %key, "stopped previous worker before restart"),
                Ok(false) => {}
                Err(e) => tracing::warn!(session = %key, "failed to stop previous worker: {e}"),
            }
        }

        let child = self.spawn_worker(key, session_env)?;
        let pid = child.id().ok_or_else(|| Error::Process {
            pid: 0,
            reason: "worker exited before its pid was read".to_string(),
        })?;
        tracing::info!(session = %key, pid, "worker started");

        sessions.insert(
            key.clone(),
            Tracked {
                credentials: credentials.clone(),
                worker: Some(Worker::Owned(child)),
            },
        );

        self.registry.upsert(key, &credentials)?;
        self.registry.set_pid(key, Some(pid))?;
        Ok(pid)
    }

    /// Start again with the credentials last used for `key`.
    pub async fn restart(&self, key: &SessionKey) -> Result<u32> {
        let tracked = self
            .sessions
            .lock()
            .await
            .get(key)
            .map(|t| t.credentials.clone());
        let credentials = match tracked {
            Some(c) => c,
            None => self
                .registry
                .get(key)
                .map(|r| r.credentials)
                .ok_or_else(|| Error::InvalidSession {
                    id: key.id.to_string(),
                    reason: format!("no {} session with this id", key.platform),
                })?,
        };
        self.start(key, credentials).await
    }

    /// Kill the session's worker (and its descendants). Durable facts stay.
    ///
    /// Returns whether a worker was still running. A kill that fails is logged
    /// and the worker forgotten all the same.
    pub async fn stop(&self, key: &SessionKey) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let Some(tracked) = sessions.get_mut(key) else {
            return Ok(false);
        };
        let killed = match tracked.worker.as_mut() {
            Some(w) => terminate_logged(w, key).await,
            None => false,
        };
        tracked.worker = None;
        drop(sessions);

        self.registry.set_pid(key, None)?;
        if killed {
            tracing::info!(session = %key, "worker stopped");
        }
        Ok(killed)
    }

    /// Stop, then delete every artifact of the session and forget it.
    pub async fn clear(&self, key: &SessionKey) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(w) = sessions.get_mut(key).and_then(|t| t.worker.as_mut()) {
            terminate_logged(w, key).await;
        }
        sessions.remove(key);

        for path in self.store.session_files(key) {
            remove_file_if_exists(&path)?;
        }
        for dir in self.store.session_dirs(key) {
            remove_dir_if_exists(&dir)?;
        }
        remove_file_if_exists(&self.worker_log_path(key))?;
        self.registry.remove(key)?;

        tracing::info!(session = %key, "session cleared");
        Ok(())
    }

    /// Register sessions found on disk that are not tracked yet. A recorded
    /// pid is adopted as running only while it is alive and was launched as
    /// this session's worker; otherwise the stale pid is dropped.
    ///
    /// Returns the newly registered sessions.
    pub async fn discover(&self) -> Result<Vec<SessionKey>> {
        let found = self.registry.discover()?;
        let mut sessions = self.sessions.lock().await;
        let mut added = Vec::new();

        for (key, record) in found {
            if sessions.contains_key(&key) {
                continue;
            }
            let worker = match record.pid {
                Some(pid) if process::is_alive(pid) && self.launched_for(pid, &key) => {
                    tracing::info!(session = %key, pid, "adopted running worker");
                    Some(Worker::Adopted(pid))
                }
                Some(pid) => {
                    if process::is_alive(pid) {
                        tracing::warn!(
                            session = %key,
                            pid,
                            "recorded pid is not this session's worker; not adopting"
                        );
                    }
                    if let Err(e) = self.registry.set_pid(&key, None) {
                        tracing::warn!(session = %key, "failed to drop stale pid: {e}");
                    }
                    None
                }
                None => None,
            };
            sessions.insert(
                key.clone(),
                Tracked {
                    credentials: record.credentials,
                    worker,
                },
            );
            added.push(key);
        }
        Ok(added)
    }

    pub async fn is_known(&self, key: &SessionKey) -> bool {
        self.sessions.lock().await.contains_key(key)
    }

    pub async fn is_running(&self, key: &SessionKey) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions
            .get_mut(key)
            .map(|t| t.liveness().is_running())
            .unwrap_or(false)
    }

    pub async fn pid(&self, key: &SessionKey) -> Option<u32> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(key)
            .and_then(|t| t.worker.as_ref())
            .and_then(|w| w.pid())
    }

    /// Status of every known session, ordered by platform then id.
    pub async fn snapshot(&self) -> Vec<SessionStatus> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .iter_mut()
            .map(|(key, tracked)| SessionStatus {
                key: key.clone(),
                credentials: tracked.credentials.clone(),
                liveness: tracked.liveness(),
            })
            .collect()
    }

    /// Kill every running worker (panel shutdown).
    pub async fn stop_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.lock().await.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.stop(&key).await {
                tracing::warn!(session = %key, "failed to stop worker: {e}");
            }
        }
    }

    /// Data directory as handed to workers. They run inside it, so it must not
    /// be relative.
    fn worker_data_path(&self) -> Result<PathBuf> {
        Ok(std::path::absolute(&self.cfg.data_dir)?)
    }

    /// Whether `pid` carries the identity this supervisor gives `key`'s worker.
    fn launched_for(&self, pid: u32, key: &SessionKey) -> bool {
        let Ok(data_path) = self.worker_data_path() else {
            return false;
        };
        let data_path = data_path.display().to_string();
        process::launched_with(
            pid,
            &[
                (ENV_SESSION_ID, key.id.as_str()),
                (ENV_DATA_PATH, data_path.as_str()),
                (ENV_WORKER_PLATFORM, key.platform.as_str()),
            ],
        )
    }

    /// This session's identifiers and secrets, after checking the platform's
    /// required values are present.
    fn session_env(
        &self,
        key: &SessionKey,
        credentials: &SessionCredentials,
    ) -> Result<Vec<(&'static str, String)>> {
        let openai = self
            .cfg
            .openai_api_key
            .clone()
            .ok_or_else(|| Error::Config(format!("{ENV_OPENAI_API_KEY} is not set")))?;

        let mut env = vec![
            (ENV_SESSION_ID, key.id.to_string()),
            (ENV_DATA_PATH, self.worker_data_path()?.display().to_string()),
            (ENV_WORKER_PLATFORM, key.platform.as_str().to_string()),
            (ENV_OPENAI_API_KEY, openai),
        ];

        match key.platform {
            Platform::Telegram => {
                let phone = credentials
                    .phone
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| Error::Config("a phone number is required for Telegram".to_string()))?;
                let api_id = self
                    .cfg
                    .telegram_api_id
                    .clone()
                    .ok_or_else(|| Error::Config(format!("{ENV_API_ID} is not set")))?;
                let api_hash = self
                    .cfg
                    .telegram_api_hash
                    .clone()
                    .ok_or_else(|| Error::Config(format!("{ENV_API_HASH} is not set")))?;
                env.push((ENV_PHONE_NUMBER, phone));
                env.push((ENV_API_ID, api_id));
                env.push((ENV_API_HASH, api_hash));
            }
            Platform::WhatsApp => {
                env.push((ENV_WHATSAPP_BRIDGE, self.cfg.whatsapp_bridge.clone()));
                if let Some(email) = credentials.email.clone().filter(|e| !e.trim().is_empty()) {
                    env.push((ENV_QR_EMAIL, email));
                }
            }
        }
        Ok(env)
    }

    fn spawn_worker(&self, key: &SessionKey, session_env: Vec<(&'static str, String)>) -> Result<Child> {
        let launch = self.cfg.worker_command(key.platform);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.worker_log_path(key))?;

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&self.cfg.data_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        for name in &self.cfg.passthrough_env {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        for (name, value) in session_env {
            cmd.env(name, OsString::from(value));
        }

        // Own process group, so stop can take down helper processes too.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| {
            Error::Config(format!(
                "failed to launch worker {}: {e}",
                launch.program.display()
            ))
        })
    }
}

/// Terminate, reporting failure instead of propagating it.
async fn terminate_logged(worker: &mut Worker, key: &SessionKey) -> bool {
    match worker.terminate().await {
        Ok(killed) => killed,
        Err(e) => {
            tracing::warn!(session = %key, "failed to terminate worker: {e}");
            false
        }
    }
}
