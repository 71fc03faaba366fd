// Session registry: owns every known session, their persistence and the daemon reconciliation loop.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provisioner::Provisioner;
use super::session::{Session, SessionEnv};
use super::state::SessionState;
use crate::config::EngineConfig;
use crate::error::{Error, Result, Status};
use crate::hypervisor::{Hypervisor, Resources};
use crate::source::traits::{DownloadBackend, ProgressFn};
use crate::store::parameters::ParameterStore;
use crate::store::persist::open_file_store;

/// Environment variable telling the daemon where session files live.
pub const DAEMON_DATA_ENV: &str = "CVM_SESSION_DATA";

/// Outcome of one `check_daemon_need` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    Started,
    Stopped,
    Unchanged,
}

#[derive(Default)]
struct Sessions {
    by_uuid: HashMap<String, Arc<Session>>,
    open: Vec<Arc<Session>>,
}

pub struct SessionRegistry {
    config: EngineConfig,
    env: RwLock<SessionEnv>,
    sessions: Mutex<Sessions>,
    /// Held for the whole of `session_open` so one uuid never gets two sessions.
    allocation: Mutex<()>,
    next_internal_id: AtomicU32,
    daemon: tokio::sync::Mutex<Option<Child>>,
}

impl SessionRegistry {
    pub fn new(
        config: EngineConfig,
        hypervisor: Arc<dyn Hypervisor>,
        provisioner: Provisioner,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(config.sessions_dir())?;
        let env = SessionEnv {
            hypervisor,
            provisioner,
            data_dir: config.data_dir.clone(),
            download_retries: config.download_retries,
        };
        Ok(Arc::new(Self {
            config,
            env: RwLock::new(env),
            sessions: Mutex::new(Sessions::default()),
            allocation: Mutex::new(()),
            next_internal_id: AtomicU32::new(1),
            daemon: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn hypervisor(&self) -> Arc<dyn Hypervisor> {
        self.env.read().hypervisor.clone()
    }

    fn session_file(&self, uuid: &str) -> PathBuf {
        self.config.sessions_dir().join(format!("{}.json", uuid))
    }

    /// Structural checks on a parameter set before a session is allocated for it.
    pub fn session_validate(&self, parameters: &ParameterStore) -> Result<()> {
        if !parameters.contains("name", true) {
            return Err(Error::NotValidated("name is required".into()));
        }
        if !parameters.contains("secret", true) {
            return Err(Error::NotValidated("secret is required".into()));
        }
        if let Some(uuid) = parameters.get("uuid").filter(|u| !u.is_empty()) {
            Uuid::parse_str(&uuid)
                .map_err(|_| Error::NotValidated(format!("malformed uuid `{}`", uuid)))?;
        }
        for key in ["cpus", "memory", "disk", "flags", "apiPort"] {
            parameters
                .get_num::<u64>(key)
                .map_err(|e| Error::NotValidated(e.to_string()))?;
        }
        let cap: u32 = parameters.get_num_or("executionCap", 100);
        if cap > 100 {
            return Err(Error::NotValidated(format!("executionCap {} out of range", cap)));
        }
        Ok(())
    }

    /// Return the session named by the `uuid` in `parameters`, or allocate and
    /// register a new one. With `check_secret`, an existing session is only
    /// handed out when the secrets match.
    pub fn session_open(
        self: &Arc<Self>,
        parameters: &ParameterStore,
        progress: Option<&ProgressFn>,
        check_secret: bool,
    ) -> Result<Arc<Session>> {
        let report = |step: u64| {
            if let Some(sink) = progress {
                sink(step, 3);
            }
        };

        let _allocation = self.allocation.lock();
        let requested = parameters.get_or("uuid", "");
        if let Some(existing) = self.session_by_uuid(&requested) {
            self.reopen(&existing, parameters, check_secret)?;
            report(3);
            return Ok(existing);
        }

        self.session_validate(parameters)?;
        report(1);

        let uuid = if requested.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            requested
        };
        let store = open_file_store(&self.session_file(&uuid))?;
        {
            let _batch = store.batch();
            store.from_map(parameters.snapshot(), false, true);
            store.set("uuid", uuid.as_str());
        }
        report(2);

        let session = Arc::new(Session::new(
            store,
            self.env.read().clone(),
            Arc::downgrade(self),
        ));
        session.parameters.sync();
        session.set_internal_id(self.next_internal_id.fetch_add(1, Ordering::Relaxed));
        session.add_instance();

        {
            let mut sessions = self.sessions.lock();
            sessions.by_uuid.insert(uuid.clone(), session.clone());
            sessions.open.push(session.clone());
        }
        report(3);
        info!("session {} allocated ({})", uuid, session.name());
        Ok(session)
    }

    fn reopen(
        &self,
        existing: &Arc<Session>,
        parameters: &ParameterStore,
        check_secret: bool,
    ) -> Result<()> {
        let secret = parameters.get_or("secret", "");
        if check_secret && existing.parameters.get_or("secret", "") != secret {
            warn!("session {} open denied: secret mismatch", existing.uuid());
            return Err(Error::PasswordDenied(existing.uuid().to_string()));
        }
        let n = existing.add_instance();
        self.mark_open(existing);
        debug!("session {} reopened (instances={})", existing.uuid(), n);
        Ok(())
    }

    fn mark_open(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        if !sessions.open.iter().any(|s| s.uuid() == session.uuid()) {
            sessions.open.push(session.clone());
        }
    }

    pub(crate) fn forget_open(&self, uuid: &str) {
        self.sessions.lock().open.retain(|s| s.uuid() != uuid);
    }

    /// Remove `session` from the open collection. It stays known by uuid.
    pub fn session_close(&self, session: &Session) {
        self.forget_open(session.uuid());
        debug!("session {} detached", session.uuid());
    }

    /// Destroy the VM if it exists and erase everything persisted for `session`.
    pub async fn session_delete(&self, session: &Arc<Session>) -> Result<Status> {
        if session.state().is_open() {
            session.close(false).await?;
        }
        {
            let mut sessions = self.sessions.lock();
            sessions.by_uuid.remove(session.uuid());
            sessions.open.retain(|s| s.uuid() != session.uuid());
        }

        let file = self.session_file(session.uuid());
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Delete(format!("{}: {}", file.display(), e))),
        }
        let dir = session.data_dir();
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::Delete(format!("{}: {}", dir.display(), e)))?;
        }
        info!("session {} deleted", session.uuid());
        Ok(Status::Ok)
    }

    /// Rebuild the registry from the persisted session files, refreshing
    /// each state from the hypervisor. Returns the number of sessions loaded.
    pub async fn load_sessions(self: &Arc<Self>) -> Result<usize> {
        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(self.config.sessions_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let store = match open_file_store(&path) {
                Ok(store) => store,
                Err(e) => {
                    warn!("skipping unreadable session file {}: {}", path.display(), e);
                    continue;
                }
            };
            let uuid = store.get_or("uuid", "");
            if uuid.is_empty() || self.session_by_uuid(&uuid).is_some() {
                continue;
            }

            let session = Arc::new(Session::new(
                store,
                self.env.read().clone(),
                Arc::downgrade(self),
            ));
            session.set_internal_id(self.next_internal_id.fetch_add(1, Ordering::Relaxed));
            if let Err(e) = session.update(false).await {
                warn!("session {}: state refresh failed: {}", uuid, e);
            }
            if session.state() == SessionState::Missing {
                session.mark_available();
            }
            // A concurrent `session_open` may have registered this uuid meanwhile.
            match self.sessions.lock().by_uuid.entry(uuid) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(session);
                }
            }
            loaded += 1;
        }
        info!("loaded {} persisted sessions", loaded);
        Ok(loaded)
    }

    /// Start the helper daemon when some session asks for daemon control,
    /// stop it when none does. Safe to call repeatedly.
    pub async fn check_daemon_need(&self) -> Result<DaemonAction> {
        let needed = self.sessions.lock().by_uuid.values().any(|s| {
            s.parameters.get_bool("daemonControlled", false) && s.state() != SessionState::Missing
        });

        let mut daemon = self.daemon.lock().await;
        if let Some(child) = daemon.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                warn!("daemon exited on its own ({})", status);
                *daemon = None;
            }
        }

        match (needed, daemon.is_some()) {
            (true, false) => {
                let bin = self
                    .config
                    .daemon_bin_path
                    .as_ref()
                    .ok_or_else(|| Error::NotFound("no daemon binary configured".into()))?;
                let child = Command::new(bin)
                    .env(DAEMON_DATA_ENV, &self.config.data_dir)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| Error::External(format!("cannot start {}: {}", bin.display(), e)))?;
                info!("daemon started (pid={:?})", child.id());
                *daemon = Some(child);
                Ok(DaemonAction::Started)
            }
            (false, true) => {
                if let Some(mut child) = daemon.take() {
                    child
                        .kill()
                        .await
                        .map_err(|e| Error::External(format!("cannot stop daemon: {}", e)))?;
                }
                info!("daemon stopped");
                Ok(DaemonAction::Stopped)
            }
            _ => Ok(DaemonAction::Unchanged),
        }
    }

    /// Stop the daemon regardless of session flags. Returns whether one was running.
    pub async fn stop_daemon(&self) -> Result<bool> {
        match self.daemon.lock().await.take() {
            Some(mut child) => {
                child
                    .kill()
                    .await
                    .map_err(|e| Error::External(format!("cannot stop daemon: {}", e)))?;
                info!("daemon stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn daemon_running(&self) -> bool {
        self.daemon.lock().await.is_some()
    }

    pub fn session_by_uuid(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().by_uuid.get(uuid).cloned()
    }

    pub fn session_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .by_uuid
            .values()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Every known session, open or not.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().by_uuid.values().cloned().collect()
    }

    /// Sessions currently handed out, in open order.
    pub fn open_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().open.clone()
    }

    /// Resources reserved by the open sessions.
    pub fn usage(&self) -> Resources {
        self.open_sessions()
            .iter()
            .fold(Resources::default(), |acc, s| Resources {
                cpus: acc.cpus + s.parameters.get_num_or("cpus", 0u32),
                memory_mb: acc.memory_mb + s.parameters.get_num_or("memory", 0u64),
                disk_mb: acc.disk_mb + s.parameters.get_num_or("disk", 0u64),
            })
    }

    pub async fn running_machines(&self) -> Result<Vec<String>> {
        self.hypervisor()
            .running_machines()
            .await
            .map_err(|e| Error::Query(format!("{:#}", e)))
    }

    /// Abort the transfers of every session.
    pub fn abort(&self) {
        for session in self.sessions() {
            session.abort();
        }
    }

    /// Switch transports. Each session gets its own instance so aborts stay
    /// per-session; sessions created later derive from `backend`.
    pub fn set_download_backend(&self, backend: Arc<dyn DownloadBackend>) {
        {
            let mut env = self.env.write();
            env.provisioner = env.provisioner.with_backend(backend.clone());
        }
        for session in self.sessions() {
            session.set_download_backend(backend.clone_backend());
        }
    }
}
