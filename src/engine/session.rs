// Session state machine: one managed VM, its persisted parameters and its lifecycle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::provisioner::{Provisioner, LATEST};
use super::registry::SessionRegistry;
use super::state::{SessionFlags, SessionState};
use crate::config::{
    DEFAULT_API_PORT, DEFAULT_CERNVM_FLAVOR, DEFAULT_CERNVM_VERSION, RDP_BASE_PORT,
};
use crate::error::{Error, Result, Status};
use crate::hypervisor::{Hypervisor, MachineSpec, VmCommand};
use crate::image::context_iso::build_context_image;
use crate::source::traits::{DownloadBackend, ProgressFn};
use crate::store::parameters::ParameterStore;

/// `extra_info` key for the guest video mode.
pub const EXTRA_VIDEO_MODE: i32 = 1;

const CONTEXT_IMAGE_NAME: &str = "context.iso";

/// Liveness probe used by `is_api_alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Connect only.
    None,
    /// Connect and send a space and a newline.
    Simple,
    /// `GET /` and wait for a response.
    Http,
}

/// Collaborators every session of one registry shares.
#[derive(Clone)]
pub struct SessionEnv {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub provisioner: Provisioner,
    pub data_dir: PathBuf,
    pub download_retries: u32,
}

/// Replace `${name}` placeholders with values from `vars`. Unknown names
/// expand to an empty string; an unterminated `${` is kept as is.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                if let Some(value) = vars.get(&after[..end]) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn seed_defaults(p: &ParameterStore) {
    p.set_default("initialized", "0");
    p.set_default("cpus", "1");
    p.set_default("memory", "512");
    p.set_default("disk", "1024");
    p.set_default("executionCap", "100");
    p.set_default("apiPort", DEFAULT_API_PORT.to_string());
    p.set_default("flags", "0");
    p.set_default("daemonControlled", "0");
    p.set_default("daemonMinCap", "0");
    p.set_default("daemonMaxCap", "0");
    p.set_default("daemonFlags", "0");
    p.set_default("uuid", "");
    p.set_default("ip", "");
    p.set_default("secret", "");
    p.set_default("name", "");
    p.set_default("diskURL", "");
    p.set_default("diskChecksum", "");
    p.set_default("cernvmVersion", DEFAULT_CERNVM_VERSION);
    p.set_default("cernvmFlavor", DEFAULT_CERNVM_FLAVOR);
    p.set_default("state", "0");
}

fn control_error(e: anyhow::Error) -> Error {
    Error::Control(format!("{:#}", e))
}

/// Marks a lifecycle operation as running for `wait()` and `update(true)`.
struct InFlight<'a> {
    count: &'a AtomicUsize,
    idle: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct Session {
    uuid: String,
    state: RwLock<SessionState>,
    pub parameters: Arc<ParameterStore>,
    pub user_data: Arc<ParameterStore>,
    pub local: Arc<ParameterStore>,
    pub machine: Arc<ParameterStore>,
    pub properties: Arc<ParameterStore>,
    pid: AtomicU32,
    internal_id: AtomicU32,
    instances: AtomicU32,
    download_backend: RwLock<Arc<dyn DownloadBackend>>,
    env: SessionEnv,
    registry: Weak<SessionRegistry>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap a parameter tree whose `uuid` is already set. Missing required
    /// fields are seeded with defaults; the last persisted state is restored.
    pub fn new(
        parameters: Arc<ParameterStore>,
        env: SessionEnv,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        seed_defaults(&parameters);
        let uuid = parameters.get_or("uuid", "");
        let state = SessionState::from_code(parameters.get_num_or("state", 0));
        let backend = env.provisioner.backend().clone_backend();

        Self {
            uuid,
            state: RwLock::new(state),
            user_data: parameters.subgroup("user-data"),
            local: parameters.subgroup("local"),
            machine: parameters.subgroup("machine"),
            properties: parameters.subgroup("properties"),
            parameters,
            pid: AtomicU32::new(0),
            internal_id: AtomicU32::new(0),
            instances: AtomicU32::new(0),
            download_backend: RwLock::new(backend),
            env,
            registry,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> String {
        self.parameters.get_or("name", "")
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn flags(&self) -> SessionFlags {
        SessionFlags(self.parameters.get_num_or("flags", 0u32))
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn internal_id(&self) -> u32 {
        self.internal_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_internal_id(&self, id: u32) {
        self.internal_id.store(id, Ordering::Relaxed);
    }

    /// Number of times this session was handed out by the registry.
    pub fn instances(&self) -> u32 {
        self.instances.load(Ordering::Relaxed)
    }

    pub(crate) fn add_instance(&self) -> u32 {
        self.instances.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn download_backend(&self) -> Arc<dyn DownloadBackend> {
        self.download_backend.read().clone()
    }

    pub fn set_download_backend(&self, backend: Arc<dyn DownloadBackend>) {
        *self.download_backend.write() = backend;
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        self.parameters.set_num("state", state.code());
        if previous != state {
            info!("session {} {} -> {}", self.uuid, previous, state);
        }
    }

    fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            count: &self.in_flight,
            idle: &self.idle,
        }
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<SessionState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            debug!("session {}: {} rejected in state {}", self.uuid, operation, state);
            Err(Error::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    fn machine_spec(&self) -> MachineSpec {
        let name = self.name();
        MachineSpec {
            name: if name.is_empty() { self.uuid.clone() } else { name },
            cpus: self.parameters.get_num_or("cpus", 1),
            memory_mb: self.parameters.get_num_or("memory", 512),
            disk_mb: self.parameters.get_num_or("disk", 1024),
            execution_cap: self.parameters.get_num_or("executionCap", 100),
            flags: self.flags().0,
        }
    }

    async fn control(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
        command: VmCommand,
        to: SessionState,
    ) -> Result<Status> {
        let _op = self.begin();
        self.require(operation, allowed)?;
        self.env
            .hypervisor
            .execute(&self.uuid, command)
            .await
            .map_err(control_error)?;
        self.set_state(to);
        Ok(Status::Ok)
    }

    /// Create the VM. Already-open sessions report `AlreadyExists`.
    pub async fn open(&self) -> Result<Status> {
        let _op = self.begin();
        if self.state().is_open() {
            return Ok(Status::AlreadyExists);
        }
        self.env
            .hypervisor
            .execute(&self.uuid, VmCommand::Create(self.machine_spec()))
            .await
            .map_err(|e| Error::Create(format!("{:#}", e)))?;
        self.parameters.set("initialized", "1");
        if self.flags().contains(SessionFlags::GRAPHICAL) {
            let port = RDP_BASE_PORT.saturating_add(self.internal_id() as u16);
            self.local.set_num("rdpPort", port);
        }
        self.set_state(SessionState::PowerOff);
        Ok(Status::Ok)
    }

    /// Provision the boot medium, build the context image from `user_data`
    /// and boot.
    pub async fn start(
        &self,
        user_data: &BTreeMap<String, String>,
        progress: Option<&ProgressFn>,
    ) -> Result<Status> {
        let _op = self.begin();
        let from = self.require("start", &[SessionState::PowerOff, SessionState::Saved])?;

        self.user_data.from_map(user_data.iter(), false, true);

        let resumable = from == SessionState::Saved
            && self.local.get("bootImage").map(PathBuf::from).is_some_and(|p| p.is_file())
            && self.local.get("contextImage").map(PathBuf::from).is_some_and(|p| p.is_file());
        let (boot_image, context_image) = if resumable {
            (
                PathBuf::from(self.local.get_or("bootImage", "")),
                PathBuf::from(self.local.get_or("contextImage", "")),
            )
        } else {
            let boot = self.provision_boot_medium(progress).await?;
            self.local.set("bootImage", boot.to_string_lossy());
            let context = self.write_context_image().await?;
            (boot, context)
        };

        let headful = self.flags().contains(SessionFlags::HEADFUL);
        self.env
            .hypervisor
            .execute(
                &self.uuid,
                VmCommand::Boot {
                    boot_image,
                    context_image,
                    headful,
                },
            )
            .await
            .map_err(control_error)?;

        if let Some(pid) = self.env.hypervisor.machine_pid(&self.uuid).await {
            self.pid.store(pid, Ordering::Relaxed);
        }
        self.set_state(SessionState::Running);
        Ok(Status::Ok)
    }

    async fn provision_boot_medium(&self, progress: Option<&ProgressFn>) -> Result<PathBuf> {
        let flags = self.flags();
        let disk_url = self.parameters.get_or("diskURL", "");
        let retries = self.env.download_retries;
        let provisioner = self.env.provisioner.with_backend(self.download_backend());

        if flags.contains(SessionFlags::DEPLOYMENT_HDD_LOCAL)
            || flags.contains(SessionFlags::DEPLOYMENT_ISO_LOCAL)
        {
            let path = PathBuf::from(&disk_url);
            if !path.is_file() {
                return Err(Error::NotFound(format!("local disk {}", disk_url)));
            }
            return Ok(path);
        }

        if flags.contains(SessionFlags::DEPLOYMENT_HDD) {
            if disk_url.is_empty() {
                return Err(Error::Usage("diskURL is required for disk deployment".into()));
            }
            let checksum = self.parameters.get_or("diskChecksum", "");
            info!("session {} provisioning disk {}", self.uuid, disk_url);
            return if disk_url.ends_with(".gz") {
                provisioner
                    .download_file_gz(&disk_url, &checksum, retries, progress)
                    .await
            } else {
                provisioner
                    .download_file(&disk_url, &checksum, retries, progress)
                    .await
            };
        }

        let mut version = self.parameters.get_or("cernvmVersion", DEFAULT_CERNVM_VERSION);
        let flavor = self.parameters.get_or("cernvmFlavor", DEFAULT_CERNVM_FLAVOR);
        if version != LATEST {
            match provisioner.cernvm_cached(&version) {
                Ok(path) => return Ok(path),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("session {} provisioning CernVM {} ({})", self.uuid, version, flavor);
        let path = provisioner
            .cernvm_download(&mut version, &flavor, flags.arch(), retries, progress)
            .await?;
        self.parameters.set("cernvmVersion", version);
        Ok(path)
    }

    async fn write_context_image(&self) -> Result<PathBuf> {
        let template = self.parameters.get_or("userData", "");
        let rendered = render_template(&template, &self.user_data.to_map());
        let image = build_context_image(rendered.as_bytes());

        let dir = self.env.data_dir.join(&self.uuid);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(CONTEXT_IMAGE_NAME);
        tokio::fs::write(&path, &image).await?;
        self.local.set("contextImage", path.to_string_lossy());
        debug!("session {} context image at {}", self.uuid, path.display());
        Ok(path)
    }

    pub async fn pause(&self) -> Result<Status> {
        self.control("pause", &[SessionState::Running], VmCommand::Pause, SessionState::Paused)
            .await
    }

    pub async fn resume(&self) -> Result<Status> {
        self.control("resume", &[SessionState::Paused], VmCommand::Resume, SessionState::Running)
            .await
    }

    /// Save the VM memory to disk and power off.
    pub async fn hibernate(&self) -> Result<Status> {
        self.control(
            "hibernate",
            &[SessionState::Running],
            VmCommand::SaveState,
            SessionState::Saved,
        )
        .await
    }

    pub async fn stop(&self) -> Result<Status> {
        let result = self
            .control(
                "stop",
                &[SessionState::Running, SessionState::Paused, SessionState::Saved],
                VmCommand::PowerOff,
                SessionState::PowerOff,
            )
            .await;
        if result.is_ok() {
            self.pid.store(0, Ordering::Relaxed);
        }
        result
    }

    /// Cold reboot.
    pub async fn reset(&self) -> Result<Status> {
        self.control("reset", &[SessionState::Running], VmCommand::Reset, SessionState::Running)
            .await
    }

    /// Detach from the registry. Unless `unmonitored`, the VM is powered off
    /// and destroyed first; otherwise it is left running.
    pub async fn close(&self, unmonitored: bool) -> Result<Status> {
        let _op = self.begin();
        let state = self.state();
        if !unmonitored && state.is_open() {
            if matches!(state, SessionState::Running | SessionState::Paused) {
                self.env
                    .hypervisor
                    .execute(&self.uuid, VmCommand::PowerOff)
                    .await
                    .map_err(control_error)?;
            }
            self.env
                .hypervisor
                .execute(&self.uuid, VmCommand::Destroy)
                .await
                .map_err(|e| Error::Delete(format!("{:#}", e)))?;
        } else if unmonitored && state.is_open() {
            warn!("session {} closed unmonitored, VM left {}", self.uuid, state);
        }

        self.pid.store(0, Ordering::Relaxed);
        self.set_state(SessionState::Missing);
        if let Some(registry) = self.registry.upgrade() {
            registry.forget_open(&self.uuid);
        }
        Ok(Status::Ok)
    }

    /// Re-sample the state from the hypervisor, optionally after the
    /// running operation finishes.
    pub async fn update(&self, wait_till_inactive: bool) -> Result<Status> {
        if wait_till_inactive {
            self.wait().await;
        }
        let reported = self
            .env
            .hypervisor
            .machine_state(&self.uuid)
            .await
            .map_err(|e| Error::Query(format!("{:#}", e)))?;

        // A configured session without a VM stays AVAILABLE.
        let state = if reported == SessionState::Missing && self.state() == SessionState::Available {
            SessionState::Available
        } else {
            reported
        };
        if state != self.state() {
            self.set_state(state);
        }
        let pid = match state {
            SessionState::Running => self.env.hypervisor.machine_pid(&self.uuid).await.unwrap_or(0),
            _ => 0,
        };
        self.pid.store(pid, Ordering::Relaxed);
        Ok(Status::Ok)
    }

    /// Mark a restored session whose VM no longer exists as configured but absent.
    pub(crate) fn mark_available(&self) {
        self.set_state(SessionState::Available);
    }

    /// Ask the transfer running on this session's backend to stop.
    pub fn abort(&self) {
        debug!("session {} abort requested", self.uuid);
        self.download_backend().abort();
    }

    /// Resolve once no lifecycle operation is running on this session.
    pub async fn wait(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Throttle the VM to `cap` percent of a host CPU.
    pub async fn set_execution_cap(&self, cap: u32) -> Result<Status> {
        if cap > 100 {
            return Err(Error::Usage(format!("execution cap {} out of range", cap)));
        }
        let _op = self.begin();
        if self.state().is_open() {
            self.env
                .hypervisor
                .execute(&self.uuid, VmCommand::SetExecutionCap(cap))
                .await
                .map_err(|e| Error::Modify(format!("{:#}", e)))?;
        }
        self.parameters.set_num("executionCap", cap);
        Ok(Status::Ok)
    }

    pub fn set_property(&self, name: &str, value: &str) -> Status {
        self.properties.set(name, value);
        Status::Ok
    }

    pub fn get_property(&self, name: &str) -> String {
        self.properties.get_or(name, "")
    }

    /// Address the guest API is reachable on.
    pub fn api_host(&self) -> String {
        let ip = self.parameters.get_or("ip", "");
        if ip.is_empty() {
            "127.0.0.1".to_string()
        } else {
            ip
        }
    }

    pub fn api_port(&self) -> u16 {
        self.parameters.get_num_or("apiPort", DEFAULT_API_PORT)
    }

    /// `host:port` of the remote display, empty when none is exposed.
    pub fn rdp_address(&self) -> String {
        match self.local.get_num_or::<u16>("rdpPort", 0) {
            0 => String::new(),
            port => format!("127.0.0.1:{}", port),
        }
    }

    pub fn extra_info(&self, kind: i32) -> String {
        match kind {
            EXTRA_VIDEO_MODE => self.machine.get_or("videoMode", ""),
            _ => String::new(),
        }
    }

    /// Probe the guest API endpoint. Never changes the session state.
    pub async fn is_api_alive(&self, handshake: Handshake, timeout: Duration) -> bool {
        let addr = format!("{}:{}", self.api_host(), self.api_port());
        let probe = match handshake {
            Handshake::None => tokio::time::timeout(timeout, TcpStream::connect(&addr))
                .await
                .map(|r| r.is_ok()),
            Handshake::Simple => tokio::time::timeout(timeout, async {
                let mut stream = TcpStream::connect(&addr).await?;
                stream.write_all(b" \n").await?;
                stream.flush().await
            })
            .await
            .map(|r| r.is_ok()),
            Handshake::Http => {
                let url = format!("http://{}/", addr);
                tokio::time::timeout(timeout, reqwest::Client::new().get(&url).send())
                    .await
                    .map(|r| r.is_ok())
            }
        };
        let alive = probe.unwrap_or(false);
        debug!("session {} api {} alive={} ({:?})", self.uuid, addr, alive, handshake);
        alive
    }

    /// Where this session keeps its generated files.
    pub fn data_dir(&self) -> PathBuf {
        self.env.data_dir.join(&self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let mut vars = BTreeMap::new();
        vars.insert("user".to_string(), "alice".to_string());
        vars.insert("port".to_string(), "8080".to_string());

        assert_eq!(
            render_template("name=${user} port=${port}", &vars),
            "name=alice port=8080"
        );
        assert_eq!(render_template("x=${missing};", &vars), "x=;");
        assert_eq!(render_template("open ${user", &vars), "open ${user");
        assert_eq!(render_template("no macros", &vars), "no macros");
    }

    #[test]
    fn test_defaults_are_seeded_without_commit() {
        let p = ParameterStore::new();
        seed_defaults(&p);
        assert_eq!(p.get_or("cpus", ""), "1");
        assert_eq!(p.get_or("cernvmVersion", ""), "latest");
        assert_eq!(p.get_or("cernvmFlavor", ""), "prod");
        assert_eq!(p.commit_count(), 0);
    }
}
