// Hypervisor seam. One implementation per supported virtualization backend.

pub mod simulated;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::state::SessionState;
use crate::engine::version::Version;

/// Resources requested for a new machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_mb: u64,
    pub execution_cap: u32,
    pub flags: u32,
}

/// Control operations a backend must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmCommand {
    Create(MachineSpec),
    Boot {
        boot_image: PathBuf,
        context_image: PathBuf,
        headful: bool,
    },
    Pause,
    Resume,
    SaveState,
    PowerOff,
    Reset,
    SetExecutionCap(u32),
    Destroy,
}

impl VmCommand {
    pub fn name(&self) -> &'static str {
        match self {
            VmCommand::Create(_) => "create",
            VmCommand::Boot { .. } => "boot",
            VmCommand::Pause => "pause",
            VmCommand::Resume => "resume",
            VmCommand::SaveState => "savestate",
            VmCommand::PowerOff => "poweroff",
            VmCommand::Reset => "reset",
            VmCommand::SetExecutionCap(_) => "executioncap",
            VmCommand::Destroy => "destroy",
        }
    }
}

/// Resource usage or limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub max: Resources,
    pub has_virtualization: bool,
    pub is_ready: bool,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &Version;

    /// Run one control operation against the machine registered as `uuid`.
    async fn execute(&self, uuid: &str, command: VmCommand) -> Result<()>;

    /// Current state as reported by the backend. Unknown machines are `Missing`.
    async fn machine_state(&self, uuid: &str) -> Result<SessionState>;

    /// Names of every running machine, including ones we do not manage.
    async fn running_machines(&self) -> Result<Vec<String>>;

    async fn capabilities(&self) -> Result<Capabilities>;

    /// Host process id backing a running machine, if the backend exposes one.
    async fn machine_pid(&self, _uuid: &str) -> Option<u32> {
        None
    }

    /// Whether the environment still matches what this instance was built for.
    fn validate_integrity(&self) -> bool {
        true
    }
}
