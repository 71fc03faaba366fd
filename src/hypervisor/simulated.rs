use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Capabilities, Hypervisor, MachineSpec, Resources, VmCommand};
use crate::engine::state::SessionState;
use crate::engine::version::Version;

const SIMULATED_PID_BASE: u32 = 40_000;

#[derive(Debug, Clone)]
pub struct SimulatedMachine {
    pub spec: MachineSpec,
    pub state: SessionState,
    pub boot_image: Option<PathBuf>,
    pub context_image: Option<PathBuf>,
    pub boots: u32,
}

/// In-process hypervisor. Machines are plain records; every command
/// succeeds instantly unless a failure was injected with `fail_next`.
pub struct SimulatedHypervisor {
    version: Version,
    limits: Resources,
    machines: Mutex<HashMap<String, SimulatedMachine>>,
    /// Running machines this engine does not manage.
    foreign: Mutex<Vec<String>>,
    fail_next: Mutex<Option<String>>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self {
            version: Version::parse("1.0.0").unwrap_or_default(),
            limits: Resources {
                cpus: 8,
                memory_mb: 16 * 1024,
                disk_mb: 512 * 1024,
            },
            machines: Mutex::new(HashMap::new()),
            foreign: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Make the next command fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    pub fn machine(&self, uuid: &str) -> Option<SimulatedMachine> {
        self.machines.lock().get(uuid).cloned()
    }

    /// Change a machine's state behind the engine's back.
    pub fn set_state(&self, uuid: &str, state: SessionState) {
        if let Some(m) = self.machines.lock().get_mut(uuid) {
            m.state = state;
        }
    }

    pub fn add_foreign_machine(&self, name: &str) {
        self.foreign.lock().push(name.to_string());
    }
}

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_state(m: &SimulatedMachine, allowed: &[SessionState], command: &VmCommand) -> Result<()> {
    if allowed.contains(&m.state) {
        Ok(())
    } else {
        Err(anyhow!("cannot {} a machine in state {}", command.name(), m.state))
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn version(&self) -> &Version {
        &self.version
    }

    async fn execute(&self, uuid: &str, command: VmCommand) -> Result<()> {
        if let Some(msg) = self.fail_next.lock().take() {
            bail!("{}: {}", command.name(), msg);
        }
        debug!("simulated {} on {}", command.name(), uuid);

        let mut machines = self.machines.lock();
        if let VmCommand::Create(spec) = &command {
            machines.entry(uuid.to_string()).or_insert_with(|| SimulatedMachine {
                spec: spec.clone(),
                state: SessionState::PowerOff,
                boot_image: None,
                context_image: None,
                boots: 0,
            });
            return Ok(());
        }
        if let VmCommand::Destroy = command {
            machines.remove(uuid);
            return Ok(());
        }

        let m = machines
            .get_mut(uuid)
            .ok_or_else(|| anyhow!("no machine registered as {}", uuid))?;
        use SessionState::*;
        match &command {
            VmCommand::Boot {
                boot_image,
                context_image,
                ..
            } => {
                expect_state(m, &[PowerOff, Saved], &command)?;
                m.boot_image = Some(boot_image.clone());
                m.context_image = Some(context_image.clone());
                m.boots += 1;
                m.state = Running;
            }
            VmCommand::Pause => {
                expect_state(m, &[Running], &command)?;
                m.state = Paused;
            }
            VmCommand::Resume => {
                expect_state(m, &[Paused], &command)?;
                m.state = Running;
            }
            VmCommand::SaveState => {
                expect_state(m, &[Running], &command)?;
                m.state = Saved;
            }
            VmCommand::PowerOff => {
                expect_state(m, &[Running, Paused, Saved], &command)?;
                m.state = PowerOff;
            }
            VmCommand::Reset => {
                expect_state(m, &[Running], &command)?;
                m.boots += 1;
            }
            VmCommand::SetExecutionCap(cap) => m.spec.execution_cap = *cap,
            VmCommand::Create(_) | VmCommand::Destroy => {}
        }
        Ok(())
    }

    async fn machine_state(&self, uuid: &str) -> Result<SessionState> {
        Ok(self
            .machines
            .lock()
            .get(uuid)
            .map(|m| m.state)
            .unwrap_or(SessionState::Missing))
    }

    async fn running_machines(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .machines
            .lock()
            .values()
            .filter(|m| m.state == SessionState::Running)
            .map(|m| m.spec.name.clone())
            .collect();
        names.extend(self.foreign.lock().iter().cloned());
        names.sort();
        Ok(names)
    }

    async fn machine_pid(&self, uuid: &str) -> Option<u32> {
        let machines = self.machines.lock();
        let m = machines.get(uuid)?;
        (m.state == SessionState::Running).then(|| SIMULATED_PID_BASE + m.boots)
    }

    async fn capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities {
            max: self.limits,
            has_virtualization: true,
            is_ready: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> MachineSpec {
        MachineSpec {
            name: name.to_string(),
            cpus: 1,
            memory_mb: 512,
            disk_mb: 1024,
            execution_cap: 100,
            flags: 0,
        }
    }

    #[tokio::test]
    async fn test_machine_lifecycle() {
        let hv = SimulatedHypervisor::new();
        assert_eq!(hv.machine_state("a").await.unwrap(), SessionState::Missing);

        hv.execute("a", VmCommand::Create(spec("vm-a"))).await.unwrap();
        assert_eq!(hv.machine_state("a").await.unwrap(), SessionState::PowerOff);

        assert!(hv.execute("a", VmCommand::Pause).await.is_err());
        hv.execute(
            "a",
            VmCommand::Boot {
                boot_image: PathBuf::from("/b.iso"),
                context_image: PathBuf::from("/c.iso"),
                headful: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(hv.running_machines().await.unwrap(), vec!["vm-a".to_string()]);

        hv.execute("a", VmCommand::Destroy).await.unwrap();
        assert!(hv.machine("a").is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let hv = SimulatedHypervisor::new();
        hv.fail_next("disk full");
        let err = hv.execute("a", VmCommand::Create(spec("a"))).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        hv.execute("a", VmCommand::Create(spec("a"))).await.unwrap();
    }
}
