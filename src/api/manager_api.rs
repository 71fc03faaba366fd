use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::simple::init_logging;
use crate::config::EngineConfig;
use crate::engine::provisioner::Provisioner;
use crate::engine::registry::SessionRegistry;
use crate::engine::session::Session;
use crate::engine::stats::ProvisionSnapshot;
use crate::error::{Error, Result, Status};
use crate::hypervisor::Hypervisor;
use crate::source::http_source::HttpSource;
use crate::source::traits::DownloadBackend;
use crate::store::parameters::ParameterStore;

/// Entry point bundling transport, provisioning and the session registry.
pub struct Manager {
    registry: Arc<SessionRegistry>,
    provisioner: Provisioner,
}

impl Manager {
    /// Initialize logging, build the HTTP transport and restore persisted sessions.
    pub async fn init(config: EngineConfig, hypervisor: Arc<dyn Hypervisor>) -> Result<Self> {
        init_logging();
        Self::with_backend(config, hypervisor, Arc::new(HttpSource::new())).await
    }

    pub async fn with_backend(
        config: EngineConfig,
        hypervisor: Arc<dyn Hypervisor>,
        backend: Arc<dyn DownloadBackend>,
    ) -> Result<Self> {
        let provisioner = Provisioner::new(backend, &config.cache_dir, &config.release_url)?;
        let registry = SessionRegistry::new(config, hypervisor.clone(), provisioner.clone())?;
        let loaded = registry.load_sessions().await?;
        info!(
            "manager ready on {} {} ({} sessions restored)",
            hypervisor.name(),
            hypervisor.version(),
            loaded
        );
        Ok(Self {
            registry,
            provisioner,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Open (or reattach to) a session described by a JSON object.
    pub fn open_session(&self, parameters: &Value, check_secret: bool) -> Result<Arc<Session>> {
        let store = ParameterStore::new();
        store.from_json(parameters, false, true)?;
        self.registry.session_open(&store, None, check_secret)
    }

    /// Close the session `uuid`, destroying its VM unless `unmonitored`.
    pub async fn close_session(&self, uuid: &str, unmonitored: bool) -> Result<Status> {
        let session = self
            .registry
            .session_by_uuid(uuid)
            .ok_or_else(|| Error::NotFound(format!("session {}", uuid)))?;
        session.close(unmonitored).await
    }

    pub fn provision_stats(&self) -> ProvisionSnapshot {
        self.provisioner.stats()
    }

    /// Abort every transfer, wait for running operations, flush every
    /// session to disk and stop the daemon.
    pub async fn dispose(&self) -> Result<()> {
        self.registry.abort();
        self.provisioner.backend().abort_all();
        for session in self.registry.sessions() {
            session.wait().await;
            session.parameters.sync();
        }
        self.registry.stop_daemon().await?;
        info!("manager disposed");
        Ok(())
    }
}
