mod common;

use std::sync::Arc;

use serde_json::json;

use common::{MemoryBackend, RELEASE_URL};
use cvm_session_engine::api::manager_api::Manager;
use cvm_session_engine::config::EngineConfig;
use cvm_session_engine::engine::state::SessionState;
use cvm_session_engine::error::{Error, Status};
use cvm_session_engine::hypervisor::simulated::SimulatedHypervisor;
use cvm_session_engine::hypervisor::Hypervisor;
use cvm_session_engine::source::traits::DownloadBackend;

async fn manager(config: &EngineConfig, hv: &Arc<SimulatedHypervisor>) -> Manager {
    let hypervisor: Arc<dyn Hypervisor> = hv.clone();
    let backend: Arc<dyn DownloadBackend> = MemoryBackend::new();
    Manager::with_backend(config.clone(), hypervisor, backend)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_open_close_dispose() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::rooted_at(dir.path());
    config.release_url = RELEASE_URL.to_string();
    let hv = Arc::new(SimulatedHypervisor::new());

    let m = manager(&config, &hv).await;
    let session = m
        .open_session(
            &json!({
                "name": "m1",
                "secret": "x",
                "cpus": 2,
                "user-data": { "user": "bob" },
                "ignored": [1, 2, 3]
            }),
            true,
        )
        .unwrap();
    assert_eq!(session.parameters.get_or("cpus", ""), "2");
    assert_eq!(session.user_data.get_or("user", ""), "bob");
    assert!(!session.parameters.contains("ignored", false));

    session.open().await.unwrap();
    let uuid = session.uuid().to_string();
    assert_eq!(m.close_session(&uuid, false).await.unwrap(), Status::Ok);
    assert_eq!(session.state(), SessionState::Missing);
    assert!(matches!(
        m.close_session("no-such-session", false).await,
        Err(Error::NotFound(_))
    ));
    m.dispose().await.unwrap();

    let reopened = manager(&config, &hv).await;
    let restored = reopened.registry().session_by_uuid(&uuid).unwrap();
    assert_eq!(restored.name(), "m1");
    assert_eq!(restored.state(), SessionState::Available);
}

#[tokio::test]
async fn test_non_object_parameters_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(SimulatedHypervisor::new());
    let m = manager(&EngineConfig::rooted_at(dir.path()), &hv).await;

    assert!(matches!(
        m.open_session(&json!(["name", "m1"]), true),
        Err(Error::Usage(_))
    ));
    assert_eq!(m.provision_stats().attempts, 0);
}
