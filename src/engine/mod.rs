// Engine orchestration: provisioning pipeline and session lifecycle.

pub mod cache;
pub mod provisioner;
pub mod registry;
pub mod session;
pub mod state;
pub mod stats;
pub mod version;
