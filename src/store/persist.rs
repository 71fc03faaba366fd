// JSON-file persistence for a parameter tree: load once, rewrite on every commit.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::parameters::ParameterStore;
use crate::error::Result;

/// Write `map` as a flat JSON object, going through a temp file so a crash
/// never leaves a truncated config behind.
pub fn write_map(path: &Path, map: &BTreeMap<String, String>) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Open (or create) a store backed by `path`. Existing contents are loaded
/// before the hook is armed, so loading never rewrites the file.
///
/// Writes go through to disk before the committing call returns, in commit
/// order. Each commit rewrites the whole file on the caller's thread.
pub fn open_file_store(path: &Path) -> Result<Arc<ParameterStore>> {
    let initial = if path.exists() {
        read_map(path)?
    } else {
        BTreeMap::new()
    };

    let target: PathBuf = path.to_path_buf();
    let store = ParameterStore::with_commit_hook(Box::new(move |map| {
        match write_map(&target, map) {
            Ok(()) => debug!("persisted {} keys to {}", map.len(), target.display()),
            Err(e) => warn!("failed to persist {}: {}", target.display(), e),
        }
    }));

    // The lock keeps the import from committing.
    store.lock();
    store.from_map(initial, false, true);
    store.unlock_discarding();
    Ok(store)
}
