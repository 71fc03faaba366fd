// Shared fixtures: an in-memory download backend that records every call.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use cvm_session_engine::engine::provisioner::cernvm_image_name;
use cvm_session_engine::error::{Error, Result};
use cvm_session_engine::source::traits::{DownloadBackend, ProgressFn};

pub const RELEASE_URL: &str = "http://releases.test/";

#[derive(Default)]
struct Shared {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    corrupt_remaining: AtomicUsize,
    aborts: AtomicUsize,
    gate: Mutex<Option<Arc<Gate>>>,
}

/// Holds file transfers until released, one `release` per transfer.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Serves canned bodies by URL. Clones share the same bodies and call log.
#[derive(Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.shared.bodies.lock().insert(url.to_string(), body.into());
    }

    /// Flip a byte in the next `n` file payloads.
    pub fn corrupt_next(&self, n: usize) {
        self.shared.corrupt_remaining.store(n, Ordering::SeqCst);
    }

    /// Calls so far, as `file:<url>` / `text:<url>`.
    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().clone()
    }

    pub fn file_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("file:")).count()
    }

    /// Park every subsequent file transfer on the returned gate.
    pub fn gate_files(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.shared.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn aborts(&self) -> usize {
        self.shared.aborts.load(Ordering::SeqCst)
    }

    fn body(&self, url: &str) -> Result<Vec<u8>> {
        self.shared
            .bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Io(format!("HTTP 404 for {}", url)))
    }
}

#[async_trait]
impl DownloadBackend for MemoryBackend {
    async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        self.shared.calls.lock().push(format!("file:{}", url));
        let gate = self.shared.gate.lock().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let mut body = self.body(url)?;
        let corrupt = self
            .shared
            .corrupt_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            match body.first_mut() {
                Some(b) => *b ^= 0xFF,
                None => body.push(0),
            }
        }
        std::fs::write(destination, &body)?;
        if let Some(sink) = progress {
            sink(body.len() as u64, body.len() as u64);
        }
        Ok(())
    }

    async fn download_text(
        &self,
        url: &str,
        buffer: &mut String,
        _progress: Option<&ProgressFn>,
    ) -> Result<()> {
        self.shared.calls.lock().push(format!("text:{}", url));
        *buffer = String::from_utf8_lossy(&self.body(url)?).into_owned();
        Ok(())
    }

    fn abort(&self) {
        self.shared.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_all(&self) {
        self.shared.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn clone_backend(&self) -> Arc<dyn DownloadBackend> {
        Arc::new(Self {
            shared: Arc::clone(&self.shared),
        })
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn cernvm_url(version: &str, flavor: &str, arch: &str) -> String {
    format!(
        "{}ucernvm-images.{}.cernvm.{}/{}",
        RELEASE_URL,
        version,
        arch,
        cernvm_image_name(version, flavor, arch)
    )
}

/// Publish a CernVM image and its checksum file.
pub fn publish_cernvm(backend: &MemoryBackend, version: &str, arch: &str, body: &[u8]) -> String {
    let url = cernvm_url(version, "prod", arch);
    backend.serve(&format!("{}.sha256", url), format!("{}  image.iso\n", sha256_hex(body)));
    backend.serve(&url, body.to_vec());
    url
}
