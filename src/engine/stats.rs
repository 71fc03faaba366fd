// Provisioning counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSnapshot {
    pub attempts: u64,
    pub verify_failures: u64,
    pub transfer_failures: u64,
    pub cache_hits: u64,
    pub bytes_downloaded: u64,
}

pub struct ProvisionStats {
    attempts: AtomicU64,
    verify_failures: AtomicU64,
    transfer_failures: AtomicU64,
    cache_hits: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl ProvisionStats {
    pub fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            verify_failures: AtomicU64::new(0),
            transfer_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verify_failure(&self) {
        self.verify_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_failure(&self) {
        self.transfer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProvisionSnapshot {
        ProvisionSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            verify_failures: self.verify_failures.load(Ordering::Relaxed),
            transfer_failures: self.transfer_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProvisionStats {
    fn default() -> Self {
        Self::new()
    }
}
