use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{Client, Response};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::ProgressThrottle;
use super::traits::{DownloadBackend, ProgressFn};
use crate::config::{CONNECT_TIMEOUT_SECS, FILE_TRANSFER_TIMEOUT_SECS, TEXT_TRANSFER_TIMEOUT_SECS};
use crate::error::{Error, Result};

/// Running transfers and the pending one-shot abort. Kept under one lock:
/// an abort is only recorded while a transfer is running, and is dropped
/// when the last transfer ends.
#[derive(Default)]
struct Transfers {
    active: usize,
    abort_requested: bool,
}

/// Tracks one running transfer.
struct ActiveTransfer<'a> {
    transfers: &'a Mutex<Transfers>,
}

impl<'a> ActiveTransfer<'a> {
    fn enter(transfers: &'a Mutex<Transfers>) -> Self {
        transfers.lock().active += 1;
        Self { transfers }
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        let mut transfers = self.transfers.lock();
        transfers.active -= 1;
        if transfers.active == 0 {
            transfers.abort_requested = false;
        }
    }
}

pub struct HttpSource {
    client: Client,
    file_timeout: Duration,
    text_timeout: Duration,
    transfers: Mutex<Transfers>,
    /// Set by `abort_all`; never reset on this instance.
    shutdown_token: CancellationToken,
}

impl HttpSource {
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(FILE_TRANSFER_TIMEOUT_SECS),
            Duration::from_secs(TEXT_TRANSFER_TIMEOUT_SECS),
        )
    }

    pub fn with_timeouts(file_timeout: Duration, text_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("http client builder failed ({}), using defaults", e);
                Client::new()
            });
        Self {
            client,
            file_timeout,
            text_timeout,
            transfers: Mutex::new(Transfers::default()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Number of transfers currently running on this instance.
    pub fn active_transfers(&self) -> usize {
        self.transfers.lock().active
    }

    /// Transport checkpoint: fails if an abort was requested.
    fn checkpoint(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::Aborted);
        }
        if std::mem::take(&mut self.transfers.lock().abort_requested) {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    async fn send(&self, url: &str, timeout: Duration) -> Result<Response> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status();
        debug!("http get {} status={}", url, status.as_u16());
        if !status.is_success() {
            warn!("http get {} failed status={}", url, status.as_u16());
            return Err(Error::Io(format!("HTTP {} for {}", status.as_u16(), url)));
        }
        Ok(resp)
    }

    /// Pull the body chunk by chunk, checking for aborts between chunks.
    async fn next_chunk(&self, resp: &mut Response) -> Result<Option<Bytes>> {
        let chunk = tokio::select! {
            chunk = resp.chunk() => chunk?,
            _ = self.shutdown_token.cancelled() => return Err(Error::Aborted),
        };
        self.checkpoint()?;
        Ok(chunk)
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadBackend for HttpSource {
    async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let _active = ActiveTransfer::enter(&self.transfers);
        self.checkpoint()?;
        debug!("downloading file {} -> {}", url, destination.display());

        let mut file = File::create(destination).await.map_err(|e| {
            warn!("cannot open {}: {}", destination.display(), e);
            Error::Io(format!("cannot open {}: {}", destination.display(), e))
        })?;

        let mut resp = self.send(url, self.file_timeout).await?;
        let total = resp.content_length().unwrap_or(0);
        let mut throttle = ProgressThrottle::new(progress);
        let mut written = 0u64;

        while let Some(chunk) = self.next_chunk(&mut resp).await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if total != 0 {
                throttle.report(written, total);
            }
        }
        file.flush().await?;

        info!("downloaded {} ({} bytes)", url, written);
        Ok(())
    }

    async fn download_text(
        &self,
        url: &str,
        buffer: &mut String,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let _active = ActiveTransfer::enter(&self.transfers);
        self.checkpoint()?;
        debug!("downloading text {}", url);

        let mut resp = self.send(url, self.text_timeout).await?;
        let total = resp.content_length().unwrap_or(0);
        let mut throttle = ProgressThrottle::new(progress);
        let mut body: Vec<u8> = Vec::new();

        while let Some(chunk) = self.next_chunk(&mut resp).await? {
            body.extend_from_slice(&chunk);
            if total != 0 {
                throttle.report(body.len() as u64, total);
            }
        }

        *buffer = String::from_utf8_lossy(&body).into_owned();
        debug!("downloaded text {} ({} bytes)", url, body.len());
        Ok(())
    }

    fn abort(&self) {
        let mut transfers = self.transfers.lock();
        if transfers.active > 0 {
            debug!("aborting current transfer");
            transfers.abort_requested = true;
        }
    }

    fn abort_all(&self) {
        debug!("aborting all transfers on this backend");
        self.shutdown_token.cancel();
    }

    fn clone_backend(&self) -> Arc<dyn DownloadBackend> {
        Arc::new(Self::with_timeouts(self.file_timeout, self.text_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_dropped_with_last_transfer() {
        let source = HttpSource::new();
        let transfer = ActiveTransfer::enter(&source.transfers);
        source.abort();
        drop(transfer);
        assert!(source.checkpoint().is_ok());

        source.abort();
        let _transfer = ActiveTransfer::enter(&source.transfers);
        assert!(source.checkpoint().is_ok());
    }

    #[test]
    fn test_abort_racing_transfer_end_never_outlives_it() {
        let source = Arc::new(HttpSource::new());
        let aborter = {
            let source = source.clone();
            std::thread::spawn(move || {
                for _ in 0..20_000 {
                    source.abort();
                }
            })
        };
        for _ in 0..20_000 {
            let _transfer = ActiveTransfer::enter(&source.transfers);
            std::hint::spin_loop();
        }
        aborter.join().unwrap();

        assert_eq!(source.active_transfers(), 0);
        assert!(source.checkpoint().is_ok());
    }
}
