// Provisioning pipeline: resolve a version, then fetch and verify with retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cache::{gunzip_file, parse_checksum, sha256_file, ArtifactCache};
use super::stats::{ProvisionSnapshot, ProvisionStats};
use super::version::newest_in_index;
use crate::error::{Error, Result};
use crate::source::traits::{DownloadBackend, ProgressFn};

/// Version keyword resolved against the release index.
pub const LATEST: &str = "latest";

enum ChecksumSource<'a> {
    Url(&'a str),
    Literal(&'a str),
}

/// File name of a CernVM micro-image.
pub fn cernvm_image_name(version: &str, flavor: &str, arch: &str) -> String {
    format!("ucernvm-{}.{}.cernvm.{}.iso", flavor, version, arch)
}

/// Extract the version from a CernVM image file name
/// (`ucernvm-prod.2.7.1.cernvm.x86_64.iso` -> `2.7.1`).
pub fn cernvm_version(filename: &str) -> Option<String> {
    let name = Path::new(filename).file_name()?.to_str()?;
    let rest = name.strip_prefix("ucernvm-")?;
    let (_flavor, rest) = rest.split_once('.')?;
    let end = rest.find(".cernvm.")?;
    let version = &rest[..end];
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

fn file_name_from_url(url: &str) -> Result<String> {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(Error::Usage(format!("cannot derive a file name from {}", url))),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::External(format!("blocking task failed: {}", e)))?
        .map_err(Error::from)
}

#[derive(Clone)]
pub struct Provisioner {
    backend: Arc<dyn DownloadBackend>,
    cache: Arc<ArtifactCache>,
    stats: Arc<ProvisionStats>,
    release_url: String,
    backoff: Duration,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn DownloadBackend>, cache_dir: &Path, release_url: &str) -> Result<Self> {
        Ok(Self {
            backend,
            cache: Arc::new(ArtifactCache::new(cache_dir)?),
            stats: Arc::new(ProvisionStats::new()),
            release_url: release_url.to_string(),
            backoff: Duration::ZERO,
        })
    }

    /// Same cache and counters, different transport.
    pub fn with_backend(&self, backend: Arc<dyn DownloadBackend>) -> Self {
        Self {
            backend,
            ..self.clone()
        }
    }

    /// Linear delay between attempts (`backoff * attempt`). Zero by default.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backend(&self) -> &Arc<dyn DownloadBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn stats(&self) -> ProvisionSnapshot {
        self.stats.snapshot()
    }

    /// Fetch `file_url` and verify it against the checksum published at `checksum_url`.
    pub async fn download_file_url(
        &self,
        file_url: &str,
        checksum_url: &str,
        retries: u32,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        self.fetch_verified(file_url, ChecksumSource::Url(checksum_url), false, retries, progress)
            .await
    }

    /// Fetch `file_url` and verify it against `checksum`.
    pub async fn download_file(
        &self,
        file_url: &str,
        checksum: &str,
        retries: u32,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        self.fetch_verified(file_url, ChecksumSource::Literal(checksum), false, retries, progress)
            .await
    }

    /// Fetch a gzip-compressed `file_url`; `checksum` covers the decompressed payload.
    pub async fn download_file_gz(
        &self,
        file_url: &str,
        checksum: &str,
        retries: u32,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        self.fetch_verified(file_url, ChecksumSource::Literal(checksum), true, retries, progress)
            .await
    }

    /// Ask the release index for the newest published version.
    pub async fn resolve_latest_version(&self) -> Result<String> {
        let url = format!("{}{}", self.release_url, LATEST);
        let mut index = String::new();
        self.backend.download_text(&url, &mut index, None).await?;
        let newest = newest_in_index(&index)
            .ok_or_else(|| Error::Io(format!("no version listed at {}", url)))?;
        info!("resolved {} to {}", LATEST, newest);
        Ok(newest.raw)
    }

    /// Download a CernVM image. `version == "latest"` is resolved first and
    /// `version` is rewritten to the concrete value.
    pub async fn cernvm_download(
        &self,
        version: &mut String,
        flavor: &str,
        arch: &str,
        retries: u32,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        if version.as_str() == LATEST {
            *version = self.resolve_latest_version().await?;
        }
        let image = cernvm_image_name(version, flavor, arch);
        let file_url = format!(
            "{}ucernvm-images.{}.cernvm.{}/{}",
            self.release_url, version, arch, image
        );
        let checksum_url = format!("{}.sha256", file_url);
        self.download_file_url(&file_url, &checksum_url, retries, progress)
            .await
    }

    /// Path of a cached, still-valid image for `version`, without touching the network.
    pub fn cernvm_cached(&self, version: &str) -> Result<PathBuf> {
        let candidates = self.cache.find(|name| {
            name.ends_with(".iso") && cernvm_version(name).as_deref() == Some(version)
        })?;
        for path in candidates {
            if self.cache.is_verified(&path)? {
                debug!("cache hit for version {}: {}", version, path.display());
                self.stats.record_cache_hit();
                return Ok(path);
            }
        }
        Err(Error::NotFound(format!("no cached image for version {}", version)))
    }

    async fn fetch_verified(
        &self,
        file_url: &str,
        checksum: ChecksumSource<'_>,
        gz: bool,
        retries: u32,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        let mut name = file_name_from_url(file_url)?;
        if gz {
            if let Some(stripped) = name.strip_suffix(".gz") {
                name = stripped.to_string();
            }
        }
        let dest = self.cache.path_for(&name);
        let attempts = retries.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff * (attempt - 1)).await;
            }
            self.stats.record_attempt();

            match self.attempt(file_url, &checksum, gz, &name, &dest, progress).await {
                Ok(()) => return Ok(dest),
                Err(e) if e.is_transient() => {
                    if matches!(e, Error::Verification { .. }) {
                        self.stats.record_verify_failure();
                    } else {
                        self.stats.record_transfer_failure();
                    }
                    warn!(
                        "download of {} failed (attempt {}/{}): {}",
                        file_url, attempt, attempts, e
                    );
                    last_err = Some(e);
                }
                Err(e) => {
                    warn!("download of {} stopped: {}", file_url, e);
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Io(format!("no attempt made for {}", file_url))))
    }

    /// One full cycle: checksum, then payload, then verification.
    async fn attempt(
        &self,
        file_url: &str,
        checksum: &ChecksumSource<'_>,
        gz: bool,
        name: &str,
        dest: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let expected = match checksum {
            ChecksumSource::Url(url) => {
                let mut text = String::new();
                self.backend.download_text(url, &mut text, None).await?;
                parse_checksum(&text)?
            }
            ChecksumSource::Literal(sum) => parse_checksum(sum)
                .map_err(|_| Error::Usage(format!("invalid checksum `{}`", sum)))?,
        };

        if self.cache.matches(dest, &expected)? {
            info!("{} already present and verified", dest.display());
            self.stats.record_cache_hit();
            return Ok(());
        }

        // Staging files are private to this attempt.
        let partial = self.cache.stage(name)?;
        let compressed = if gz {
            Some(self.cache.stage(&format!("{}.gz", name))?)
        } else {
            None
        };
        let download_to: &Path = compressed.as_deref().unwrap_or(&*partial);

        let actual = self
            .fetch_payload(file_url, download_to, &partial, gz, progress)
            .await?;
        drop(compressed);

        if actual != expected {
            return Err(Error::Verification {
                url: file_url.to_string(),
                expected,
                actual,
            });
        }

        self.cache.commit(partial, dest, &expected)?;
        info!("verified {} -> {}", file_url, dest.display());
        Ok(())
    }

    /// Download into `staged`, decompress into `partial` if needed, and
    /// return the digest of `partial`.
    async fn fetch_payload(
        &self,
        file_url: &str,
        staged: &Path,
        partial: &Path,
        gz: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<String> {
        self.backend.download_file(file_url, staged, progress).await?;
        if let Ok(meta) = tokio::fs::metadata(staged).await {
            self.stats.record_downloaded(meta.len());
        }

        if gz {
            let (src, dst) = (staged.to_path_buf(), partial.to_path_buf());
            let size = blocking(move || gunzip_file(&src, &dst)).await?;
            debug!("decompressed {} ({} bytes)", file_url, size);
        }

        let target = partial.to_path_buf();
        blocking(move || sha256_file(&target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cernvm_names() {
        let name = cernvm_image_name("2.7.1", "prod", "x86_64");
        assert_eq!(name, "ucernvm-prod.2.7.1.cernvm.x86_64.iso");
        assert_eq!(cernvm_version(&name).as_deref(), Some("2.7.1"));
        assert_eq!(
            cernvm_version("/cache/ucernvm-devel.1.18-7.cernvm.i386.iso").as_deref(),
            Some("1.18-7")
        );
        assert_eq!(cernvm_version("other.iso"), None);
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("http://h/a/b.iso?x=1").unwrap(), "b.iso");
        assert!(file_name_from_url("http://h/a/").is_err());
    }
}
