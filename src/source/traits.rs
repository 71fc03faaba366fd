use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Receives `(current, total)` byte counts while a transfer runs.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Abortable, progress-reporting file/text transport.
///
/// Failures to open the destination and transport failures both surface as
/// [`Error::Io`](crate::error::Error::Io). A partially written destination is
/// left in place; callers must discard it.
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    async fn download_file(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<()>;

    async fn download_text(
        &self,
        url: &str,
        buffer: &mut String,
        progress: Option<&ProgressFn>,
    ) -> Result<()>;

    /// Cancel the in-flight transfer only. Self-clears once observed.
    fn abort(&self);

    /// Cancel the in-flight transfer and every later one on this instance.
    fn abort_all(&self);

    /// A fresh, independent instance with no abort state.
    fn clone_backend(&self) -> Arc<dyn DownloadBackend>;
}
