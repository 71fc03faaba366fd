// On-disk artifact cache: verified files with a `.sha256` sidecar next to each.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tracing::debug;

use crate::error::{Error, Result};

const SIDECAR_EXT: &str = "sha256";
const PARTIAL_EXT: &str = "part";

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Decompress `src` (gzip) into `dst`, returning the decompressed size.
pub fn gunzip_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(File::open(src)?);
    let mut out = File::create(dst)?;
    let n = io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    Ok(n)
}

/// Normalize a checksum text: first whitespace-separated token, lowercased.
/// Accepts both a bare digest and the `"<hex>  <filename>"` format.
pub fn parse_checksum(text: &str) -> Result<String> {
    let token = text
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Io("empty checksum".to_string()))?
        .to_ascii_lowercase();
    if token.len() != 64 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Io(format!("malformed checksum `{}`", token)));
    }
    Ok(token)
}

fn with_suffix(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final location of an artifact.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// A fresh staging file for an unverified download of `name`. Every call
    /// gets its own file; it is removed on drop unless committed.
    pub fn stage(&self, name: &str) -> Result<TempPath> {
        let staged = tempfile::Builder::new()
            .prefix(&format!("{}.", name))
            .suffix(&format!(".{}", PARTIAL_EXT))
            .tempfile_in(&self.dir)?
            .into_temp_path();
        Ok(staged)
    }

    fn sidecar(path: &Path) -> PathBuf {
        with_suffix(path, SIDECAR_EXT)
    }

    /// Checksum recorded for `path` when it was last verified.
    pub fn recorded_checksum(&self, path: &Path) -> Option<String> {
        let text = fs::read_to_string(Self::sidecar(path)).ok()?;
        parse_checksum(&text).ok()
    }

    /// True if `path` exists and hashes to `expected`.
    pub fn matches(&self, path: &Path, expected: &str) -> Result<bool> {
        if !path.is_file() {
            return Ok(false);
        }
        Ok(sha256_file(path)? == expected)
    }

    /// True if `path` exists, has a recorded checksum, and still hashes to it.
    pub fn is_verified(&self, path: &Path) -> Result<bool> {
        match self.recorded_checksum(path) {
            Some(sum) => self.matches(path, &sum),
            None => Ok(false),
        }
    }

    /// Move a verified staging file into place and record its checksum.
    pub fn commit(&self, staged: TempPath, dest: &Path, checksum: &str) -> Result<()> {
        staged.persist(dest).map_err(|e| Error::from(e.error))?;
        fs::write(Self::sidecar(dest), format!("{}\n", checksum))?;
        debug!("cached {} ({})", dest.display(), checksum);
        Ok(())
    }

    /// Cached artifacts (sidecars and staging files excluded) whose file
    /// name satisfies `pred`.
    pub fn find<F>(&self, pred: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&str) -> bool,
    {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(SIDECAR_EXT) || name.ends_with(PARTIAL_EXT) {
                continue;
            }
            if pred(name) {
                found.push(path.clone());
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const EMPTY_SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_checksum_formats() {
        assert_eq!(parse_checksum(EMPTY_SHA).unwrap(), EMPTY_SHA);
        let upper = format!("{}  image.iso\n", EMPTY_SHA.to_uppercase());
        assert_eq!(parse_checksum(&upper).unwrap(), EMPTY_SHA);
        assert!(parse_checksum("").is_err());
        assert!(parse_checksum("abc123").is_err());
    }

    #[test]
    fn test_commit_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path()).unwrap();

        let staged = cache.stage("a.iso").unwrap();
        let staged_path = staged.to_path_buf();
        assert!(staged_path.exists());
        let dest = cache.path_for("a.iso");
        cache.commit(staged, &dest, EMPTY_SHA).unwrap();

        assert!(!staged_path.exists());
        assert!(cache.is_verified(&dest).unwrap());
        assert_eq!(cache.recorded_checksum(&dest).as_deref(), Some(EMPTY_SHA));

        fs::write(&dest, b"tampered").unwrap();
        assert!(!cache.is_verified(&dest).unwrap());
        assert_eq!(cache.find(|n| n.ends_with(".iso")).unwrap(), vec![dest]);
    }

    #[test]
    fn test_staging_files_are_unique_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path()).unwrap();

        let a = cache.stage("a.iso").unwrap();
        let b = cache.stage("a.iso").unwrap();
        assert_ne!(a.to_path_buf(), b.to_path_buf());
        assert!(cache.find(|_| true).unwrap().is_empty());

        let (a_path, b_path) = (a.to_path_buf(), b.to_path_buf());
        drop(a);
        drop(b);
        assert!(!a_path.exists());
        assert!(!b_path.exists());
    }

    #[test]
    fn test_gunzip_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("x.gz");
        let dst = dir.path().join("x");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello world").unwrap();
        fs::write(&src, enc.finish().unwrap()).unwrap();

        assert_eq!(gunzip_file(&src, &dst).unwrap(), 11);
        assert_eq!(fs::read(&dst).unwrap(), b"hello world");
    }
}
