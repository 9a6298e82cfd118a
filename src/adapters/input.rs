use crate::core::error::{TuneError, TuneResult};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

pub const DEFAULT_PURPOSE: &str = "fine-tune";

/// Provider file size limit.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 512 * 1024 * 1024;

const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// A local dataset file identified by the hash of its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetReference {
    path: PathBuf,
    content_hash: String,
    purpose: String,
    size_bytes: u64,
}

impl DatasetReference {
    /// Hashes the file under the default size limit.
    pub async fn load(path: impl Into<PathBuf>, purpose: impl Into<String>) -> TuneResult<Self> {
        Self::load_with_limit(path, purpose, DEFAULT_MAX_FILE_BYTES).await
    }

    /// Checks the file's size from its metadata, then hashes it in chunks.
    /// Empty, oversized or unreadable files are rejected here, before
    /// anything touches the network.
    pub async fn load_with_limit(
        path: impl Into<PathBuf>,
        purpose: impl Into<String>,
        max_bytes: u64,
    ) -> TuneResult<Self> {
        let path = path.into();
        info!("Loading dataset from {:?}", path);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| TuneError::validation(&path, format!("unreadable: {}", e)))?;
        check_size(&path, metadata.len(), max_bytes)?;

        let (content_hash, size_bytes) = hash_file(&path)
            .await
            .map_err(|e| TuneError::validation(&path, format!("unreadable: {}", e)))?;
        check_size(&path, size_bytes, max_bytes)?;
        debug!("Dataset {:?} hashed to {}", path, content_hash);
        Ok(Self { path, content_hash, purpose: purpose.into(), size_bytes })
    }

    pub fn from_bytes(
        path: impl Into<PathBuf>,
        purpose: impl Into<String>,
        content: &[u8],
    ) -> TuneResult<Self> {
        let path = path.into();
        if content.is_empty() {
            return Err(TuneError::validation(&path, "file is empty"));
        }
        let content_hash = hex::encode(Sha256::digest(content));
        debug!("Dataset {:?} hashed to {}", path, content_hash);
        Ok(Self {
            path,
            content_hash,
            purpose: purpose.into(),
            size_bytes: content.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn file_name(&self) -> TuneResult<String> {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .ok_or_else(|| TuneError::validation(&self.path, "path has no file name"))
    }

    /// Opens the file for streaming upload, refusing it if it changed since
    /// it was hashed.
    pub async fn open_verified(&self) -> TuneResult<File> {
        let unreadable = |e: io::Error| TuneError::validation(&self.path, format!("unreadable: {}", e));
        let (content_hash, size_bytes) = hash_file(&self.path).await.map_err(unreadable)?;
        if content_hash != self.content_hash || size_bytes != self.size_bytes {
            return Err(TuneError::validation(&self.path, "file changed after it was hashed"));
        }
        File::open(&self.path).await.map_err(unreadable)
    }
}

fn check_size(path: &Path, size_bytes: u64, max_bytes: u64) -> TuneResult<()> {
    if size_bytes == 0 {
        return Err(TuneError::validation(path, "file is empty"));
    }
    if size_bytes > max_bytes {
        return Err(TuneError::validation(
            path,
            format!("{} bytes exceeds the {} byte limit", size_bytes, max_bytes),
        ));
    }
    Ok(())
}

async fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    let mut size_bytes = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size_bytes += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size_bytes))
}
