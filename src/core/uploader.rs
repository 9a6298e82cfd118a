use crate::adapters::input::{DatasetReference, DEFAULT_MAX_FILE_BYTES};
use crate::adapters::provider::FineTuneProvider;
use crate::core::error::{TuneError, TuneResult};
use crate::core::job::UploadHandle;
use crate::utils::lib::{retry, RetryPolicy};
use log::{debug, info};
use secrecy::SecretString;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

type CacheKey = (String, String);

/// Upload handles keyed by purpose and content hash, shared between jobs.
///
/// Each key owns one cell, so concurrent uploads of identical content wait
/// on a single in-flight request. A failed upload leaves its cell empty.
#[derive(Default)]
pub struct UploadCache {
    cells: Mutex<HashMap<CacheKey, Arc<OnceCell<UploadHandle>>>>,
}

impl UploadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, purpose: &str, content_hash: &str) -> Option<UploadHandle> {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .get(&(purpose.to_string(), content_hash.to_string()))
            .and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, dataset: &DatasetReference) -> Arc<OnceCell<UploadHandle>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        let key = (dataset.purpose().to_string(), dataset.content_hash().to_string());
        cells.entry(key).or_default().clone()
    }
}

pub struct DatasetUploader<P: FineTuneProvider> {
    provider: Arc<P>,
    cache: Arc<UploadCache>,
    max_file_bytes: u64,
}

impl<P: FineTuneProvider> DatasetUploader<P> {
    pub fn new(provider: Arc<P>, cache: Arc<UploadCache>) -> Self {
        Self { provider, cache, max_file_bytes: DEFAULT_MAX_FILE_BYTES }
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Single-attempt upload.
    pub async fn upload(
        &self,
        api_key: &SecretString,
        dataset: &DatasetReference,
    ) -> TuneResult<UploadHandle> {
        self.upload_via(dataset, || self.provider.upload_file(api_key, dataset)).await
    }

    /// Like `upload`, retrying transient failures according to `policy`.
    pub async fn upload_with_retry(
        &self,
        api_key: &SecretString,
        dataset: &DatasetReference,
        policy: &RetryPolicy,
    ) -> TuneResult<UploadHandle> {
        self.upload_via(dataset, || {
            retry(policy, "upload", || self.provider.upload_file(api_key, dataset))
        })
        .await
    }

    async fn upload_via<F, Fut>(&self, dataset: &DatasetReference, send: F) -> TuneResult<UploadHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TuneResult<UploadHandle>>,
    {
        self.validate(dataset)?;

        let cell = self.cache.cell(dataset);
        if let Some(handle) = cell.get() {
            info!("Reusing upload {} for {:?}", handle, dataset.path());
            return Ok(handle.clone());
        }

        let handle = cell
            .get_or_try_init(|| {
                debug!("Uploading {:?} ({} bytes)", dataset.path(), dataset.size_bytes());
                send()
            })
            .await?;
        Ok(handle.clone())
    }

    fn validate(&self, dataset: &DatasetReference) -> TuneResult<()> {
        if dataset.size_bytes() == 0 {
            return Err(TuneError::validation(dataset.path(), "file is empty"));
        }
        if dataset.size_bytes() > self.max_file_bytes {
            return Err(TuneError::validation(
                dataset.path(),
                format!("{} bytes exceeds the {} byte limit", dataset.size_bytes(), self.max_file_bytes),
            ));
        }
        Ok(())
    }
}
