use crate::adapters::provider::FineTuneProvider;
use crate::core::error::TuneResult;
use crate::core::job::{JobRecord, JobRequest};
use log::info;
use secrecy::SecretString;
use std::sync::Arc;

/// Creates fine-tuning jobs and fetches their status. Never retries.
pub struct JobSubmitter<P: FineTuneProvider> {
    provider: Arc<P>,
}

impl<P: FineTuneProvider> JobSubmitter<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub async fn submit(&self, api_key: &SecretString, request: &JobRequest) -> TuneResult<JobRecord> {
        info!("Submitting fine-tuning job for {} on {}", request.training_file, request.model);
        let record = self.provider.create_fine_tuning_job(api_key, request).await?;
        info!("Job {} accepted with status {}", record.id, record.status);
        Ok(record)
    }

    pub async fn status(&self, api_key: &SecretString, job_id: &str) -> TuneResult<JobRecord> {
        self.provider.retrieve_fine_tuning_job(api_key, job_id).await
    }
}
