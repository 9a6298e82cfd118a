use crate::adapters::input::DatasetReference;
use crate::core::error::TuneResult;
use crate::core::job::{JobRecord, JobRequest, UploadHandle};
use async_trait::async_trait;
use secrecy::SecretString;

/// The remote fine-tuning API. Each call is a single request; retrying is
/// left to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FineTuneProvider: Send + Sync {
    async fn upload_file(
        &self,
        api_key: &SecretString,
        dataset: &DatasetReference,
    ) -> TuneResult<UploadHandle>;

    async fn create_fine_tuning_job(
        &self,
        api_key: &SecretString,
        request: &JobRequest,
    ) -> TuneResult<JobRecord>;

    async fn retrieve_fine_tuning_job(
        &self,
        api_key: &SecretString,
        job_id: &str,
    ) -> TuneResult<JobRecord>;
}
