use crate::adapters::credentials::CredentialProvider;
use crate::adapters::input::DatasetReference;
use crate::adapters::provider::FineTuneProvider;
use crate::core::error::{OrchestratorError, Phase, TuneError};
use crate::core::job::{
    Hyperparameters, JobRecord, JobRequest, OrchestratorState, Outcome, UploadHandle,
};
use crate::core::submitter::JobSubmitter;
use crate::core::uploader::{DatasetUploader, UploadCache};
use crate::utils::lib::{retry, retry_within, RetryLimits, RetryPolicy};
use chrono::Utc;
use indicatif::ProgressBar;
use log::{debug, info, warn};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Measured from the start of the run.
    pub timeout: Duration,
    /// Stop once the job is accepted instead of polling it.
    pub detach: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(24 * 60 * 60),
            detach: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }
}

/// Everything about a job except the file it trains on.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub model: String,
    pub hyperparameters: Option<Hyperparameters>,
    pub suffix: Option<String>,
    /// Local dataset uploaded alongside the training file.
    pub validation_file: Option<PathBuf>,
}

impl JobOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into(), hyperparameters: None, suffix: None, validation_file: None }
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = Some(hyperparameters);
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_validation_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.validation_file = Some(path.into());
        self
    }

    fn into_request(self, training_file: UploadHandle, validation_file: Option<UploadHandle>) -> JobRequest {
        let mut request = JobRequest::new(training_file, self.model);
        request.hyperparameters = self.hyperparameters;
        request.suffix = self.suffix;
        request.validation_file = validation_file;
        request
    }
}

/// Drives one job through upload, submission and polling.
pub struct JobOrchestrator<P: FineTuneProvider> {
    run_id: Uuid,
    uploader: DatasetUploader<P>,
    submitter: JobSubmitter<P>,
    credentials: Arc<dyn CredentialProvider>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
    state: OrchestratorState,
}

impl<P: FineTuneProvider> JobOrchestrator<P> {
    pub fn new(
        provider: Arc<P>,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<UploadCache>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            uploader: DatasetUploader::new(provider.clone(), cache),
            submitter: JobSubmitter::new(provider),
            credentials,
            config,
            cancel: CancellationToken::new(),
            progress: None,
            state: OrchestratorState::Created,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.uploader = self.uploader.with_max_file_bytes(max_file_bytes);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Loads the dataset at `path` and runs it. Unreadable or empty files
    /// fail in the upload phase without any network traffic.
    pub async fn run_file(
        &mut self,
        path: impl Into<PathBuf>,
        purpose: &str,
        options: JobOptions,
    ) -> Result<Outcome, OrchestratorError> {
        let dataset = match DatasetReference::load_with_limit(path, purpose, self.uploader.max_file_bytes()).await {
            Ok(dataset) => dataset,
            Err(e) => return Err(self.fail(Phase::Upload, e)),
        };
        self.run(&dataset, options).await
    }

    pub async fn run(
        &mut self,
        dataset: &DatasetReference,
        options: JobOptions,
    ) -> Result<Outcome, OrchestratorError> {
        if self.state != OrchestratorState::Created {
            return Err(OrchestratorError::new(
                Phase::Credentials,
                TuneError::InvalidTransition {
                    from: self.state.to_string(),
                    to: OrchestratorState::Uploading.to_string(),
                },
            ));
        }
        let deadline = Instant::now() + self.config.timeout;
        info!("[{}] Starting fine-tuning run for {:?} on {}", self.run_id, dataset.path(), options.model);

        let api_key = match self.credentials.api_key() {
            Ok(key) => key,
            Err(e) => return Err(self.fail(Phase::Credentials, e)),
        };

        self.advance(OrchestratorState::Uploading, Phase::Upload)?;
        let uploaded = self.uploader.upload_with_retry(&api_key, dataset, &self.config.retry).await;
        let handle = match uploaded {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(Phase::Upload, e)),
        };
        info!("[{}] Training file is {}", self.run_id, handle);

        let validation = match &options.validation_file {
            Some(path) => {
                let uploaded = self.upload_path(&api_key, path, dataset.purpose()).await;
                match uploaded {
                    Ok(handle) => {
                        info!("[{}] Validation file is {}", self.run_id, handle);
                        Some(handle)
                    }
                    Err(e) => return Err(self.fail(Phase::Upload, e)),
                }
            }
            None => None,
        };

        self.advance(OrchestratorState::Submitting, Phase::Submit)?;
        let request = options.into_request(handle, validation);
        let submitter = &self.submitter;
        let submitted = retry(&self.config.retry, "submit", || submitter.submit(&api_key, &request)).await;
        let record = match submitted {
            Ok(record) => record,
            Err(e) => return Err(self.fail(Phase::Submit, e)),
        };
        self.report(&record);

        if self.config.detach {
            self.advance(OrchestratorState::Submitted, Phase::Submit)?;
            info!("[{}] Job {} submitted, not waiting for it", self.run_id, record.id);
            return Ok(Outcome::Submitted(record));
        }

        self.advance(OrchestratorState::Polling, Phase::Poll)?;
        self.poll(&api_key, record, deadline).await
    }

    async fn upload_path(&self, api_key: &SecretString, path: &Path, purpose: &str) -> Result<UploadHandle, TuneError> {
        let dataset = DatasetReference::load_with_limit(path, purpose, self.uploader.max_file_bytes()).await?;
        self.uploader.upload_with_retry(api_key, &dataset, &self.config.retry).await
    }

    async fn poll(
        &mut self,
        api_key: &SecretString,
        mut record: JobRecord,
        deadline: Instant,
    ) -> Result<Outcome, OrchestratorError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("[{}] Gave up waiting for job {} while {}", self.run_id, record.id, record.status);
                return self.finish(Outcome::TimedOut(record));
            }

            let wait = self.config.poll_interval.min(deadline - now);
            let cancelled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => true,
                _ = sleep(wait) => false,
            };
            if cancelled {
                return self.stop_tracking(record);
            }
            if Instant::now() >= deadline {
                continue;
            }

            let limits = RetryLimits::new()
                .with_cancellation(self.cancel.clone())
                .with_deadline(deadline);
            let submitter = &self.submitter;
            let job_id = record.id.clone();
            let polled = retry_within(&self.config.retry, "poll", &limits, || submitter.status(api_key, &job_id)).await;
            let snapshot = match polled {
                Ok(snapshot) => snapshot,
                Err(TuneError::Interrupted) => return self.stop_tracking(record),
                Err(TuneError::DeadlineExceeded { last }) => {
                    warn!("[{}] Gave up waiting for job {} after {}", self.run_id, record.id, last);
                    return self.finish(Outcome::TimedOut(record));
                }
                Err(e) => return Err(self.fail(Phase::Poll, e)),
            };
            record.observe(snapshot, Utc::now());
            self.report(&record);

            record = match Outcome::from_terminal(record) {
                Ok(outcome) => return self.finish(outcome),
                Err(record) => record,
            };
        }
    }

    fn stop_tracking(&mut self, record: JobRecord) -> Result<Outcome, OrchestratorError> {
        info!("[{}] Stopped tracking job {}; it may still be running", self.run_id, record.id);
        self.finish(Outcome::CancelledLocally(record))
    }

    fn report(&self, record: &JobRecord) {
        debug!("[{}] Job {} is {}", self.run_id, record.id, record.status);
        if let Some(progress) = &self.progress {
            progress.set_message(format!("Job {} is {}", record.id, record.status));
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Result<Outcome, OrchestratorError> {
        self.advance(outcome.state(), Phase::Poll)?;
        info!("[{}] Job {} finished as {}", self.run_id, outcome.record().id, self.state);
        if let Some(progress) = &self.progress {
            progress.finish_with_message(format!("Job {} {}", outcome.record().id, outcome.record().status));
        }
        Ok(outcome)
    }

    fn advance(&mut self, next: OrchestratorState, phase: Phase) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::new(
                phase,
                TuneError::InvalidTransition { from: self.state.to_string(), to: next.to_string() },
            ));
        }
        debug!("[{}] {} -> {}", self.run_id, self.state, next);
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, phase: Phase, source: TuneError) -> OrchestratorError {
        if self.state.can_transition_to(OrchestratorState::Failed) {
            self.state = OrchestratorState::Failed;
        }
        if let Some(progress) = &self.progress {
            progress.abandon_with_message(format!("{} failed", phase));
        }
        OrchestratorError::new(phase, source)
    }
}
