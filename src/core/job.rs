use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a file held by the provider's storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadHandle(pub String);

impl UploadHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `"auto"`, a whole count such as `n_epochs`, or a multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperparameterValue {
    Auto(String),
    Integer(u64),
    Number(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_epochs: Option<HyperparameterValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<HyperparameterValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate_multiplier: Option<HyperparameterValue>,
}

/// Body of a fine-tuning job creation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    pub training_file: UploadHandle,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<Hyperparameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_file: Option<UploadHandle>,
}

impl JobRequest {
    pub fn new(training_file: UploadHandle, model: impl Into<String>) -> Self {
        Self {
            training_file,
            model: model.into(),
            hyperparameters: None,
            suffix: None,
            validation_file: None,
        }
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Hyperparameters) -> Self {
        self.hyperparameters = Some(hyperparameters);
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_validation_file(mut self, handle: UploadHandle) -> Self {
        self.validation_file = Some(handle);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    ValidatingFiles,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::ValidatingFiles => "validating_files",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Local view of a remote fine-tuning job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub model: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fine_tuned_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, model: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            status,
            created_at: Utc::now(),
            last_polled_at: None,
            fine_tuned_model: None,
            error: None,
        }
    }

    /// Folds a freshly fetched remote snapshot into this record.
    pub fn observe(&mut self, snapshot: JobRecord, polled_at: DateTime<Utc>) {
        self.status = snapshot.status;
        self.last_polled_at = Some(polled_at);
        if snapshot.fine_tuned_model.is_some() {
            self.fine_tuned_model = snapshot.fine_tuned_model;
        }
        if snapshot.error.is_some() {
            self.error = snapshot.error;
        }
    }
}

/// The orchestrator's view of one job's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Created,
    Uploading,
    Submitting,
    Polling,
    Submitted,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    CancelledLocally,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestratorState::Submitted
                | OrchestratorState::Succeeded
                | OrchestratorState::Failed
                | OrchestratorState::Cancelled
                | OrchestratorState::TimedOut
                | OrchestratorState::CancelledLocally
        )
    }

    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        match (self, next) {
            (Created, Uploading) => true,
            (Uploading, Submitting) => true,
            (Submitting, Polling) | (Submitting, Submitted) => true,
            (Polling, Succeeded)
            | (Polling, Cancelled)
            | (Polling, TimedOut)
            | (Polling, CancelledLocally) => true,
            (Created | Uploading | Submitting | Polling, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How an orchestrated run ended, when it did not end in an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Detached run: the job was accepted and left to run remotely.
    Submitted(JobRecord),
    Succeeded(JobRecord),
    /// The provider reported the job as failed.
    Failed(JobRecord),
    /// The provider confirmed the job was cancelled.
    Cancelled(JobRecord),
    /// The deadline passed; the remote job was left untouched.
    TimedOut(JobRecord),
    /// The caller stopped tracking; the remote job may still be running.
    CancelledLocally(JobRecord),
}

impl Outcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            Outcome::Submitted(record)
            | Outcome::Succeeded(record)
            | Outcome::Failed(record)
            | Outcome::Cancelled(record)
            | Outcome::TimedOut(record)
            | Outcome::CancelledLocally(record) => record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Outcome::Submitted(record)
            | Outcome::Succeeded(record)
            | Outcome::Failed(record)
            | Outcome::Cancelled(record)
            | Outcome::TimedOut(record)
            | Outcome::CancelledLocally(record) => record,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        match self {
            Outcome::Submitted(_) => OrchestratorState::Submitted,
            Outcome::Succeeded(_) => OrchestratorState::Succeeded,
            Outcome::Failed(_) => OrchestratorState::Failed,
            Outcome::Cancelled(_) => OrchestratorState::Cancelled,
            Outcome::TimedOut(_) => OrchestratorState::TimedOut,
            Outcome::CancelledLocally(_) => OrchestratorState::CancelledLocally,
        }
    }

    /// Outcome for a record whose status is terminal; hands the record
    /// back otherwise.
    pub(crate) fn from_terminal(record: JobRecord) -> Result<Outcome, JobRecord> {
        match record.status {
            JobStatus::Succeeded => Ok(Outcome::Succeeded(record)),
            JobStatus::Failed => Ok(Outcome::Failed(record)),
            JobStatus::Cancelled => Ok(Outcome::Cancelled(record)),
            _ => Err(record),
        }
    }
}
