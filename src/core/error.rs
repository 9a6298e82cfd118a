use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type TuneResult<T> = Result<T, TuneError>;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid dataset {path:?}: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("model `{0}` is not recognised by the provider")]
    InvalidModel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request rejected by provider ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<TuneError> },

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("cancelled while waiting to retry")]
    Interrupted,

    #[error("deadline reached before the next attempt: {last}")]
    DeadlineExceeded { last: Box<TuneError> },
}

impl TuneError {
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TuneError::Validation { path: path.into(), reason: reason.into() }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TuneError::Transport(_))
    }
}

impl From<reqwest::Error> for TuneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TuneError::Transport(format!("request timed out: {}", err))
        } else if err.is_connect() {
            TuneError::Transport(format!("connection failed: {}", err))
        } else if err.is_decode() {
            TuneError::Transport(format!("malformed response: {}", err))
        } else {
            TuneError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TuneError {
    fn from(err: serde_json::Error) -> Self {
        TuneError::Transport(format!("malformed response: {}", err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Credentials,
    Upload,
    Submit,
    Poll,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Credentials => "credentials",
            Phase::Upload => "upload",
            Phase::Submit => "submit",
            Phase::Poll => "poll",
        };
        f.write_str(name)
    }
}

/// A failure of one orchestrated run, tagged with the phase it happened in.
#[derive(Debug, Error)]
#[error("{phase} phase failed: {source}")]
pub struct OrchestratorError {
    pub phase: Phase,
    #[source]
    pub source: TuneError,
}

impl OrchestratorError {
    pub fn new(phase: Phase, source: TuneError) -> Self {
        Self { phase, source }
    }
}
