use crate::adapters::credentials::DEFAULT_API_KEY_VAR;
use crate::adapters::input::DEFAULT_PURPOSE;
use crate::adapters::openai::DEFAULT_BASE_URL;
use crate::core::error::{TuneError, TuneResult};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use rand::Rng;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// JSONL dataset to upload
    #[clap(short, long, value_parser, default_value = "processed_data.jsonl")]
    pub file: PathBuf,

    #[clap(short, long, default_value = "gpt-3.5-turbo")]
    pub model: String,

    #[clap(long, default_value = DEFAULT_PURPOSE)]
    pub purpose: String,

    /// Environment variable holding the API key
    #[clap(long, default_value = DEFAULT_API_KEY_VAR)]
    pub api_key_env: String,

    #[clap(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Suffix for the fine-tuned model name
    #[clap(long)]
    pub suffix: Option<String>,

    #[clap(long)]
    pub n_epochs: Option<u32>,

    #[clap(long, default_value = "10")]
    pub poll_interval_secs: u64,

    #[clap(long, default_value = "86400")]
    pub timeout_secs: u64,

    #[clap(long, default_value = "5")]
    pub max_attempts: u32,

    /// Per-request timeout for calls to the provider
    #[clap(long, default_value = "600")]
    pub request_timeout_secs: u64,

    /// JSONL dataset uploaded as the job's validation file
    #[clap(long)]
    pub validation_file: Option<PathBuf>,

    /// .env file to read the API key from; `.env` is looked up from the
    /// working directory when omitted
    #[clap(long)]
    pub env_file: Option<PathBuf>,

    /// Exit after the job is submitted instead of waiting for it
    #[clap(long)]
    pub detach: bool,
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.factor.powi(retry as i32);
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(base * (1.0 + spread))
    }
}

/// Conditions that end a retry loop between attempts. An attempt already
/// in flight is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct RetryLimits {
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl RetryLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Runs `task` until it succeeds, fails permanently, or the policy's
/// attempt budget is spent.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, label: &str, task: F) -> TuneResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TuneResult<T>>,
{
    retry_within(policy, label, &RetryLimits::default(), task).await
}

/// Like `retry`, but gives up with `Interrupted` when `limits.cancel` fires
/// during a backoff, and with `DeadlineExceeded` when the next attempt could
/// not start before `limits.deadline`.
pub async fn retry_within<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    limits: &RetryLimits,
    mut task: F,
) -> TuneResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TuneResult<T>>,
{
    let mut attempt = 1;

    loop {
        match task().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(TuneError::ExhaustedRetries { attempts: attempt, last: Box::new(e) })
            }
            Err(e) => {
                let delay = policy.delay_for(attempt - 1);
                if let Some(deadline) = limits.deadline {
                    if Instant::now() + delay >= deadline {
                        warn!("{} failed (attempt {}/{}): {}. No time left to retry", label, attempt, policy.max_attempts, e);
                        return Err(TuneError::DeadlineExceeded { last: Box::new(e) });
                    }
                }
                warn!("{} failed (attempt {}/{}): {}. Retrying in {:?}", label, attempt, policy.max_attempts, e, delay);
                let cancelled = match &limits.cancel {
                    Some(cancel) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = sleep(delay) => false,
                    },
                    None => {
                        sleep(delay).await;
                        false
                    }
                };
                if cancelled {
                    return Err(TuneError::Interrupted);
                }
                attempt += 1;
            }
        }
    }
}

pub fn create_spinner() -> Result<ProgressBar, io::Error> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}
