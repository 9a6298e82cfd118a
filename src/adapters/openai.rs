use super::input::DatasetReference;
use super::provider::FineTuneProvider;
use crate::core::error::{TuneError, TuneResult};
use crate::core::job::{JobRecord, JobRequest, JobStatus, UploadHandle};
use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, error, info};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::ReaderStream;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Upper bound on a single request, upload bodies included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Upload,
    CreateJob,
    RetrieveJob,
}

#[derive(Deserialize, Debug)]
struct FileObject {
    id: String,
}

#[derive(Deserialize, Debug)]
struct FineTuningJob {
    id: String,
    model: String,
    status: JobStatus,
    created_at: i64,
    fine_tuned_model: Option<String>,
    error: Option<FineTuningJobError>,
}

#[derive(Deserialize, Debug)]
struct FineTuningJobError {
    message: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Deserialize, Debug, Default)]
struct ApiErrorDetail {
    message: Option<String>,
    code: Option<String>,
    param: Option<String>,
}

impl TryFrom<FineTuningJob> for JobRecord {
    type Error = TuneError;

    fn try_from(job: FineTuningJob) -> TuneResult<Self> {
        let created_at = DateTime::from_timestamp(job.created_at, 0).ok_or_else(|| {
            TuneError::Transport(format!("malformed response: bad created_at {}", job.created_at))
        })?;
        Ok(JobRecord {
            id: job.id,
            model: job.model,
            status: job.status,
            created_at,
            last_polled_at: None,
            fine_tuned_model: job.fine_tuned_model,
            error: job.error.and_then(|e| e.message),
        })
    }
}

/// Client for the OpenAI files and fine-tuning endpoints.
pub struct OpenAI {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAI {
    pub fn new() -> TuneResult<Self> {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// A client whose requests fail with a transport error after `timeout`.
    pub fn with_request_timeout(timeout: Duration) -> TuneResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TuneError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base_url: DEFAULT_BASE_URL.to_string() })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_headers(&self, api_key: &SecretString) -> TuneResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
            .map_err(|_| TuneError::Configuration("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse_response<T: DeserializeOwned>(
        response: Response,
        endpoint: Endpoint,
        model: Option<&str>,
    ) -> TuneResult<T> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            debug!("Response from {:?}: {}", endpoint, body);
            Ok(serde_json::from_str(&body)?)
        } else {
            error!("OpenAI API request to {:?} failed ({}): {}", endpoint, status, body);
            Err(classify_failure(status, &body, endpoint, model))
        }
    }
}

fn classify_failure(
    status: StatusCode,
    body: &str,
    endpoint: Endpoint,
    model: Option<&str>,
) -> TuneError {
    let detail = serde_json::from_str::<ApiErrorBody>(body).unwrap_or_default().error;
    let message = detail.message.clone().unwrap_or_else(|| body.trim().to_string());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return TuneError::Configuration(format!("provider rejected the API key: {}", message));
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::CONFLICT
    {
        return TuneError::Transport(format!("{}: {}", status, message));
    }
    if endpoint == Endpoint::CreateJob {
        let model_rejected = status == StatusCode::NOT_FOUND
            || detail.code.as_deref() == Some("model_not_found")
            || detail.param.as_deref() == Some("model");
        if model_rejected {
            return TuneError::InvalidModel(model.unwrap_or_default().to_string());
        }
    }
    TuneError::Rejected { status: status.as_u16(), message }
}

#[async_trait]
impl FineTuneProvider for OpenAI {
    async fn upload_file(
        &self,
        api_key: &SecretString,
        dataset: &DatasetReference,
    ) -> TuneResult<UploadHandle> {
        let headers = self.generate_headers(api_key)?;
        let file_name = dataset.file_name()?;
        let file = dataset.open_verified().await?;

        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, dataset.size_bytes())
            .file_name(file_name)
            .mime_str("application/json")?;
        let form = Form::new()
            .part("file", part)
            .text("purpose", dataset.purpose().to_string());

        let response = self.client.post(self.url("/files"))
            .headers(headers)
            .multipart(form)
            .send()
            .await?;

        let file: FileObject = Self::parse_response(response, Endpoint::Upload, None).await?;
        info!("File uploaded successfully as {}", file.id);
        Ok(UploadHandle::new(file.id))
    }

    async fn create_fine_tuning_job(
        &self,
        api_key: &SecretString,
        request: &JobRequest,
    ) -> TuneResult<JobRecord> {
        let headers = self.generate_headers(api_key)?;

        let response = self.client.post(self.url("/fine_tuning/jobs"))
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let job: FineTuningJob =
            Self::parse_response(response, Endpoint::CreateJob, Some(&request.model)).await?;
        info!("Fine-tuning job {} created with status {}", job.id, job.status);
        job.try_into()
    }

    async fn retrieve_fine_tuning_job(
        &self,
        api_key: &SecretString,
        job_id: &str,
    ) -> TuneResult<JobRecord> {
        let headers = self.generate_headers(api_key)?;

        let response = self.client.get(self.url(&format!("/fine_tuning/jobs/{}", job_id)))
            .headers(headers)
            .send()
            .await?;

        let job: FineTuningJob = Self::parse_response(response, Endpoint::RetrieveJob, None).await?;
        debug!("Fine-tuning job {} is {}", job.id, job.status);
        job.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_configuration_errors() {
        let err = classify_failure(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"Incorrect API key provided"}}"#,
            Endpoint::Upload,
            None,
        );
        assert!(matches!(err, TuneError::Configuration(ref m) if m.contains("Incorrect API key")));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = classify_failure(status, "", Endpoint::CreateJob, Some("gpt-3.5-turbo"));
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
    }

    #[test]
    fn unknown_model_is_invalid_model() {
        let body = r#"{"error":{"message":"Model not found","code":"model_not_found","param":"model"}}"#;
        let err = classify_failure(StatusCode::BAD_REQUEST, body, Endpoint::CreateJob, Some("gpt-9"));
        assert!(matches!(err, TuneError::InvalidModel(ref m) if m == "gpt-9"));
    }

    #[test]
    fn not_found_outside_job_creation_is_rejected() {
        let err = classify_failure(StatusCode::NOT_FOUND, "gone", Endpoint::RetrieveJob, None);
        assert!(matches!(err, TuneError::Rejected { status: 404, ref message } if message == "gone"));
    }

    #[test]
    fn job_without_error_converts() {
        let job: FineTuningJob = serde_json::from_str(
            r#"{"id":"ftjob-1","model":"gpt-3.5-turbo","status":"queued","created_at":1700000000,
                "fine_tuned_model":null,"error":null}"#,
        )
        .unwrap();
        let record = JobRecord::try_from(job).unwrap();
        assert_eq!(record.id, "ftjob-1");
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.created_at.timestamp(), 1_700_000_000);
        assert!(record.error.is_none());
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = OpenAI::new().unwrap().with_base_url("http://localhost:8080/v1/");
        assert_eq!(client.base_url(), "http://localhost:8080/v1");
        assert_eq!(client.url("/files"), "http://localhost:8080/v1/files");
    }
}
