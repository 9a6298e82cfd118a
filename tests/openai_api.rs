//! Drives the OpenAI adapter and the orchestrator against a mock HTTP server.

use lib::adapters::credentials::{CredentialProvider, StaticCredentialProvider};
use lib::adapters::input::DatasetReference;
use lib::adapters::openai::OpenAI;
use lib::adapters::provider::FineTuneProvider;
use lib::core::error::{Phase, TuneError};
use lib::core::job::{JobRequest, JobStatus, OrchestratorState, Outcome, UploadHandle};
use lib::core::orchestrator::{JobOptions, JobOrchestrator, OrchestratorConfig};
use lib::core::uploader::{DatasetUploader, UploadCache};
use lib::utils::lib::RetryPolicy;
use secrecy::SecretString;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_key() -> SecretString {
    SecretString::new("sk-test".to_string())
}

fn credentials() -> Arc<dyn CredentialProvider> {
    Arc::new(StaticCredentialProvider::new("sk-test"))
}

fn dataset_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{{\"messages\":[{{\"role\":\"user\",\"content\":\"hola\"}}]}}").unwrap();
    file.flush().unwrap();
    file
}

fn client(server: &MockServer) -> OpenAI {
    OpenAI::new().unwrap().with_base_url(server.uri())
}

fn job_body(status: &str) -> serde_json::Value {
    json!({
        "id": "ftjob-1",
        "object": "fine_tuning.job",
        "model": "gpt-3.5-turbo",
        "created_at": 1_700_000_000,
        "fine_tuned_model": null,
        "status": status,
        "error": null
    })
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry(RetryPolicy::default().with_base_delay(Duration::from_millis(5)))
        .with_poll_interval(Duration::from_millis(20))
}

async fn mount_upload(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/files"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-abc", "object": "file"})))
        .mount(server)
        .await;
}

async fn mount_create(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/fine_tuning/jobs"))
        .and(body_partial_json(json!({"training_file": "file-abc", "model": "gpt-3.5-turbo"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_body("queued")))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn upload_returns_file_id() {
    let server = MockServer::start().await;
    mount_upload(&server).await;
    let client = client(&server);
    let file = dataset_file();
    let dataset = DatasetReference::load(file.path(), "fine-tune").await.unwrap();

    let handle = client.upload_file(&api_key(), &dataset).await.unwrap();

    assert_eq!(handle, UploadHandle::new("file-abc"));
}

#[tokio::test]
async fn concurrent_identical_uploads_write_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "file-once"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let provider = Arc::new(client(&server));
    let cache = Arc::new(UploadCache::new());
    let a = DatasetUploader::new(provider.clone(), cache.clone());
    let b = DatasetUploader::new(provider, cache.clone());
    let first = dataset_file();
    let second = dataset_file();
    let da = DatasetReference::load(first.path(), "fine-tune").await.unwrap();
    let db = DatasetReference::load(second.path(), "fine-tune").await.unwrap();
    let key = api_key();

    let (ra, rb) = tokio::join!(a.upload(&key, &da), b.upload(&key, &db));

    assert_eq!(ra.unwrap().as_str(), "file-once");
    assert_eq!(rb.unwrap().as_str(), "file-once");
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn unknown_model_maps_to_invalid_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fine_tuning/jobs"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"message": "The model `gpt-9` does not exist", "code": "model_not_found", "param": null}
        })))
        .mount(&server)
        .await;
    let client = client(&server);

    let request = JobRequest::new(UploadHandle::new("file-abc"), "gpt-9");
    let err = client.create_fine_tuning_job(&api_key(), &request).await.unwrap_err();

    assert!(matches!(err, TuneError::InvalidModel(ref m) if m == "gpt-9"));
}

#[tokio::test]
async fn malformed_success_body_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fine_tuning/jobs/ftjob-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ftjob-1"})))
        .mount(&server)
        .await;
    let client = client(&server);

    let err = client.retrieve_fine_tuning_job(&api_key(), "ftjob-1").await.unwrap_err();

    assert!(err.is_retryable());
}

#[tokio::test]
async fn rejected_key_is_configuration_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "code": "invalid_api_key"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let provider = Arc::new(client(&server));
    let mut orchestrator =
        JobOrchestrator::new(provider, credentials(), Arc::new(UploadCache::new()), fast_config());
    let file = dataset_file();

    let err = orchestrator
        .run_file(file.path(), "fine-tune", JobOptions::new("gpt-3.5-turbo"))
        .await
        .unwrap_err();

    assert_eq!(err.phase, Phase::Upload);
    assert!(matches!(err.source, TuneError::Configuration(_)));
}

#[tokio::test]
async fn job_runs_to_success() {
    let server = MockServer::start().await;
    mount_upload(&server).await;
    mount_create(&server).await;
    Mock::given(method("GET"))
        .and(path("/fine_tuning/jobs/ftjob-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_body("running")))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    let mut succeeded = job_body("succeeded");
    succeeded["fine_tuned_model"] = json!("ft:gpt-3.5-turbo:org::abc");
    Mock::given(method("GET"))
        .and(path("/fine_tuning/jobs/ftjob-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(succeeded))
        .mount(&server)
        .await;
    let provider = Arc::new(client(&server));
    let mut orchestrator =
        JobOrchestrator::new(provider, credentials(), Arc::new(UploadCache::new()), fast_config());
    let file = dataset_file();

    let outcome = orchestrator
        .run_file(file.path(), "fine-tune", JobOptions::new("gpt-3.5-turbo"))
        .await
        .unwrap();

    assert_eq!(orchestrator.state(), OrchestratorState::Succeeded);
    let record = outcome.into_record();
    assert_eq!(record.id, "ftjob-1");
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.fine_tuned_model.as_deref(), Some("ft:gpt-3.5-turbo:org::abc"));
}

#[tokio::test]
async fn server_errors_are_retried_before_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_upload(&server).await;
    mount_create(&server).await;
    let provider = Arc::new(client(&server));
    let mut orchestrator = JobOrchestrator::new(
        provider,
        credentials(),
        Arc::new(UploadCache::new()),
        fast_config().with_detach(true),
    );
    let file = dataset_file();

    let outcome = orchestrator
        .run_file(file.path(), "fine-tune", JobOptions::new("gpt-3.5-turbo"))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::Submitted(ref r) if r.status == JobStatus::Queued));
}

#[tokio::test]
async fn timeout_leaves_remote_job_alone() {
    let server = MockServer::start().await;
    mount_upload(&server).await;
    mount_create(&server).await;
    Mock::given(method("GET"))
        .and(path("/fine_tuning/jobs/ftjob-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_body("running")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fine_tuning/jobs/ftjob-1/cancel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_body("cancelled")))
        .expect(0)
        .mount(&server)
        .await;
    let provider = Arc::new(client(&server));
    let config = fast_config().with_timeout(Duration::from_millis(150));
    let mut orchestrator =
        JobOrchestrator::new(provider, credentials(), Arc::new(UploadCache::new()), config);
    let file = dataset_file();

    let outcome = orchestrator
        .run_file(file.path(), "fine-tune", JobOptions::new("gpt-3.5-turbo"))
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::TimedOut(ref r) if r.status == JobStatus::Running));
    assert_eq!(orchestrator.state(), OrchestratorState::TimedOut);
}

#[tokio::test]
async fn stalled_request_times_out_as_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fine_tuning/jobs/ftjob-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(job_body("running"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    let client = OpenAI::with_request_timeout(Duration::from_millis(100))
        .unwrap()
        .with_base_url(server.uri());
    let started = std::time::Instant::now();

    let err = client.retrieve_fine_tuning_job(&api_key(), "ftjob-1").await.unwrap_err();

    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn upload_streams_file_with_purpose() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .and(body_string_contains("hola"))
        .and(body_string_contains("fine-tune"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-streamed"})))
        .expect(1)
        .mount(&server)
        .await;
    let file = dataset_file();
    let dataset = DatasetReference::load(file.path(), "fine-tune").await.unwrap();

    let handle = client(&server).upload_file(&api_key(), &dataset).await.unwrap();

    assert_eq!(handle.as_str(), "file-streamed");
}
