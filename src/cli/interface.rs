use anyhow::{Context, Result};
use crate::adapters::credentials::{load_dotenv, CredentialProvider, EnvCredentialProvider};
use crate::adapters::openai::*;
use crate::core::job::{HyperparameterValue, Hyperparameters, JobRecord, Outcome};
use crate::core::orchestrator::*;
use crate::core::uploader::UploadCache;
use crate::utils::lib::*;
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::Duration;

pub async fn run_cli_interface() -> Result<ExitCode> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    load_dotenv(args.env_file.as_deref())
        .context("Failed to load environment file")?;
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(EnvCredentialProvider::new(args.api_key_env.clone()));
    let provider = OpenAI::with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .context("Failed to create OpenAI client")?
        .with_base_url(args.base_url.clone());
    let provider = Arc::new(provider);
    let spinner = create_spinner()
        .context("Failed to create progress spinner")?;

    let mut orchestrator = JobOrchestrator::new(
        provider,
        credentials,
        Arc::new(UploadCache::new()),
        build_config(&args),
    )
    .with_progress(spinner);

    info!("Run {} uploading {:?}", orchestrator.run_id(), args.file);
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping local tracking");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run_file(&args.file, &args.purpose, build_options(&args))
        .await
        .map_err(|e| {
            error!("{}", e);
            e
        })
        .context("Fine-tuning run failed")?;

    print_record(outcome.record())
        .context("Failed to print job record")?;
    Ok(exit_code_for(&outcome))
}

pub fn build_config(args: &Args) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry(RetryPolicy::default().with_max_attempts(args.max_attempts))
        .with_poll_interval(Duration::from_secs(args.poll_interval_secs))
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .with_detach(args.detach)
}

pub fn build_options(args: &Args) -> JobOptions {
    let mut options = JobOptions::new(args.model.clone());
    if let Some(suffix) = &args.suffix {
        options = options.with_suffix(suffix.clone());
    }
    if let Some(n_epochs) = args.n_epochs {
        options = options.with_hyperparameters(Hyperparameters {
            n_epochs: Some(HyperparameterValue::Integer(u64::from(n_epochs))),
            ..Default::default()
        });
    }
    if let Some(path) = &args.validation_file {
        options = options.with_validation_file(path.clone());
    }
    options
}

pub fn exit_code_for(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::Succeeded(_) | Outcome::Submitted(_) => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    }
}

fn print_record(record: &JobRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)
        .context("Failed to serialize job record")?;
    println!("{}", json);
    Ok(())
}
