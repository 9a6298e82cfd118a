use crate::core::error::{TuneError, TuneResult};
use log::{debug, info};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Source of the API key. Implementations must be safe to share between jobs.
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self) -> TuneResult<SecretString>;
}

/// Reads the key from an environment variable on every lookup.
pub struct EnvCredentialProvider {
    var_name: String,
}

impl EnvCredentialProvider {
    pub fn new(var_name: impl Into<String>) -> Self {
        Self { var_name: var_name.into() }
    }

    pub fn var_name(&self) -> &str {
        &self.var_name
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new(DEFAULT_API_KEY_VAR)
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn api_key(&self) -> TuneResult<SecretString> {
        debug!("Reading API key from {}", self.var_name);
        let value = env::var(&self.var_name)
            .map_err(|_| TuneError::Configuration(format!("{} must be set", self.var_name)))?;
        let key = SecretString::new(value);
        if key.expose_secret().trim().is_empty() {
            return Err(TuneError::Configuration(format!("{} is empty", self.var_name)));
        }
        Ok(key)
    }
}

/// Loads a `.env` file into the process environment. Variables that are
/// already set keep their values. Without an explicit path `.env` is looked
/// up from the working directory upwards, and not finding one is fine.
pub fn load_dotenv(path: Option<&Path>) -> TuneResult<Option<PathBuf>> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|_| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => {
            info!("Loaded environment from {:?}", path);
            Ok(Some(path))
        }
        Err(e) if path.is_none() && e.not_found() => Ok(None),
        Err(e) => Err(TuneError::Configuration(format!("failed to load .env file: {}", e))),
    }
}

/// A fixed key, for callers that resolve credentials themselves.
pub struct StaticCredentialProvider {
    api_key: String,
}

impl StaticCredentialProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into() }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn api_key(&self) -> TuneResult<SecretString> {
        if self.api_key.trim().is_empty() {
            return Err(TuneError::Configuration("API key is empty".to_string()));
        }
        Ok(SecretString::new(self.api_key.clone()))
    }
}
