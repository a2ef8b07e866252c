//! Management API key lookup.

use crate::options::IdentityOptions;
use std::path::PathBuf;

/// Where to look for the control-plane API key: env var first, then each
/// `.env` file in order.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    env_var: String,
    files: Vec<PathBuf>,
}

impl CredentialSource {
    pub fn new(env_var: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            env_var: env_var.into(),
            files,
        }
    }

    pub fn from_options(options: &IdentityOptions) -> Self {
        Self::new(options.api_key_env.clone(), options.api_key_files.clone())
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    pub fn api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(&self.env_var) {
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Some(key);
            }
        }

        self.files.iter().find_map(|path| {
            let entries = dotenvy::from_path_iter(path).ok()?;
            let key = entries
                .filter_map(Result::ok)
                .find(|(k, v)| k == &self.env_var && !v.is_empty())
                .map(|(_, v)| v)?;
            tracing::debug!(path = %path.display(), "Found API key in env file");
            Some(key)
        })
    }
}
