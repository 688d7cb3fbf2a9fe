//! API token lookup per service hostname.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("no API token configured for {host}; set backend.token or {env_var}")]
    Missing { host: String, env_var: String },
}

pub trait CredentialsSource: Send + Sync {
    fn token_for(&self, host: &str) -> Option<String>;
}

/// Fixed host → token map
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, host: &str, token: &str) -> Self {
        self.tokens.insert(host.to_lowercase(), token.to_string());
        self
    }
}

impl CredentialsSource for StaticCredentials {
    fn token_for(&self, host: &str) -> Option<String> {
        self.tokens.get(&host.to_lowercase()).cloned()
    }
}

/// Tokens from `REMOTE_RUNS_TOKEN_<HOST>` variables, e.g.
/// `REMOTE_RUNS_TOKEN_APP_TERRAFORM_IO` for `app.terraform.io`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn variable_for(host: &str) -> String {
        let suffix: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("REMOTE_RUNS_TOKEN_{suffix}")
    }
}

impl CredentialsSource for EnvCredentials {
    fn token_for(&self, host: &str) -> Option<String> {
        std::env::var(Self::variable_for(host))
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// First source that knows a token wins
#[derive(Clone, Default)]
pub struct ChainedCredentials {
    sources: Vec<Arc<dyn CredentialsSource>>,
}

impl ChainedCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, source: Arc<dyn CredentialsSource>) -> Self {
        self.sources.push(source);
        self
    }
}

impl CredentialsSource for ChainedCredentials {
    fn token_for(&self, host: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.token_for(host))
    }
}

pub fn require_token(
    source: &dyn CredentialsSource,
    host: &str,
) -> Result<String, CredentialsError> {
    source
        .token_for(host)
        .ok_or_else(|| CredentialsError::Missing {
            host: host.to_string(),
            env_var: EnvCredentials::variable_for(host),
        })
}
