use anyhow::{bail, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::api::RetryConfig;
use crate::discovery::DEFAULT_HOSTNAME;
use crate::http::client::RateLimit;
use crate::run::{OrchestratorSettings, PollPolicy};
use crate::workspace::WorkspaceSettings;

/// Name of the TOML configuration file, without extension
pub const CONFIG_FILE: &str = "remote-runs";
/// Extensionless TOML override file
pub const RC_FILE: &str = ".remote-runs-rc";
/// Prefix of environment overrides, e.g. `REMOTE_RUNS_BACKEND__ORGANIZATION`
pub const ENV_PREFIX: &str = "REMOTE_RUNS";

/// Main configuration structure for remote-runs
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteRunsConfig {
    pub backend: BackendConfig,
    pub polling: PollingConfig,
    pub retry: RetrySettings,
    pub confirmation: ConfirmationConfig,
    pub rate_limit: RateLimitConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Host serving the remote API, resolved through service discovery
    pub hostname: String,
    /// Without an organization operations run locally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// API token (can be set via env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub workspaces: WorkspaceSettings,
    pub request_timeout_seconds: u64,
    /// Queue behind another active run instead of failing
    pub wait_for_active_run: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            organization: None,
            token: None,
            workspaces: WorkspaceSettings::default(),
            request_timeout_seconds: 30,
            wait_for_active_run: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_unknown_polls: u32,
    pub max_state_version_polls: u32,
    pub max_active_run_waits: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            interval_ms: policy.interval.as_millis() as u64,
            max_interval_ms: policy.max_interval.as_millis() as u64,
            multiplier: policy.multiplier,
            max_unknown_polls: policy.max_unknown_polls,
            max_state_version_polls: policy.max_state_version_polls,
            max_active_run_waits: policy.max_active_run_waits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            jitter: retry.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Seconds to wait for an operator answer before discarding the run
    pub timeout_seconds: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300, // 5 minutes
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let rate = RateLimit::default();
        Self {
            requests_per_second: rate.requests_per_second,
            burst_capacity: rate.burst_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset
    pub log_level: String,
    /// JSON lines instead of human-readable output
    pub json_logs: bool,
    /// Log API request statistics when an operation finishes
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_enabled: true,
        }
    }
}

impl RemoteRunsConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (remote-runs.toml, .remote-runs-rc)
    /// 3. Environment variables (prefixed with REMOTE_RUNS_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load) with the files looked up in `dir`
    pub fn load_from(dir: &Path) -> Result<Self> {
        Self::load_layered(dir, Self::environment())
    }

    pub fn load_layered(dir: &Path, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let toml_path = dir.join(format!("{CONFIG_FILE}.toml"));
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path).format(FileFormat::Toml));
        }

        let rc_path = dir.join(RC_FILE);
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(FileFormat::Toml));
        }

        builder = builder.add_source(environment);

        let config: RemoteRunsConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `REMOTE_RUNS_<SECTION>__<KEY>` overrides
    pub fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.hostname.trim().is_empty() {
            bail!("backend.hostname must not be empty");
        }
        if self.is_remote() {
            self.backend.workspaces.selector()?;
        }
        if self.polling.interval_ms == 0 {
            bail!("polling.interval_ms must be greater than zero");
        }
        if self.polling.max_interval_ms < self.polling.interval_ms {
            bail!(
                "polling.max_interval_ms ({}) is below polling.interval_ms ({})",
                self.polling.max_interval_ms,
                self.polling.interval_ms
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.rate_limit.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than zero");
        }
        Ok(())
    }

    /// Whether operations go to the remote service rather than run locally
    pub fn is_remote(&self) -> bool {
        self.backend
            .organization
            .as_deref()
            .is_some_and(|org| !org.trim().is_empty())
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.polling.interval_ms),
            max_interval: Duration::from_millis(self.polling.max_interval_ms),
            multiplier: self.polling.multiplier,
            max_unknown_polls: self.polling.max_unknown_polls,
            max_state_version_polls: self.polling.max_state_version_polls,
            max_active_run_waits: self.polling.max_active_run_waits,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            requests_per_second: self.rate_limit.requests_per_second,
            burst_capacity: self.rate_limit.burst_capacity,
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation.timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_seconds)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            poll: self.poll_policy(),
            confirm_timeout: self.confirm_timeout(),
            wait_for_active_run: self.backend.wait_for_active_run,
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
