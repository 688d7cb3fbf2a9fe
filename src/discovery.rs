//! Service discovery: resolve a hostname to the base URL of a named service.
//!
//! Hosts publish a JSON object at [`WELL_KNOWN_PATH`] mapping service ids
//! (such as [`REMOTE_SERVICE_ID`]) to absolute URLs or host-relative paths.

use reqwest::Url;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const WELL_KNOWN_PATH: &str = "/.well-known/terraform.json";
pub const REMOTE_SERVICE_ID: &str = "tfe.v2";
pub const DEFAULT_HOSTNAME: &str = "app.terraform.io";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid hostname {host}: {message}")]
    InvalidHost { host: String, message: String },
    #[error("failed to retrieve discovery document from {host}: {message}")]
    Unreachable { host: String, message: String },
    #[error("host {host} does not provide service {service}")]
    ServiceNotProvided { host: String, service: String },
    #[error("host {host} advertises an invalid URL for {service}: {message}")]
    InvalidServiceUrl {
        host: String,
        service: String,
        message: String,
    },
}

pub type HostServices = HashMap<String, String>;

/// Discovery client with optional per-host overrides
#[derive(Debug, Clone)]
pub struct Disco {
    http: reqwest::Client,
    scheme: String,
    overrides: HashMap<String, HostServices>,
}

impl Default for Disco {
    fn default() -> Self {
        Self::new()
    }
}

impl Disco {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            scheme: "https".to_string(),
            overrides: HashMap::new(),
        }
    }

    /// Use a different scheme for discovery requests, e.g. `http` against a local server
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    /// Answer discovery for `host` from `services` without any network request
    pub fn force_host_services(&mut self, host: &str, services: HostServices) {
        self.overrides.insert(host.to_lowercase(), services);
    }

    fn host_root(&self, host: &str) -> Result<Url, DiscoveryError> {
        if host.is_empty() || host.contains('/') {
            return Err(DiscoveryError::InvalidHost {
                host: host.to_string(),
                message: "hostname must not be empty or contain a path".to_string(),
            });
        }
        Url::parse(&format!("{}://{}/", self.scheme, host)).map_err(|e| {
            DiscoveryError::InvalidHost {
                host: host.to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Fetch the service map advertised by `host`
    pub async fn discover(&self, host: &str) -> Result<HostServices, DiscoveryError> {
        if let Some(services) = self.overrides.get(&host.to_lowercase()) {
            debug!(host, "Using forced host services");
            return Ok(services.clone());
        }

        let root = self.host_root(host)?;
        let url = root
            .join(WELL_KNOWN_PATH.trim_start_matches('/'))
            .map_err(|e| DiscoveryError::InvalidHost {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let unreachable = |e: reqwest::Error| DiscoveryError::Unreachable {
            host: host.to_string(),
            message: e.to_string(),
        };

        info!(host, url = %url, "Discovering remote services");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?;

        let document: HashMap<String, serde_json::Value> =
            response.json().await.map_err(unreachable)?;

        // Non-string entries (such as versioned login metadata) are not service URLs
        Ok(document
            .into_iter()
            .filter_map(|(id, value)| value.as_str().map(|url| (id, url.to_string())))
            .collect())
    }

    /// Resolve the base URL of `service` on `host`
    pub async fn discover_service_url(
        &self,
        host: &str,
        service: &str,
    ) -> Result<Url, DiscoveryError> {
        let services = self.discover(host).await?;
        let raw = services
            .get(service)
            .ok_or_else(|| DiscoveryError::ServiceNotProvided {
                host: host.to_string(),
                service: service.to_string(),
            })?;

        let invalid = |message: String| DiscoveryError::InvalidServiceUrl {
            host: host.to_string(),
            service: service.to_string(),
            message,
        };

        if raw.contains("://") {
            Url::parse(raw).map_err(|e| invalid(e.to_string()))
        } else {
            self.host_root(host)?
                .join(raw)
                .map_err(|e| invalid(e.to_string()))
        }
    }
}
