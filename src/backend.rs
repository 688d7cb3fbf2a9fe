//! Chooses between the remote service and local execution.

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::api::{ApiError, HttpRemoteService, RemoteService, RetryHandler};
use crate::clock::Sleeper;
use crate::config::RemoteRunsConfig;
use crate::confirm::Confirmer;
use crate::credentials::{require_token, CredentialsError, CredentialsSource};
use crate::discovery::{Disco, DiscoveryError, REMOTE_SERVICE_ID};
use crate::http::RateLimitedHttpClient;
use crate::local::{LocalDelegate, LOCAL_WORKSPACE};
use crate::observability::ApiMetrics;
use crate::run::{Operation, RunError, RunOrchestrator, RunReport};
use crate::telemetry::{create_run_span, generate_correlation_id};
use crate::workspace::{ResolveError, WorkspaceResolver};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("failed to build API client: {0}")]
    Client(#[from] ApiError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("no organization is configured; set backend.organization to use the remote service")]
    NotRemote,
}

/// Remote service access for one organization and workspace selection
#[derive(Debug)]
pub struct RemoteBackend {
    resolver: WorkspaceResolver,
    orchestrator: RunOrchestrator,
    metrics: Arc<ApiMetrics>,
}

impl RemoteBackend {
    pub fn new(resolver: WorkspaceResolver, orchestrator: RunOrchestrator) -> Self {
        Self {
            resolver,
            orchestrator,
            metrics: Arc::new(ApiMetrics::new()),
        }
    }

    /// Wire resolver and orchestrator to `service` with the configured policies
    pub fn with_service(
        config: &RemoteRunsConfig,
        service: Arc<dyn RemoteService>,
        confirmer: Arc<dyn Confirmer>,
        sleeper: Arc<dyn Sleeper>,
        metrics: Arc<ApiMetrics>,
    ) -> Result<Self, BackendError> {
        let organization = config
            .backend
            .organization
            .as_deref()
            .ok_or(BackendError::NotRemote)?;
        let retry = RetryHandler::new(config.retry_config(), sleeper.clone())
            .with_metrics(metrics.clone());
        let resolver = WorkspaceResolver::new(
            service.clone(),
            organization,
            &config.backend.workspaces,
            retry.clone(),
        )?;
        let orchestrator = RunOrchestrator::new(
            service,
            confirmer,
            sleeper,
            retry,
            config.orchestrator_settings(),
        )
        .with_metrics(metrics.clone());
        Ok(Self {
            resolver,
            orchestrator,
            metrics,
        })
    }

    /// Discover the API on the configured host and connect to it
    pub async fn connect(
        config: &RemoteRunsConfig,
        disco: &Disco,
        credentials: &dyn CredentialsSource,
        confirmer: Arc<dyn Confirmer>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, BackendError> {
        if !config.is_remote() {
            return Err(BackendError::NotRemote);
        }
        let host = config.backend.hostname.as_str();
        let base_url = disco.discover_service_url(host, REMOTE_SERVICE_ID).await?;
        let token = match config.backend.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => token.to_string(),
            None => require_token(credentials, host)?,
        };
        info!(host = %host, api = %base_url, "Connecting to remote service");

        let metrics = Arc::new(ApiMetrics::new());
        let client = RateLimitedHttpClient::new(
            base_url,
            token,
            config.rate_limit(),
            config.request_timeout(),
            metrics.clone(),
        )?;
        let service: Arc<dyn RemoteService> = Arc::new(HttpRemoteService::new(client));
        Self::with_service(config, service, confirmer, sleeper, metrics)
    }

    pub fn resolver(&self) -> &WorkspaceResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<ApiMetrics> {
        &self.metrics
    }

    /// Resolve the workspace for `env` and drive `op` against it
    pub async fn operation(
        &self,
        op: &Operation,
        env: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let workspace = self.resolver.resolve_named(env).await?;
        let correlation_id = generate_correlation_id();
        let span = create_run_span(
            &op.kind.to_string(),
            Some(self.resolver.organization_name()),
            &workspace.name,
            &correlation_id,
        );
        self.orchestrator
            .execute(&workspace, op, cancel)
            .instrument(span)
            .await
    }

    pub async fn workspaces(&self) -> Result<Vec<String>, ResolveError> {
        self.resolver.workspace_names().await
    }
}

pub enum Backend {
    Remote(RemoteBackend),
    Local(LocalDelegate),
}

impl Backend {
    pub fn is_remote(&self) -> bool {
        matches!(self, Backend::Remote(_))
    }

    /// Run `op` in environment `env`; local execution only has the default environment
    pub async fn operation(
        &self,
        op: &Operation,
        env: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        match self {
            Backend::Remote(remote) => remote.operation(op, env, cancel).await,
            Backend::Local(local) => {
                if env != crate::workspace::DEFAULT_ENVIRONMENT {
                    return Err(RunError::Resolve(ResolveError::Configuration(format!(
                        "local execution only supports the {} environment, not {env}",
                        crate::workspace::DEFAULT_ENVIRONMENT
                    ))));
                }
                let span = create_run_span(
                    &op.kind.to_string(),
                    None,
                    LOCAL_WORKSPACE,
                    &generate_correlation_id(),
                );
                local.operation(op, cancel).instrument(span).await
            }
        }
    }

    pub async fn workspaces(&self) -> Result<Vec<String>, ResolveError> {
        match self {
            Backend::Remote(remote) => remote.workspaces().await,
            Backend::Local(_) => Ok(vec![crate::workspace::DEFAULT_ENVIRONMENT.to_string()]),
        }
    }
}
