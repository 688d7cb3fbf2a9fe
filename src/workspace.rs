//! Locate (or create) the workspace a run targets.
//!
//! A backend is configured with exactly one of a workspace `name` or a
//! `prefix`. With a name there is a single workspace, reachable through the
//! environment name `default`. With a prefix every workspace whose name
//! starts with it is an environment, addressed by the remainder of its name.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

use crate::api::types::{Organization, Workspace, WorkspaceCreateOptions};
use crate::api::{ApiError, RemoteService, RetryHandler};

pub const DEFAULT_ENVIRONMENT: &str = "default";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid workspace configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceSelector {
    Name(String),
    Prefix(String),
}

impl WorkspaceSettings {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            prefix: None,
        }
    }

    pub fn prefixed(prefix: &str) -> Self {
        Self {
            name: None,
            prefix: Some(prefix.to_string()),
        }
    }

    /// Validate that exactly one of name and prefix is set; empty strings count as unset
    pub fn selector(&self) -> Result<WorkspaceSelector, ResolveError> {
        let name = self.name.as_deref().filter(|s| !s.is_empty());
        let prefix = self.prefix.as_deref().filter(|s| !s.is_empty());
        match (name, prefix) {
            (Some(name), None) => Ok(WorkspaceSelector::Name(name.to_string())),
            (None, Some(prefix)) => Ok(WorkspaceSelector::Prefix(prefix.to_string())),
            (Some(_), Some(_)) => Err(ResolveError::Configuration(
                "only one of workspace name or prefix may be set".to_string(),
            )),
            (None, None) => Err(ResolveError::Configuration(
                "either workspace name or prefix is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Single(Workspace),
    Matching(Vec<Workspace>),
}

impl Resolution {
    pub fn into_workspaces(self) -> Vec<Workspace> {
        match self {
            Resolution::Single(ws) => vec![ws],
            Resolution::Matching(list) => list,
        }
    }
}

#[derive(Clone)]
pub struct WorkspaceResolver {
    service: Arc<dyn RemoteService>,
    organization: String,
    selector: WorkspaceSelector,
    retry: RetryHandler,
}

impl std::fmt::Debug for WorkspaceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceResolver")
            .field("organization", &self.organization)
            .field("selector", &self.selector)
            .finish()
    }
}

impl WorkspaceResolver {
    pub fn new(
        service: Arc<dyn RemoteService>,
        organization: &str,
        settings: &WorkspaceSettings,
        retry: RetryHandler,
    ) -> Result<Self, ResolveError> {
        if organization.is_empty() {
            return Err(ResolveError::Configuration(
                "organization is required for the remote backend".to_string(),
            ));
        }
        Ok(Self {
            service,
            organization: organization.to_string(),
            selector: settings.selector()?,
            retry,
        })
    }

    pub fn selector(&self) -> &WorkspaceSelector {
        &self.selector
    }

    pub fn organization_name(&self) -> &str {
        &self.organization
    }

    /// Read the configured organization; a missing one is a configuration problem
    pub async fn organization(&self) -> Result<Organization, ResolveError> {
        let service = &self.service;
        let name = self.organization.as_str();
        match self
            .retry
            .execute_with_retry("read_organization", move || async move {
                service.read_organization(name).await
            })
            .await
        {
            Ok(org) => Ok(org),
            Err(err) if err.is_not_found() => Err(ResolveError::Configuration(format!(
                "organization {name} does not exist or is not accessible with this token"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Resolve the selector: one workspace by name, or the set matching the prefix
    #[instrument(skip(self), fields(organization = %self.organization))]
    pub async fn resolve(&self) -> Result<Resolution, ResolveError> {
        match &self.selector {
            WorkspaceSelector::Name(name) => Ok(Resolution::Single(self.find_or_create(name).await?)),
            WorkspaceSelector::Prefix(prefix) => {
                self.organization().await?;
                Ok(Resolution::Matching(self.list_prefixed(prefix).await?))
            }
        }
    }

    /// Workspace backing environment `env`
    pub async fn resolve_named(&self, env: &str) -> Result<Workspace, ResolveError> {
        match &self.selector {
            WorkspaceSelector::Name(name) if env == DEFAULT_ENVIRONMENT => {
                self.find_or_create(name).await
            }
            WorkspaceSelector::Name(name) => Err(ResolveError::Configuration(format!(
                "workspace {name} is configured by name; only the {DEFAULT_ENVIRONMENT} environment is available, not {env}"
            ))),
            WorkspaceSelector::Prefix(_) if env.is_empty() || env == DEFAULT_ENVIRONMENT => {
                Err(ResolveError::Configuration(format!(
                    "an environment name is required when workspaces are selected by prefix (got {env:?})"
                )))
            }
            WorkspaceSelector::Prefix(prefix) => {
                self.find_or_create(&format!("{prefix}{env}")).await
            }
        }
    }

    /// Environment names available to this backend
    pub async fn workspace_names(&self) -> Result<Vec<String>, ResolveError> {
        match &self.selector {
            WorkspaceSelector::Name(_) => Ok(vec![DEFAULT_ENVIRONMENT.to_string()]),
            WorkspaceSelector::Prefix(prefix) => {
                self.organization().await?;
                let mut names: Vec<String> = self
                    .list_prefixed(prefix)
                    .await?
                    .into_iter()
                    .filter_map(|w| w.name.strip_prefix(prefix.as_str()).map(str::to_string))
                    .filter(|env| !env.is_empty())
                    .collect();
                names.sort();
                Ok(names)
            }
        }
    }

    async fn list_prefixed(&self, prefix: &str) -> Result<Vec<Workspace>, ResolveError> {
        let service = &self.service;
        let org = self.organization.as_str();
        let workspaces = self
            .retry
            .execute_with_retry("list_workspaces", move || async move {
                service.list_workspaces(org, Some(prefix)).await
            })
            .await?;
        Ok(workspaces
            .into_iter()
            .filter(|w| w.name.starts_with(prefix))
            .collect())
    }

    async fn find_or_create(&self, name: &str) -> Result<Workspace, ResolveError> {
        let org = self.organization().await?;
        let service = &self.service;
        let org_name = org.name.as_str();

        let read = move || async move {
            self.retry
                .execute_with_retry("read_workspace", move || async move {
                    service.read_workspace(org_name, name).await
                })
                .await
        };

        match read().await {
            Ok(workspace) => return Ok(workspace),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        if !org.permissions.can_create_workspace {
            return Err(ResolveError::Configuration(format!(
                "workspace {name} does not exist in {org_name} and this token cannot create workspaces"
            )));
        }

        let options = WorkspaceCreateOptions::named(name);
        let options = &options;
        let created = self
            .retry
            .execute_with_retry("create_workspace", move || async move {
                service.create_workspace(org_name, options).await
            })
            .await;

        match created {
            Ok(workspace) => {
                info!(workspace = %workspace.name, id = %workspace.id, "Created workspace");
                Ok(workspace)
            }
            // Someone else created it between our read and create
            Err(err) if err.is_conflict() => Ok(read().await?),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InMemoryService, RetryConfig};
    use crate::clock::RecordingSleeper;

    fn resolver(service: Arc<InMemoryService>, settings: WorkspaceSettings) -> WorkspaceResolver {
        let retry = RetryHandler::new(RetryConfig::default(), Arc::new(RecordingSleeper::new()));
        WorkspaceResolver::new(service, "hashicorp", &settings, retry).unwrap()
    }

    #[test]
    fn test_selector_requires_exactly_one() {
        assert!(WorkspaceSettings::default().selector().is_err());
        assert!(WorkspaceSettings {
            name: Some("prod".into()),
            prefix: Some("my-app-".into()),
        }
        .selector()
        .is_err());
        assert_eq!(
            WorkspaceSettings {
                name: Some(String::new()),
                prefix: Some("my-app-".into()),
            }
            .selector()
            .unwrap(),
            WorkspaceSelector::Prefix("my-app-".into())
        );
    }

    #[tokio::test]
    async fn test_existing_workspace_is_reused() {
        let service = Arc::new(InMemoryService::new());
        service.add_organization("hashicorp", true);
        let existing = service.add_workspace("hashicorp", WorkspaceCreateOptions::named("prod"));

        let resolved = resolver(service.clone(), WorkspaceSettings::named("prod"))
            .resolve_named(DEFAULT_ENVIRONMENT)
            .await
            .unwrap();
        assert_eq!(resolved, existing);
        assert_eq!(service.calls("create_workspace"), 0);
    }

    #[tokio::test]
    async fn test_missing_workspace_without_permission() {
        let service = Arc::new(InMemoryService::new());
        service.add_organization("hashicorp", false);

        let err = resolver(service.clone(), WorkspaceSettings::named("prod"))
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Configuration(_)));
        assert_eq!(service.calls("create_workspace"), 0);
    }

    #[tokio::test]
    async fn test_create_conflict_rereads_workspace() {
        let service = Arc::new(InMemoryService::new());
        service.add_organization("hashicorp", true);
        service.fail_next("read_workspace", ApiError::not_found("workspace hashicorp/prod"));
        service.add_workspace("hashicorp", WorkspaceCreateOptions::named("prod"));

        let ws = resolver(service.clone(), WorkspaceSettings::named("prod"))
            .resolve_named(DEFAULT_ENVIRONMENT)
            .await
            .unwrap();
        assert_eq!(ws.name, "prod");
        assert_eq!(service.calls("create_workspace"), 1);
        assert_eq!(service.calls("read_workspace"), 2);
    }

    #[tokio::test]
    async fn test_name_mode_rejects_other_environments() {
        let service = Arc::new(InMemoryService::new());
        service.add_organization("hashicorp", true);

        let err = resolver(service, WorkspaceSettings::named("prod"))
            .resolve_named("staging")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Configuration(_)));
    }
}
