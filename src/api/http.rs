use async_trait::async_trait;
use tracing::debug;

use crate::api::client::RemoteService;
use crate::api::errors::{ApiError, ApiResult};
use crate::api::types::*;
use crate::api::wire::{self, Document, ListDocument};
use crate::http::RateLimitedHttpClient;

const PAGE_SIZE: u32 = 100;

/// [`RemoteService`] over the JSON:API HTTP interface
#[derive(Debug)]
pub struct HttpRemoteService {
    client: RateLimitedHttpClient,
}

impl HttpRemoteService {
    pub fn new(client: RateLimitedHttpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RateLimitedHttpClient {
        &self.client
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn read_organization(&self, name: &str) -> ApiResult<Organization> {
        let doc: Document<wire::OrganizationAttributes> = self
            .client
            .get_json(
                &format!("organization {name}"),
                &format!("organizations/{name}"),
                &[],
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn read_workspace(&self, organization: &str, name: &str) -> ApiResult<Workspace> {
        let doc: Document<wire::WorkspaceAttributes> = self
            .client
            .get_json(
                &format!("workspace {organization}/{name}"),
                &format!("organizations/{organization}/workspaces/{name}"),
                &[],
            )
            .await?;
        Ok(wire::workspace_from(organization, doc.data))
    }

    async fn list_workspaces(
        &self,
        organization: &str,
        prefix: Option<&str>,
    ) -> ApiResult<Vec<Workspace>> {
        let resource = format!("workspaces of {organization}");
        let path = format!("organizations/{organization}/workspaces");
        let mut workspaces = Vec::new();
        let mut page = 1;

        loop {
            let mut query = vec![
                ("page[number]", page.to_string()),
                ("page[size]", PAGE_SIZE.to_string()),
            ];
            if let Some(prefix) = prefix {
                query.push(("search[name]", prefix.to_string()));
            }

            let doc: ListDocument<wire::WorkspaceAttributes> =
                self.client.get_json(&resource, &path, &query).await?;
            let next = doc.next_page();
            workspaces.extend(
                doc.data
                    .into_iter()
                    .map(|res| wire::workspace_from(organization, res)),
            );

            match next {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        // The search parameter matches substrings; keep true prefix matches only
        if let Some(prefix) = prefix {
            workspaces.retain(|w| w.name.starts_with(prefix));
        }
        debug!(organization, count = workspaces.len(), "Listed workspaces");
        Ok(workspaces)
    }

    async fn create_workspace(
        &self,
        organization: &str,
        options: &WorkspaceCreateOptions,
    ) -> ApiResult<Workspace> {
        let doc: Document<wire::WorkspaceAttributes> = self
            .client
            .post_json(
                &format!("workspace {organization}/{}", options.name),
                &format!("organizations/{organization}/workspaces"),
                &wire::workspace_create_body(options),
            )
            .await?;
        Ok(wire::workspace_from(organization, doc.data))
    }

    async fn create_configuration_version(
        &self,
        workspace_id: &str,
        options: &ConfigurationVersionCreateOptions,
    ) -> ApiResult<ConfigurationVersion> {
        let doc: Document<wire::ConfigurationVersionAttributes> = self
            .client
            .post_json(
                &format!("configuration version for {workspace_id}"),
                &format!("workspaces/{workspace_id}/configuration-versions"),
                &wire::configuration_version_create_body(options),
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn upload_configuration(
        &self,
        configuration_version: &ConfigurationVersion,
        archive: &[u8],
    ) -> ApiResult<()> {
        let url = configuration_version
            .upload_url
            .as_deref()
            .ok_or_else(|| ApiError::Decode {
                message: format!(
                    "configuration version {} has no upload url",
                    configuration_version.id
                ),
            })?;
        self.client
            .put_bytes(
                &format!("configuration version {}", configuration_version.id),
                url,
                archive.to_vec(),
            )
            .await
    }

    async fn read_configuration_version(&self, id: &str) -> ApiResult<ConfigurationVersion> {
        let doc: Document<wire::ConfigurationVersionAttributes> = self
            .client
            .get_json(
                &format!("configuration version {id}"),
                &format!("configuration-versions/{id}"),
                &[],
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn create_run(&self, options: &RunCreateOptions) -> ApiResult<Run> {
        let doc: Document<wire::RunAttributes> = self
            .client
            .post_json(
                &format!("run in {}", options.workspace_id),
                "runs",
                &wire::run_create_body(options),
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn read_run(&self, run_id: &str) -> ApiResult<Run> {
        let doc: Document<wire::RunAttributes> = self
            .client
            .get_json(&format!("run {run_id}"), &format!("runs/{run_id}"), &[])
            .await?;
        Ok(doc.data.into())
    }

    async fn discard_run(&self, run_id: &str, comment: &str) -> ApiResult<()> {
        self.client
            .post_action(
                &format!("run {run_id}"),
                &format!("runs/{run_id}/actions/discard"),
                &wire::comment_body(comment),
            )
            .await
    }

    async fn cancel_run(&self, run_id: &str, comment: &str) -> ApiResult<()> {
        self.client
            .post_action(
                &format!("run {run_id}"),
                &format!("runs/{run_id}/actions/cancel"),
                &wire::comment_body(comment),
            )
            .await
    }

    async fn read_plan(&self, plan_id: &str) -> ApiResult<Plan> {
        let doc: Document<wire::ChangeAttributes> = self
            .client
            .get_json(&format!("plan {plan_id}"), &format!("plans/{plan_id}"), &[])
            .await?;
        Ok(doc.data.into())
    }

    async fn list_policy_checks(&self, run_id: &str) -> ApiResult<Vec<PolicyCheck>> {
        let doc: ListDocument<wire::PolicyCheckAttributes> = self
            .client
            .get_json(
                &format!("policy checks of {run_id}"),
                &format!("runs/{run_id}/policy-checks"),
                &[],
            )
            .await?;
        Ok(doc.data.into_iter().map(PolicyCheck::from).collect())
    }

    async fn read_policy_check(&self, policy_check_id: &str) -> ApiResult<PolicyCheck> {
        let doc: Document<wire::PolicyCheckAttributes> = self
            .client
            .get_json(
                &format!("policy check {policy_check_id}"),
                &format!("policy-checks/{policy_check_id}"),
                &[],
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn override_policy_check(&self, policy_check_id: &str) -> ApiResult<PolicyCheck> {
        let doc: Document<wire::PolicyCheckAttributes> = self
            .client
            .post_json(
                &format!("policy check {policy_check_id}"),
                &format!("policy-checks/{policy_check_id}/actions/override"),
                &serde_json::Value::Null,
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn create_apply(&self, run_id: &str, comment: &str) -> ApiResult<Apply> {
        self.client
            .post_action(
                &format!("run {run_id}"),
                &format!("runs/{run_id}/actions/apply"),
                &wire::comment_body(comment),
            )
            .await?;

        let run = self.read_run(run_id).await?;
        let apply_id = run.apply_id.ok_or_else(|| ApiError::Decode {
            message: format!("run {run_id} was confirmed but has no apply"),
        })?;
        self.read_apply(&apply_id).await
    }

    async fn read_apply(&self, apply_id: &str) -> ApiResult<Apply> {
        let doc: Document<wire::ChangeAttributes> = self
            .client
            .get_json(
                &format!("apply {apply_id}"),
                &format!("applies/{apply_id}"),
                &[],
            )
            .await?;
        Ok(doc.data.into())
    }

    async fn current_state_version(&self, workspace_id: &str) -> ApiResult<StateVersion> {
        let doc: Document<wire::StateVersionAttributes> = self
            .client
            .get_json(
                &format!("current state version of {workspace_id}"),
                &format!("workspaces/{workspace_id}/current-state-version"),
                &[],
            )
            .await?;
        Ok(wire::state_version_from(workspace_id, doc.data))
    }
}
