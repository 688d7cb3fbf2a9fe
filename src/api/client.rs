use async_trait::async_trait;

use crate::api::errors::ApiResult;
use crate::api::types::*;

/// Create/read/list operations against the remote execution service.
///
/// Implementations must map server failures onto [`ApiError`](crate::api::ApiError)
/// so callers can tell retryable transport problems from terminal answers.
/// The orchestrator only ever talks to this trait, which keeps the HTTP client
/// and the in-memory test service interchangeable.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn read_organization(&self, name: &str) -> ApiResult<Organization>;

    async fn read_workspace(&self, organization: &str, name: &str) -> ApiResult<Workspace>;

    /// List workspaces of an organization, optionally filtered by name prefix
    async fn list_workspaces(
        &self,
        organization: &str,
        prefix: Option<&str>,
    ) -> ApiResult<Vec<Workspace>>;

    async fn create_workspace(
        &self,
        organization: &str,
        options: &WorkspaceCreateOptions,
    ) -> ApiResult<Workspace>;

    async fn create_configuration_version(
        &self,
        workspace_id: &str,
        options: &ConfigurationVersionCreateOptions,
    ) -> ApiResult<ConfigurationVersion>;

    /// Upload a packaged (tar.gz) configuration to a pending configuration version
    async fn upload_configuration(
        &self,
        configuration_version: &ConfigurationVersion,
        archive: &[u8],
    ) -> ApiResult<()>;

    async fn read_configuration_version(&self, id: &str) -> ApiResult<ConfigurationVersion>;

    async fn create_run(&self, options: &RunCreateOptions) -> ApiResult<Run>;

    async fn read_run(&self, run_id: &str) -> ApiResult<Run>;

    async fn discard_run(&self, run_id: &str, comment: &str) -> ApiResult<()>;

    async fn cancel_run(&self, run_id: &str, comment: &str) -> ApiResult<()>;

    async fn read_plan(&self, plan_id: &str) -> ApiResult<Plan>;

    async fn list_policy_checks(&self, run_id: &str) -> ApiResult<Vec<PolicyCheck>>;

    async fn read_policy_check(&self, policy_check_id: &str) -> ApiResult<PolicyCheck>;

    async fn override_policy_check(&self, policy_check_id: &str) -> ApiResult<PolicyCheck>;

    /// Confirm a planned run; the service creates and returns its Apply
    async fn create_apply(&self, run_id: &str, comment: &str) -> ApiResult<Apply>;

    async fn read_apply(&self, apply_id: &str) -> ApiResult<Apply>;

    async fn current_state_version(&self, workspace_id: &str) -> ApiResult<StateVersion>;
}
