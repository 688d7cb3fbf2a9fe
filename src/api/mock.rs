//! In-memory remote service with scripted run progression.
//!
//! Every `read_*` call on a run, policy check, or apply advances that entity
//! by one scripted status, so a test can describe a whole remote run up
//! front and let the orchestrator poll its way through it.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::api::client::RemoteService;
use crate::api::errors::{ApiError, ApiResult};
use crate::api::types::*;

/// Scripted progression of a policy check after the plan finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyScript {
    pub statuses: Vec<PolicyStatus>,
    pub overridable: bool,
}

impl PolicyScript {
    pub fn passing() -> Self {
        Self {
            statuses: vec![PolicyStatus::Passed],
            overridable: false,
        }
    }

    pub fn failing(overridable: bool) -> Self {
        Self {
            statuses: vec![PolicyStatus::Failed],
            overridable,
        }
    }
}

/// What the next created run will do when polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScript {
    pub run_statuses: Vec<RunStatus>,
    pub plan_changes: ResourceChanges,
    pub policy_checks: Vec<PolicyScript>,
    pub apply_statuses: Vec<ApplyStatus>,
    /// Plan statuses reported before the plan catches up with the run
    pub plan_lag: Vec<PlanStatus>,
    /// Whether auto-apply workspaces start the apply on their own
    pub starts_auto_apply: bool,
}

impl Default for RunScript {
    fn default() -> Self {
        Self {
            run_statuses: vec![RunStatus::Pending, RunStatus::Planning, RunStatus::Planned],
            plan_changes: ResourceChanges::new(1, 0, 0),
            policy_checks: Vec::new(),
            apply_statuses: vec![ApplyStatus::Running, ApplyStatus::Finished],
            plan_lag: Vec::new(),
            starts_auto_apply: true,
        }
    }
}

impl RunScript {
    pub fn no_changes() -> Self {
        Self {
            plan_changes: ResourceChanges::default(),
            ..Self::default()
        }
    }

    pub fn with_changes(mut self, changes: ResourceChanges) -> Self {
        self.plan_changes = changes;
        self
    }

    pub fn with_run_statuses(mut self, statuses: Vec<RunStatus>) -> Self {
        self.run_statuses = statuses;
        self
    }

    pub fn with_policy(mut self, policy: PolicyScript) -> Self {
        self.policy_checks.push(policy);
        self
    }

    pub fn with_apply_statuses(mut self, statuses: Vec<ApplyStatus>) -> Self {
        self.apply_statuses = statuses;
        self
    }

    pub fn with_plan_lag(mut self, statuses: Vec<PlanStatus>) -> Self {
        self.plan_lag = statuses;
        self
    }

    pub fn without_auto_apply_start(mut self) -> Self {
        self.starts_auto_apply = false;
        self
    }
}

#[derive(Debug)]
struct MockRun {
    run: Run,
    statuses: VecDeque<RunStatus>,
    speculative: bool,
    changes: ResourceChanges,
    apply_statuses: Vec<ApplyStatus>,
    plan_lag: VecDeque<PlanStatus>,
    starts_auto_apply: bool,
}

#[derive(Debug)]
struct MockPolicy {
    check: PolicyCheck,
    statuses: VecDeque<PolicyStatus>,
}

#[derive(Debug)]
struct MockApply {
    apply: Apply,
    run_id: String,
    workspace_id: String,
    statuses: VecDeque<ApplyStatus>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    organizations: BTreeMap<String, Organization>,
    workspaces: BTreeMap<(String, String), Workspace>,
    configuration_versions: HashMap<String, ConfigurationVersion>,
    uploads: HashMap<String, Vec<u8>>,
    runs: HashMap<String, MockRun>,
    policy_checks: HashMap<String, MockPolicy>,
    applies: HashMap<String, MockApply>,
    serials: HashMap<String, u64>,
    script: RunScript,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
    calls: HashMap<&'static str, usize>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }

    fn enter(&mut self, method: &'static str) -> ApiResult<()> {
        *self.calls.entry(method).or_insert(0) += 1;
        match self.failures.get_mut(method).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn workspace_by_id(&self, workspace_id: &str) -> Option<&Workspace> {
        self.workspaces.values().find(|w| w.id == workspace_id)
    }

    fn start_apply(&mut self, run_id: &str) -> ApiResult<Apply> {
        let apply_id = self.next_id("apply");
        let mock = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;

        let apply = Apply {
            id: apply_id.clone(),
            status: ApplyStatus::Pending,
            changes: mock.changes,
        };
        mock.run.status = RunStatus::Applying;
        mock.run.apply_id = Some(apply_id.clone());
        mock.statuses.clear();

        let mock_apply = MockApply {
            apply: apply.clone(),
            run_id: run_id.to_string(),
            workspace_id: mock.run.workspace_id.clone(),
            statuses: mock.apply_statuses.iter().cloned().collect(),
        };
        self.applies.insert(apply_id, mock_apply);
        Ok(apply)
    }

    fn policies_settled(&self, run: &Run) -> bool {
        run.policy_check_ids.iter().all(|id| {
            self.policy_checks
                .get(id)
                .map(|p| p.check.status.allows_apply())
                .unwrap_or(true)
        })
    }
}

/// Thread-safe in-memory [`RemoteService`]
#[derive(Debug, Default)]
pub struct InMemoryService {
    state: Mutex<State>,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, script: RunScript) -> Self {
        self.set_script(script);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script used by every run created from now on
    pub fn set_script(&self, script: RunScript) {
        self.state().script = script;
    }

    pub fn add_organization(&self, name: &str, can_create_workspace: bool) -> Organization {
        let org = Organization {
            name: name.to_string(),
            email: Some(format!("admin@{name}.example")),
            permissions: OrganizationPermissions {
                can_create_workspace,
                can_update: true,
                can_destroy: true,
            },
        };
        self.state()
            .organizations
            .insert(name.to_string(), org.clone());
        org
    }

    pub fn add_workspace(&self, organization: &str, options: WorkspaceCreateOptions) -> Workspace {
        let mut state = self.state();
        let workspace = Workspace {
            id: state.next_id("ws"),
            name: options.name.clone(),
            organization: organization.to_string(),
            working_directory: options.working_directory,
            auto_apply: options.auto_apply,
        };
        state.workspaces.insert(
            (organization.to_string(), options.name),
            workspace.clone(),
        );
        workspace
    }

    /// Make the next call to `method` fail with `err`; queued per method
    pub fn fail_next(&self, method: &'static str, err: ApiError) {
        self.state()
            .failures
            .entry(method)
            .or_default()
            .push_back(err);
    }

    /// Number of times `method` has been called, failed calls included
    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    pub fn set_state_serial(&self, workspace_id: &str, serial: u64) {
        self.state()
            .serials
            .insert(workspace_id.to_string(), serial);
    }

    pub fn state_serial(&self, workspace_id: &str) -> Option<u64> {
        self.state().serials.get(workspace_id).copied()
    }

    pub fn workspace(&self, organization: &str, name: &str) -> Option<Workspace> {
        self.state()
            .workspaces
            .get(&(organization.to_string(), name.to_string()))
            .cloned()
    }

    /// Current snapshot of a run without advancing its script
    pub fn run(&self, run_id: &str) -> Option<Run> {
        self.state().runs.get(run_id).map(|m| m.run.clone())
    }

    pub fn runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.state().runs.values().map(|m| m.run.clone()).collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        runs
    }

    pub fn uploaded_archive(&self, configuration_version_id: &str) -> Option<Vec<u8>> {
        self.state()
            .uploads
            .get(configuration_version_id)
            .cloned()
    }
}

#[async_trait]
impl RemoteService for InMemoryService {
    async fn read_organization(&self, name: &str) -> ApiResult<Organization> {
        let mut state = self.state();
        state.enter("read_organization")?;
        state
            .organizations
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("organization {name}")))
    }

    async fn read_workspace(&self, organization: &str, name: &str) -> ApiResult<Workspace> {
        let mut state = self.state();
        state.enter("read_workspace")?;
        state
            .workspaces
            .get(&(organization.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("workspace {organization}/{name}")))
    }

    async fn list_workspaces(
        &self,
        organization: &str,
        prefix: Option<&str>,
    ) -> ApiResult<Vec<Workspace>> {
        let mut state = self.state();
        state.enter("list_workspaces")?;
        if !state.organizations.contains_key(organization) {
            return Err(ApiError::not_found(format!("organization {organization}")));
        }
        Ok(state
            .workspaces
            .values()
            .filter(|w| w.organization == organization)
            .filter(|w| prefix.map_or(true, |p| w.name.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn create_workspace(
        &self,
        organization: &str,
        options: &WorkspaceCreateOptions,
    ) -> ApiResult<Workspace> {
        let mut state = self.state();
        state.enter("create_workspace")?;
        let org = state
            .organizations
            .get(organization)
            .ok_or_else(|| ApiError::not_found(format!("organization {organization}")))?;
        if !org.permissions.can_create_workspace {
            return Err(ApiError::Unauthorized {
                message: format!("cannot create workspaces in {organization}"),
            });
        }

        let key = (organization.to_string(), options.name.clone());
        if state.workspaces.contains_key(&key) {
            return Err(ApiError::conflict(
                format!("workspace {organization}/{}", options.name),
                "name has already been taken",
            ));
        }

        let workspace = Workspace {
            id: state.next_id("ws"),
            name: options.name.clone(),
            organization: organization.to_string(),
            working_directory: options.working_directory.clone(),
            auto_apply: options.auto_apply,
        };
        state.workspaces.insert(key, workspace.clone());
        Ok(workspace)
    }

    async fn create_configuration_version(
        &self,
        workspace_id: &str,
        options: &ConfigurationVersionCreateOptions,
    ) -> ApiResult<ConfigurationVersion> {
        let mut state = self.state();
        state.enter("create_configuration_version")?;
        if state.workspace_by_id(workspace_id).is_none() {
            return Err(ApiError::not_found(format!("workspace {workspace_id}")));
        }

        let id = state.next_id("cv");
        let cv = ConfigurationVersion {
            upload_url: Some(format!("memory://uploads/{id}")),
            id: id.clone(),
            status: ConfigurationStatus::Pending,
            source: Some("remote-runs".to_string()),
            speculative: options.speculative,
        };
        state.configuration_versions.insert(id, cv.clone());
        Ok(cv)
    }

    async fn upload_configuration(
        &self,
        configuration_version: &ConfigurationVersion,
        archive: &[u8],
    ) -> ApiResult<()> {
        let mut state = self.state();
        state.enter("upload_configuration")?;
        let id = configuration_version.id.clone();
        let cv = state
            .configuration_versions
            .get_mut(&id)
            .ok_or_else(|| ApiError::not_found(format!("configuration version {id}")))?;
        if cv.status != ConfigurationStatus::Pending {
            return Err(ApiError::conflict(
                format!("configuration version {id}"),
                "configuration already uploaded",
            ));
        }
        cv.status = ConfigurationStatus::Uploaded;
        state.uploads.insert(id, archive.to_vec());
        Ok(())
    }

    async fn read_configuration_version(&self, id: &str) -> ApiResult<ConfigurationVersion> {
        let mut state = self.state();
        state.enter("read_configuration_version")?;
        state
            .configuration_versions
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("configuration version {id}")))
    }

    async fn create_run(&self, options: &RunCreateOptions) -> ApiResult<Run> {
        let mut state = self.state();
        state.enter("create_run")?;
        if state.workspace_by_id(&options.workspace_id).is_none() {
            return Err(ApiError::not_found(format!(
                "workspace {}",
                options.workspace_id
            )));
        }
        let cv = state
            .configuration_versions
            .get(&options.configuration_version_id)
            .cloned()
            .ok_or_else(|| {
                ApiError::not_found(format!(
                    "configuration version {}",
                    options.configuration_version_id
                ))
            })?;
        if cv.status != ConfigurationStatus::Uploaded {
            return Err(ApiError::Rejected {
                status: 422,
                message: format!("configuration version {} has not been uploaded", cv.id),
            });
        }

        let script = state.script.clone();
        let run_id = state.next_id("run");
        let plan_id = state.next_id("plan");

        let mut policy_check_ids = Vec::new();
        for policy in &script.policy_checks {
            let id = state.next_id("polchk");
            let check = PolicyCheck {
                id: id.clone(),
                status: PolicyStatus::Pending,
                result: PolicyResult::default(),
                overridable: policy.overridable,
            };
            state.policy_checks.insert(
                id.clone(),
                MockPolicy {
                    check,
                    statuses: policy.statuses.iter().cloned().collect(),
                },
            );
            policy_check_ids.push(id);
        }

        let run = Run {
            id: run_id.clone(),
            workspace_id: options.workspace_id.clone(),
            status: RunStatus::Pending,
            is_destroy: options.is_destroy,
            message: options.message.clone(),
            configuration_version_id: Some(cv.id.clone()),
            plan_id: Some(plan_id),
            apply_id: None,
            policy_check_ids,
            created_at: Some(Utc::now()),
        };
        state.runs.insert(
            run_id,
            MockRun {
                run: run.clone(),
                statuses: script.run_statuses.iter().cloned().collect(),
                speculative: cv.speculative,
                changes: script.plan_changes,
                apply_statuses: script.apply_statuses.clone(),
                plan_lag: script.plan_lag.iter().cloned().collect(),
                starts_auto_apply: script.starts_auto_apply,
            },
        );
        Ok(run)
    }

    async fn read_run(&self, run_id: &str) -> ApiResult<Run> {
        let mut state = self.state();
        state.enter("read_run")?;
        let mock = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
        if let Some(next) = mock.statuses.pop_front() {
            mock.run.status = next;
        }
        let run = mock.run.clone();
        let auto_apply_candidate = run.status == RunStatus::Planned
            && run.apply_id.is_none()
            && !mock.speculative
            && mock.starts_auto_apply
            && mock.changes.has_changes();

        if auto_apply_candidate
            && state
                .workspace_by_id(&run.workspace_id)
                .is_some_and(|w| w.auto_apply)
            && state.policies_settled(&run)
        {
            state.start_apply(run_id)?;
            if let Some(mock) = state.runs.get(run_id) {
                return Ok(mock.run.clone());
            }
        }
        Ok(run)
    }

    async fn discard_run(&self, run_id: &str, _comment: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.enter("discard_run")?;
        let mock = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
        if mock.run.status.is_terminal() {
            return Err(ApiError::conflict(
                format!("run {run_id}"),
                format!("run is already {}", mock.run.status),
            ));
        }
        mock.run.status = RunStatus::Discarded;
        mock.statuses.clear();
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str, _comment: &str) -> ApiResult<()> {
        let mut state = self.state();
        state.enter("cancel_run")?;
        let mock = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
        if mock.run.status.is_terminal() {
            return Err(ApiError::conflict(
                format!("run {run_id}"),
                format!("run is already {}", mock.run.status),
            ));
        }
        mock.run.status = RunStatus::Canceled;
        mock.statuses.clear();
        Ok(())
    }

    async fn read_plan(&self, plan_id: &str) -> ApiResult<Plan> {
        let mut state = self.state();
        state.enter("read_plan")?;
        let mock = state
            .runs
            .values_mut()
            .find(|m| m.run.plan_id.as_deref() == Some(plan_id))
            .ok_or_else(|| ApiError::not_found(format!("plan {plan_id}")))?;

        if let Some(lagging) = mock.plan_lag.pop_front() {
            return Ok(Plan {
                id: plan_id.to_string(),
                status: lagging,
                changes: ResourceChanges::default(),
            });
        }
        let status = match &mock.run.status {
            RunStatus::Pending | RunStatus::Unknown(_) => PlanStatus::Pending,
            RunStatus::Planning => PlanStatus::Running,
            RunStatus::Errored => PlanStatus::Errored,
            _ => PlanStatus::Finished,
        };
        Ok(Plan {
            id: plan_id.to_string(),
            status,
            changes: mock.changes,
        })
    }

    async fn list_policy_checks(&self, run_id: &str) -> ApiResult<Vec<PolicyCheck>> {
        let mut state = self.state();
        state.enter("list_policy_checks")?;
        let ids = state
            .runs
            .get(run_id)
            .map(|m| m.run.policy_check_ids.clone())
            .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.policy_checks.get(id).map(|p| p.check.clone()))
            .collect())
    }

    async fn read_policy_check(&self, policy_check_id: &str) -> ApiResult<PolicyCheck> {
        let mut state = self.state();
        state.enter("read_policy_check")?;
        let policy = state
            .policy_checks
            .get_mut(policy_check_id)
            .ok_or_else(|| ApiError::not_found(format!("policy check {policy_check_id}")))?;
        if let Some(next) = policy.statuses.pop_front() {
            policy.check.result = match next {
                PolicyStatus::Passed => PolicyResult { passed: 1, failed: 0 },
                PolicyStatus::Failed => PolicyResult { passed: 0, failed: 1 },
                _ => policy.check.result,
            };
            policy.check.status = next;
        }
        Ok(policy.check.clone())
    }

    async fn override_policy_check(&self, policy_check_id: &str) -> ApiResult<PolicyCheck> {
        let mut state = self.state();
        state.enter("override_policy_check")?;
        let policy = state
            .policy_checks
            .get_mut(policy_check_id)
            .ok_or_else(|| ApiError::not_found(format!("policy check {policy_check_id}")))?;
        if policy.check.status != PolicyStatus::Failed || !policy.check.overridable {
            return Err(ApiError::conflict(
                format!("policy check {policy_check_id}"),
                "policy check cannot be overridden",
            ));
        }
        policy.check.status = PolicyStatus::Overridden;
        policy.statuses.clear();
        Ok(policy.check.clone())
    }

    async fn create_apply(&self, run_id: &str, _comment: &str) -> ApiResult<Apply> {
        let mut state = self.state();
        state.enter("create_apply")?;
        let run = state
            .runs
            .get(run_id)
            .map(|m| m.run.clone())
            .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
        if run.status != RunStatus::Planned {
            return Err(ApiError::conflict(
                format!("run {run_id}"),
                format!("run cannot be applied while {}", run.status),
            ));
        }
        if !state.policies_settled(&run) {
            return Err(ApiError::conflict(
                format!("run {run_id}"),
                "policy checks have not passed",
            ));
        }
        state.start_apply(run_id)
    }

    async fn read_apply(&self, apply_id: &str) -> ApiResult<Apply> {
        let mut state = self.state();
        state.enter("read_apply")?;
        let mock = state
            .applies
            .get_mut(apply_id)
            .ok_or_else(|| ApiError::not_found(format!("apply {apply_id}")))?;

        let Some(next) = mock.statuses.pop_front() else {
            return Ok(mock.apply.clone());
        };
        mock.apply.status = next.clone();
        let apply = mock.apply.clone();
        let run_id = mock.run_id.clone();
        let workspace_id = mock.workspace_id.clone();

        let run_status = match next {
            ApplyStatus::Finished => {
                *state.serials.entry(workspace_id).or_insert(0) += 1;
                Some(RunStatus::Applied)
            }
            ApplyStatus::Errored => Some(RunStatus::Errored),
            _ => None,
        };
        if let (Some(status), Some(run)) = (run_status, state.runs.get_mut(&run_id)) {
            run.run.status = status;
        }
        Ok(apply)
    }

    async fn current_state_version(&self, workspace_id: &str) -> ApiResult<StateVersion> {
        let mut state = self.state();
        state.enter("current_state_version")?;
        let serial = state
            .serials
            .get(workspace_id)
            .copied()
            .ok_or_else(|| ApiError::not_found(format!("state version of {workspace_id}")))?;
        Ok(StateVersion {
            id: format!("sv-{workspace_id}-{serial}"),
            workspace_id: workspace_id.to_string(),
            serial,
            download_url: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn uploaded_run(service: &InMemoryService) -> Run {
        let ws = service.add_workspace("hashicorp", WorkspaceCreateOptions::named("prod"));
        let cv = service
            .create_configuration_version(&ws.id, &ConfigurationVersionCreateOptions::default())
            .await
            .unwrap();
        service.upload_configuration(&cv, b"archive").await.unwrap();
        service
            .create_run(&RunCreateOptions {
                workspace_id: ws.id,
                configuration_version_id: cv.id,
                is_destroy: false,
                message: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_advance_scripted_statuses() {
        let service = InMemoryService::new();
        service.add_organization("hashicorp", true);
        let run = uploaded_run(&service).await;
        assert_eq!(run.status, RunStatus::Pending);

        let seen: Vec<RunStatus> = {
            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(service.read_run(&run.id).await.unwrap().status);
            }
            seen
        };
        assert_eq!(
            seen,
            vec![
                RunStatus::Pending,
                RunStatus::Planning,
                RunStatus::Planned,
                RunStatus::Planned
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_finishing_advances_serial() {
        let service = InMemoryService::new();
        service.add_organization("hashicorp", true);
        let run = uploaded_run(&service).await;
        for _ in 0..3 {
            service.read_run(&run.id).await.unwrap();
        }

        let apply = service.create_apply(&run.id, "").await.unwrap();
        assert_eq!(service.state_serial(&run.workspace_id), None);
        service.read_apply(&apply.id).await.unwrap();
        let finished = service.read_apply(&apply.id).await.unwrap();

        assert_eq!(finished.status, ApplyStatus::Finished);
        assert_eq!(service.state_serial(&run.workspace_id), Some(1));
        assert_eq!(service.run(&run.id).unwrap().status, RunStatus::Applied);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let service = InMemoryService::new();
        service.add_organization("hashicorp", true);
        service.fail_next("read_organization", ApiError::transport("connection reset"));

        assert!(service.read_organization("hashicorp").await.is_err());
        assert!(service.read_organization("hashicorp").await.is_ok());
        assert_eq!(service.calls("read_organization"), 2);
    }

    #[tokio::test]
    async fn test_create_apply_requires_planned_run() {
        let service = InMemoryService::new();
        service.add_organization("hashicorp", true);
        let run = uploaded_run(&service).await;

        let err = service.create_apply(&run.id, "").await.unwrap_err();
        assert!(err.is_conflict());
    }
}
