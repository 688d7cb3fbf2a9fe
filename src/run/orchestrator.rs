//! Drives one remote run from configuration upload to a terminal outcome.
//!
//! All remote progress is observed by polling; each poll replaces the held
//! run snapshot and feeds an event into the [`RunLifecycle`], which decides
//! whether the next remote side effect is allowed. Cancellation is checked
//! before every call and raced against every sleep and prompt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::types::*;
use crate::api::{ApiError, RemoteService, RetryHandler};
use crate::clock::Sleeper;
use crate::confirm::{Answer, Confirmer, Question};
use crate::observability::{ApiMetrics, OperationTimer};
use crate::run::errors::RunError;
use crate::run::operation::Operation;
use crate::run::outcome::{DiscardReason, RunOutcome, RunReport};
use crate::run::poll::PollPolicy;
use crate::run::state_machine::{RunEvent, RunLifecycle, RunPhase, TransitionError};

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub poll: PollPolicy,
    /// How long to wait for an operator answer before discarding the run
    pub confirm_timeout: Duration,
    /// Wait for another active run instead of failing on a run creation conflict
    pub wait_for_active_run: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            confirm_timeout: Duration::from_secs(300),
            wait_for_active_run: true,
        }
    }
}

/// Why a run stopped before producing an outcome on the normal path
enum Halt {
    Canceled,
    Discarded(DiscardReason),
    Error(RunError),
}

impl From<RunError> for Halt {
    fn from(err: RunError) -> Self {
        Halt::Error(err)
    }
}

impl From<TransitionError> for Halt {
    fn from(err: TransitionError) -> Self {
        Halt::Error(RunError::Transition(err))
    }
}

enum CallError {
    Canceled,
    Api(ApiError),
}

type Step<T> = Result<T, Halt>;

struct RunContext<'a> {
    workspace: &'a Workspace,
    op: &'a Operation,
    cancel: &'a CancellationToken,
    lifecycle: RunLifecycle,
    run: Option<Run>,
    /// Set once the apply has finished remotely
    applied: Option<Apply>,
}

impl RunContext<'_> {
    fn run_id(&self) -> Option<&str> {
        self.run.as_ref().map(|r| r.id.as_str())
    }

    fn api_error(&self, operation: &'static str, source: ApiError) -> RunError {
        RunError::Api {
            operation,
            run_id: self.run_id().map(str::to_string),
            status: self.run.as_ref().map(|r| r.status.clone()),
            source,
        }
    }

    fn halt(&self, operation: &'static str, err: CallError) -> Halt {
        match err {
            CallError::Canceled => Halt::Canceled,
            CallError::Api(source) => Halt::Error(self.api_error(operation, source)),
        }
    }

    /// Replace the held snapshot with one in `status`
    fn mark(&mut self, status: RunStatus) {
        if let Some(run) = self.run.take() {
            self.run = Some(Run { status, ..run });
        }
    }
}

pub struct RunOrchestrator {
    service: Arc<dyn RemoteService>,
    confirmer: Arc<dyn Confirmer>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryHandler,
    settings: OrchestratorSettings,
    metrics: Option<Arc<ApiMetrics>>,
}

impl std::fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("retry", &self.retry)
            .field("settings", &self.settings)
            .finish()
    }
}

impl RunOrchestrator {
    pub fn new(
        service: Arc<dyn RemoteService>,
        confirmer: Arc<dyn Confirmer>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryHandler,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            service,
            confirmer,
            sleeper,
            retry,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ApiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run `op` against `workspace` until it reaches a terminal outcome
    #[instrument(
        skip_all,
        fields(workspace = %workspace.name, operation = %op.kind, destroy = op.destroy, run.id)
    )]
    pub async fn execute(
        &self,
        workspace: &Workspace,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let timer = OperationTimer::new("remote_run");
        let mut ctx = RunContext {
            workspace,
            op,
            cancel,
            lifecycle: RunLifecycle::new(op.apply_if_no_changes),
            run: None,
            applied: None,
        };

        let result = self.drive(&mut ctx).await;
        timer.finish();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(Halt::Canceled) if ctx.applied.is_some() => {
                let changes = ctx.applied.as_ref().map(|a| a.changes).unwrap_or_default();
                warn!(
                    run.id = ctx.run_id().unwrap_or_default(),
                    "Canceled after the apply finished; state version not confirmed"
                );
                ctx.lifecycle.handle(RunEvent::ApplyFinished);
                RunOutcome::Applied {
                    changes,
                    state_version: None,
                }
            }
            Err(Halt::Canceled) => {
                self.cancel_remote(&ctx).await;
                ctx.lifecycle.handle(RunEvent::Cancel);
                RunOutcome::Canceled
            }
            Err(Halt::Discarded(reason)) => {
                ctx.lifecycle.handle(RunEvent::Discarded);
                RunOutcome::Discarded { reason }
            }
            Err(Halt::Error(err)) => {
                ctx.lifecycle.handle(RunEvent::Failed {
                    reason: err.to_string(),
                });
                warn!(error = %err, phase = ?ctx.lifecycle.phase(), "Run failed");
                return Err(err);
            }
        };

        info!(phase = ?ctx.lifecycle.phase(), "{}", outcome.summary());
        Ok(RunReport {
            run_id: ctx.run_id().map(str::to_string),
            workspace: workspace.name.clone(),
            phase: ctx.lifecycle.phase(),
            outcome,
        })
    }

    async fn drive(&self, ctx: &mut RunContext<'_>) -> Step<RunOutcome> {
        let previous_serial = if ctx.op.is_plan_only() {
            None
        } else {
            self.current_serial(ctx).await?
        };

        let run_id = self.create_run(ctx).await?;
        let plan = self.wait_for_plan(ctx, &run_id).await?;
        info!(run.id = %run_id, changes = %plan.changes, "Plan finished");

        self.check_policies(ctx, &run_id).await?;

        let has_changes = plan.has_changes();
        if !has_changes && !(ctx.op.apply_if_no_changes && !ctx.op.is_plan_only()) {
            ctx.lifecycle.advance(RunEvent::NoChanges, RunPhase::Applied)?;
            return Ok(RunOutcome::NoChanges);
        }
        if ctx.op.is_plan_only() {
            ctx.lifecycle
                .advance(RunEvent::PlanOnlyComplete, RunPhase::Planned)?;
            return Ok(RunOutcome::Planned {
                changes: plan.changes,
            });
        }

        ctx.lifecycle
            .advance(RunEvent::ReadyToConfirm, RunPhase::AwaitingConfirmation)?;
        let apply = self.confirm_and_apply(ctx, &run_id, &plan).await?;
        let apply = self.wait_for_apply(ctx, &run_id, apply).await?;
        let state_version = self.wait_for_state(ctx, &run_id, previous_serial).await?;

        ctx.lifecycle
            .advance(RunEvent::ApplyFinished, RunPhase::Applied)?;
        Ok(RunOutcome::Applied {
            changes: apply.changes,
            state_version: Some(state_version),
        })
    }

    /// Race a retried remote call against cancellation
    async fn call<T, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        should_retry: P,
        call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        P: Fn(&ApiError) -> bool,
    {
        if cancel.is_cancelled() {
            return Err(CallError::Canceled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Canceled),
            result = self.retry.execute_when(operation, should_retry, call) => {
                result.map_err(CallError::Api)
            }
        }
    }

    async fn pause(&self, ctx: &RunContext<'_>, delay: Duration) -> Step<()> {
        if ctx.cancel.is_cancelled() {
            return Err(Halt::Canceled);
        }
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Halt::Canceled),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }

    async fn current_serial(&self, ctx: &RunContext<'_>) -> Step<Option<u64>> {
        let service = &self.service;
        let workspace_id = ctx.workspace.id.as_str();
        let result = self
            .call(
                ctx.cancel,
                "current_state_version",
                ApiError::is_retryable,
                move || async move { service.current_state_version(workspace_id).await },
            )
            .await;
        match result {
            Ok(sv) => Ok(Some(sv.serial)),
            Err(CallError::Api(err)) if err.is_not_found() => Ok(None),
            Err(err) => Err(ctx.halt("current_state_version", err)),
        }
    }

    async fn create_run(&self, ctx: &mut RunContext<'_>) -> Step<String> {
        let archive = ctx
            .op
            .config
            .package()
            .map_err(|e| Halt::Error(e.into()))?;
        ctx.lifecycle
            .advance(RunEvent::UploadStarted, RunPhase::ConfigVersionUploading)?;

        let service = &self.service;
        let workspace_id = ctx.workspace.id.as_str();
        let options = ConfigurationVersionCreateOptions {
            auto_queue_runs: false,
            speculative: ctx.op.is_plan_only(),
        };
        let options = &options;
        let cv = self
            .call(
                ctx.cancel,
                "create_configuration_version",
                |e: &ApiError| e.is_retryable() || e.is_conflict(),
                move || async move {
                    service
                        .create_configuration_version(workspace_id, options)
                        .await
                },
            )
            .await
            .map_err(|e| creation_failed("configuration version", e))?;
        debug!(configuration_version = %cv.id, bytes = archive.len(), "Uploading configuration");

        let cv_ref = &cv;
        let archive = archive.as_slice();
        self.call(
            ctx.cancel,
            "upload_configuration",
            ApiError::is_retryable,
            move || async move { service.upload_configuration(cv_ref, archive).await },
        )
        .await
        .map_err(|e| creation_failed("configuration upload", e))?;

        let run_options = RunCreateOptions {
            workspace_id: workspace_id.to_string(),
            configuration_version_id: cv.id.clone(),
            is_destroy: ctx.op.destroy,
            message: Some(ctx.op.run_message()),
        };
        let run_options = &run_options;
        let poll = &self.settings.poll;
        let mut waits = 0;

        let run = loop {
            let result = self
                .call(
                    ctx.cancel,
                    "create_run",
                    ApiError::is_retryable,
                    move || async move { service.create_run(run_options).await },
                )
                .await;
            match result {
                Ok(run) => break run,
                Err(CallError::Api(err))
                    if err.is_conflict()
                        && self.settings.wait_for_active_run
                        && waits < poll.max_active_run_waits =>
                {
                    info!(workspace = %ctx.workspace.name, "Waiting for the active run in this workspace to finish");
                    self.pause(ctx, poll.delay(waits)).await?;
                    waits += 1;
                }
                Err(err) => return Err(creation_failed("run", err)),
            }
        };

        tracing::Span::current().record("run.id", run.id.as_str());
        info!(run.id = %run.id, workspace = %ctx.workspace.name, "Run created");
        let run_id = run.id.clone();
        ctx.run = Some(run);
        ctx.lifecycle.advance(
            RunEvent::RunCreated {
                run_id: run_id.clone(),
            },
            RunPhase::RunPending,
        )?;
        Ok(run_id)
    }

    async fn read_run(&self, ctx: &mut RunContext<'_>, run_id: &str) -> Step<Run> {
        let service = &self.service;
        let run = self
            .call(ctx.cancel, "read_run", ApiError::is_retryable, move || async move {
                service.read_run(run_id).await
            })
            .await
            .map_err(|e| ctx.halt("read_run", e))?;
        if let Some(metrics) = &self.metrics {
            metrics.record_poll();
        }
        ctx.run = Some(run.clone());
        Ok(run)
    }

    async fn wait_for_plan(&self, ctx: &mut RunContext<'_>, run_id: &str) -> Step<Plan> {
        let poll = self.settings.poll.clone();
        let mut iteration = 0;
        let mut unknown = 0;

        let run = loop {
            let run = self.read_run(ctx, run_id).await?;
            debug!(run.id = %run_id, status = %run.status, "Polled run");

            if run.status.plan_completed() {
                break run;
            }
            match &run.status {
                RunStatus::Unknown(status) => {
                    unknown += 1;
                    warn!(run.id = %run_id, status = %status, unknown, "Unrecognized run status");
                    if unknown >= poll.max_unknown_polls {
                        return Err(RunError::UnknownRunState {
                            run_id: run_id.to_string(),
                            status: status.clone(),
                            polls: unknown,
                        }
                        .into());
                    }
                }
                RunStatus::Planning => {
                    unknown = 0;
                    if ctx.lifecycle.phase() == RunPhase::RunPending {
                        ctx.lifecycle
                            .advance(RunEvent::PlanStarted, RunPhase::Planning)?;
                    }
                }
                RunStatus::Errored => {
                    return Err(RunError::RunErrored {
                        run_id: run_id.to_string(),
                        status: run.status.clone(),
                    }
                    .into())
                }
                RunStatus::Discarded => return Err(Halt::Discarded(DiscardReason::Remote)),
                RunStatus::Canceled => {
                    return Err(RunError::CanceledRemotely {
                        run_id: run_id.to_string(),
                    }
                    .into())
                }
                _ => unknown = 0,
            }

            self.pause(ctx, poll.delay(iteration)).await?;
            iteration += 1;
        };

        let plan_id = run.plan_id.as_deref().ok_or_else(|| {
            Halt::Error(ctx.api_error(
                "read_plan",
                ApiError::Decode {
                    message: format!("run {run_id} finished planning without a plan"),
                },
            ))
        })?;
        let plan = self.wait_for_plan_result(ctx, run_id, plan_id).await?;

        ctx.lifecycle.advance(
            RunEvent::PlanFinished {
                status: plan.status.clone(),
                has_changes: plan.has_changes(),
            },
            RunPhase::PlanFinished,
        )?;
        Ok(plan)
    }

    /// Poll the plan itself until it is finished; the run status can lead it
    async fn wait_for_plan_result(
        &self,
        ctx: &mut RunContext<'_>,
        run_id: &str,
        plan_id: &str,
    ) -> Step<Plan> {
        let poll = self.settings.poll.clone();
        let service = &self.service;
        let mut iteration = 0;
        let mut unknown = 0;

        loop {
            let plan = self
                .call(ctx.cancel, "read_plan", ApiError::is_retryable, move || async move {
                    service.read_plan(plan_id).await
                })
                .await
                .map_err(|e| ctx.halt("read_plan", e))?;
            debug!(run.id = %run_id, plan = %plan.id, status = %plan.status, "Polled plan");

            match &plan.status {
                PlanStatus::Finished => return Ok(plan),
                PlanStatus::Errored => {
                    return Err(RunError::RunErrored {
                        run_id: run_id.to_string(),
                        status: RunStatus::Errored,
                    }
                    .into())
                }
                PlanStatus::Unknown(status) => {
                    unknown += 1;
                    warn!(run.id = %run_id, status = %status, unknown, "Unrecognized plan status");
                    if unknown >= poll.max_unknown_polls {
                        return Err(RunError::UnknownRunState {
                            run_id: run_id.to_string(),
                            status: status.clone(),
                            polls: unknown,
                        }
                        .into());
                    }
                }
                PlanStatus::Pending | PlanStatus::Running => unknown = 0,
            }

            self.pause(ctx, poll.delay(iteration)).await?;
            iteration += 1;
        }
    }

    async fn check_policies(&self, ctx: &mut RunContext<'_>, run_id: &str) -> Step<()> {
        let service = &self.service;
        let checks = self
            .call(
                ctx.cancel,
                "list_policy_checks",
                ApiError::is_retryable,
                move || async move { service.list_policy_checks(run_id).await },
            )
            .await
            .map_err(|e| ctx.halt("list_policy_checks", e))?;

        if checks.is_empty() {
            ctx.lifecycle
                .handle(RunEvent::PolicyChecksStarted { count: 0 });
            return Ok(());
        }
        ctx.lifecycle.advance(
            RunEvent::PolicyChecksStarted {
                count: checks.len(),
            },
            RunPhase::PolicyChecking,
        )?;

        let mut failed = Vec::new();
        for check in checks {
            let check = self.wait_for_policy(ctx, run_id, check).await?;
            match check.status {
                PolicyStatus::Failed if check.overridable && !ctx.op.auto_approve => {
                    if !self.override_policy(ctx, &check).await? {
                        failed.push(check.id);
                    }
                }
                PolicyStatus::Failed => failed.push(check.id),
                _ => debug!(policy_check = %check.id, status = %check.status, "Policy check cleared"),
            }
        }

        if failed.is_empty() {
            ctx.lifecycle.handle(RunEvent::PoliciesCleared);
            return Ok(());
        }

        warn!(run.id = %run_id, failed = ?failed, "Policy checks failed, discarding run");
        self.discard(ctx, run_id, "Run discarded after failed policy checks")
            .await;
        ctx.lifecycle
            .advance(RunEvent::PolicyDenied, RunPhase::Discarded)?;
        Err(RunError::PolicyDenied {
            run_id: run_id.to_string(),
            failed,
        }
        .into())
    }

    async fn wait_for_policy(
        &self,
        ctx: &mut RunContext<'_>,
        run_id: &str,
        mut check: PolicyCheck,
    ) -> Step<PolicyCheck> {
        let poll = self.settings.poll.clone();
        let service = &self.service;
        let mut iteration = 0;
        let mut unknown = 0;

        while !check.status.is_terminal() {
            if check.status.is_unknown() {
                unknown += 1;
                if unknown >= poll.max_unknown_polls {
                    return Err(RunError::UnknownRunState {
                        run_id: run_id.to_string(),
                        status: check.status.to_string(),
                        polls: unknown,
                    }
                    .into());
                }
            }
            if iteration > 0 {
                self.pause(ctx, poll.delay(iteration - 1)).await?;
            }
            iteration += 1;

            let id = check.id.as_str();
            let next = self
                .call(
                    ctx.cancel,
                    "read_policy_check",
                    ApiError::is_retryable,
                    move || async move { service.read_policy_check(id).await },
                )
                .await
                .map_err(|e| ctx.halt("read_policy_check", e))?;
            check = next;
        }
        Ok(check)
    }

    /// Ask to override a soft-failed policy check; true when it was overridden
    async fn override_policy(&self, ctx: &mut RunContext<'_>, check: &PolicyCheck) -> Step<bool> {
        let question = Question::override_policy(format!(
            "Policy check {} failed ({} passed, {} failed).",
            check.id, check.result.passed, check.result.failed
        ));
        match self.ask(ctx, &question).await? {
            Some(Answer::Yes) => {}
            Some(Answer::Abort) => return Err(Halt::Canceled),
            Some(Answer::No) | None => return Ok(false),
        }

        let service = &self.service;
        let id = check.id.as_str();
        let overridden = self
            .call(
                ctx.cancel,
                "override_policy_check",
                ApiError::is_retryable,
                move || async move { service.override_policy_check(id).await },
            )
            .await
            .map_err(|e| ctx.halt("override_policy_check", e))?;
        info!(policy_check = %overridden.id, status = %overridden.status, "Policy check overridden");
        Ok(overridden.status.allows_apply())
    }

    /// Operator answer, or `None` when the confirmation window elapsed
    async fn ask(&self, ctx: &RunContext<'_>, question: &Question) -> Step<Option<Answer>> {
        if ctx.cancel.is_cancelled() {
            return Err(Halt::Canceled);
        }
        let answer = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Halt::Canceled),
            answer = tokio::time::timeout(self.settings.confirm_timeout, self.confirmer.ask(question)) => answer,
        };
        match answer {
            Ok(Ok(answer)) => Ok(Some(answer)),
            Ok(Err(source)) => Err(RunError::Confirmation {
                run_id: ctx.run_id().map(str::to_string),
                source,
            }
            .into()),
            Err(_) => {
                warn!(question = %question.id, timeout_secs = self.settings.confirm_timeout.as_secs(), "Confirmation timed out");
                Ok(None)
            }
        }
    }

    async fn confirm_and_apply(
        &self,
        ctx: &mut RunContext<'_>,
        run_id: &str,
        plan: &Plan,
    ) -> Step<Apply> {
        if ctx.workspace.auto_apply && plan.has_changes() {
            info!(run.id = %run_id, "Workspace applies automatically");
            ctx.lifecycle
                .advance(RunEvent::Confirmed, RunPhase::Applying)?;
            return self.wait_for_auto_apply(ctx, run_id).await;
        }

        if !ctx.op.auto_approve {
            let question = Question::approve(format!(
                "Remote run {run_id} will perform these actions: {}. Only 'yes' will be accepted to approve.",
                plan.changes
            ));
            let reason = match self.ask(ctx, &question).await? {
                Some(Answer::Yes) => None,
                Some(Answer::No) => Some(DiscardReason::OperatorRejected),
                Some(Answer::Abort) => return Err(Halt::Canceled),
                None => Some(DiscardReason::ConfirmationTimedOut),
            };
            if let Some(reason) = reason {
                self.discard(ctx, run_id, &format!("Run discarded: {reason}"))
                    .await;
                ctx.lifecycle
                    .advance(RunEvent::Rejected, RunPhase::Discarded)?;
                return Err(Halt::Discarded(reason));
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(Halt::Canceled);
        }
        ctx.lifecycle
            .advance(RunEvent::Confirmed, RunPhase::Applying)?;
        self.start_apply(ctx, run_id).await
    }

    async fn start_apply(&self, ctx: &mut RunContext<'_>, run_id: &str) -> Step<Apply> {
        let service = &self.service;
        let apply = self
            .call(ctx.cancel, "create_apply", ApiError::is_retryable, move || async move {
                service.create_apply(run_id, "Confirmed by remote-runs").await
            })
            .await
            .map_err(|e| ctx.halt("create_apply", e))?;
        ctx.mark(RunStatus::Applying);
        info!(run.id = %run_id, apply = %apply.id, "Apply started");
        Ok(apply)
    }

    /// Wait for the service to start the apply of an auto-apply workspace.
    ///
    /// A run that stays confirmable without an apply for `max_unknown_polls`
    /// polls is confirmed explicitly.
    async fn wait_for_auto_apply(&self, ctx: &mut RunContext<'_>, run_id: &str) -> Step<Apply> {
        let poll = self.settings.poll.clone();
        let mut iteration = 0;
        let mut unknown = 0;
        let mut idle = 0;

        let apply_id = loop {
            let run = self.read_run(ctx, run_id).await?;
            if let Some(apply_id) = run.apply_id {
                break apply_id;
            }
            match &run.status {
                RunStatus::Errored => {
                    return Err(RunError::RunErrored {
                        run_id: run_id.to_string(),
                        status: RunStatus::Errored,
                    }
                    .into())
                }
                RunStatus::Discarded => return Err(Halt::Discarded(DiscardReason::Remote)),
                RunStatus::Canceled => {
                    return Err(RunError::CanceledRemotely {
                        run_id: run_id.to_string(),
                    }
                    .into())
                }
                RunStatus::Unknown(status) => {
                    unknown += 1;
                    warn!(run.id = %run_id, status = %status, unknown, "Unrecognized run status");
                    if unknown >= poll.max_unknown_polls {
                        return Err(RunError::UnknownRunState {
                            run_id: run_id.to_string(),
                            status: status.clone(),
                            polls: unknown,
                        }
                        .into());
                    }
                }
                RunStatus::Planned => {
                    unknown = 0;
                    idle += 1;
                    if idle >= poll.max_unknown_polls {
                        warn!(run.id = %run_id, polls = idle, "Auto-apply did not start, confirming the run");
                        return self.start_apply(ctx, run_id).await;
                    }
                }
                _ => unknown = 0,
            }
            self.pause(ctx, poll.delay(iteration)).await?;
            iteration += 1;
        };

        let service = &self.service;
        let id = apply_id.as_str();
        self.call(ctx.cancel, "read_apply", ApiError::is_retryable, move || async move {
            service.read_apply(id).await
        })
        .await
        .map_err(|e| ctx.halt("read_apply", e))
    }

    async fn wait_for_apply(
        &self,
        ctx: &mut RunContext<'_>,
        run_id: &str,
        mut apply: Apply,
    ) -> Step<Apply> {
        let poll = self.settings.poll.clone();
        let service = &self.service;
        let mut iteration = 0;
        let mut unknown = 0;

        loop {
            match &apply.status {
                ApplyStatus::Finished => break,
                ApplyStatus::Errored => {
                    ctx.mark(RunStatus::Errored);
                    return Err(RunError::ApplyErrored {
                        run_id: run_id.to_string(),
                        apply_id: apply.id.clone(),
                    }
                    .into());
                }
                ApplyStatus::Unknown(status) => {
                    unknown += 1;
                    if unknown >= poll.max_unknown_polls {
                        return Err(RunError::UnknownRunState {
                            run_id: run_id.to_string(),
                            status: status.clone(),
                            polls: unknown,
                        }
                        .into());
                    }
                }
                ApplyStatus::Pending | ApplyStatus::Running => unknown = 0,
            }

            self.pause(ctx, poll.delay(iteration)).await?;
            iteration += 1;

            let id = apply.id.clone();
            let id = id.as_str();
            apply = self
                .call(ctx.cancel, "read_apply", ApiError::is_retryable, move || async move {
                    service.read_apply(id).await
                })
                .await
                .map_err(|e| ctx.halt("read_apply", e))?;
            debug!(run.id = %run_id, apply = %apply.id, status = %apply.status, "Polled apply");
        }

        ctx.mark(RunStatus::Applied);
        ctx.applied = Some(apply.clone());
        info!(run.id = %run_id, changes = %apply.changes, "Apply finished");
        Ok(apply)
    }

    /// Wait until the workspace state serial moves past `previous`
    async fn wait_for_state(
        &self,
        ctx: &mut RunContext<'_>,
        run_id: &str,
        previous: Option<u64>,
    ) -> Step<StateVersion> {
        let poll = self.settings.poll.clone();
        let service = &self.service;
        let workspace_id = ctx.workspace.id.as_str();

        for attempt in 0..poll.max_state_version_polls.max(1) {
            if attempt > 0 {
                self.pause(ctx, poll.delay(attempt - 1)).await?;
            }
            let result = self
                .call(
                    ctx.cancel,
                    "current_state_version",
                    ApiError::is_retryable,
                    move || async move { service.current_state_version(workspace_id).await },
                )
                .await;
            match result {
                Ok(sv) if previous.map_or(true, |p| sv.serial > p) => {
                    info!(run.id = %run_id, serial = sv.serial, "State version updated");
                    return Ok(sv);
                }
                Ok(sv) => debug!(serial = sv.serial, ?previous, "State serial has not advanced yet"),
                Err(CallError::Api(err)) if err.is_not_found() => {}
                Err(err) => return Err(ctx.halt("current_state_version", err)),
            }
        }

        Err(RunError::StateNotAdvanced {
            run_id: run_id.to_string(),
            workspace_id: workspace_id.to_string(),
            previous,
        }
        .into())
    }

    /// Best-effort discard; failures are logged, never surfaced
    async fn discard(&self, ctx: &mut RunContext<'_>, run_id: &str, comment: &str) {
        match self.service.discard_run(run_id, comment).await {
            Ok(()) => ctx.mark(RunStatus::Discarded),
            Err(err) => warn!(run.id = %run_id, error = %err, "Failed to discard run"),
        }
    }

    /// One best-effort request that stops the remote run after local cancellation
    async fn cancel_remote(&self, ctx: &RunContext<'_>) {
        let Some(run) = &ctx.run else {
            debug!("Canceled before a run was created");
            return;
        };
        if run.status.is_terminal() {
            return;
        }

        let comment = "Canceled by remote-runs";
        let result = if run.status == RunStatus::Planned {
            self.service.discard_run(&run.id, comment).await
        } else {
            self.service.cancel_run(&run.id, comment).await
        };
        match result {
            Ok(()) => info!(run.id = %run.id, status = %run.status, "Requested remote run stop"),
            Err(err) => warn!(run.id = %run.id, error = %err, "Failed to stop remote run"),
        }
    }
}

fn creation_failed(stage: &'static str, err: CallError) -> Halt {
    match err {
        CallError::Canceled => Halt::Canceled,
        CallError::Api(source) => Halt::Error(RunError::RunCreationFailed { stage, source }),
    }
}
