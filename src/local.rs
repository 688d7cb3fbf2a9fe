//! Local execution used when no organization is configured.
//!
//! The delegate takes the same [`Operation`] as the remote orchestrator and
//! returns the same [`RunReport`], but plans and applies through a
//! [`LocalExecutor`] directly instead of polling a remote run.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::api::types::{PlanStatus, ResourceChanges, StateVersion};
use crate::confirm::{Answer, Confirmer, Question};
use crate::run::errors::RunError;
use crate::run::operation::Operation;
use crate::run::outcome::{DiscardReason, RunOutcome, RunReport};
use crate::run::package::ConfigurationSnapshot;
use crate::run::state_machine::{RunEvent, RunLifecycle, RunPhase};

/// Workspace name reported for local runs
pub const LOCAL_WORKSPACE: &str = "local";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocalError {
    #[error("provider {name:?} is required by the configuration but is not available locally")]
    MissingProvider { name: String },

    #[error("local plan failed: {0}")]
    Plan(String),

    #[error("local apply failed: {0}")]
    Apply(String),
}

/// A provider binary the local engine can load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHandle {
    pub name: String,
    pub version: String,
}

impl ProviderHandle {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

pub trait ProviderSource: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ProviderHandle>;
}

/// Fixed set of providers, keyed by name
#[derive(Debug, Clone, Default)]
pub struct StaticProviders {
    providers: BTreeMap<String, ProviderHandle>,
}

impl StaticProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: ProviderHandle) -> Self {
        self.providers.insert(provider.name.clone(), provider);
        self
    }
}

impl ProviderSource for StaticProviders {
    fn resolve(&self, name: &str) -> Option<ProviderHandle> {
        self.providers.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub snapshot: ConfigurationSnapshot,
    pub destroy: bool,
    pub providers: Vec<ProviderHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    pub id: String,
    pub changes: ResourceChanges,
    pub destroy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub changes: ResourceChanges,
    /// Serial of the state written by the apply
    pub serial: u64,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<PlanResult, LocalError>;
    async fn apply(&self, plan: &PlanResult) -> Result<ApplyResult, LocalError>;
}

enum Stop {
    Canceled,
    Discarded(DiscardReason),
    Error(RunError),
}

impl From<RunError> for Stop {
    fn from(err: RunError) -> Self {
        Stop::Error(err)
    }
}

impl From<LocalError> for Stop {
    fn from(err: LocalError) -> Self {
        Stop::Error(RunError::Local(err))
    }
}

impl From<crate::run::state_machine::TransitionError> for Stop {
    fn from(err: crate::run::state_machine::TransitionError) -> Self {
        Stop::Error(RunError::Transition(err))
    }
}

pub struct LocalDelegate {
    executor: Arc<dyn LocalExecutor>,
    providers: Arc<dyn ProviderSource>,
    confirmer: Arc<dyn Confirmer>,
    confirm_timeout: Duration,
}

impl LocalDelegate {
    pub fn new(
        executor: Arc<dyn LocalExecutor>,
        providers: Arc<dyn ProviderSource>,
        confirmer: Arc<dyn Confirmer>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            providers,
            confirmer,
            confirm_timeout,
        }
    }

    /// Resolve every provider the configuration declares
    pub fn resolve_providers(
        &self,
        snapshot: &ConfigurationSnapshot,
    ) -> Result<Vec<ProviderHandle>, LocalError> {
        snapshot
            .required_providers()
            .iter()
            .map(|name| {
                self.providers
                    .resolve(name)
                    .ok_or_else(|| LocalError::MissingProvider { name: name.clone() })
            })
            .collect()
    }

    #[instrument(skip_all, fields(kind = %op.kind, destroy = op.destroy))]
    pub async fn operation(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let mut lifecycle = RunLifecycle::new(op.apply_if_no_changes);
        let mut plan_id = None;

        let outcome = match self.drive(op, cancel, &mut lifecycle, &mut plan_id).await {
            Ok(outcome) => outcome,
            Err(Stop::Canceled) => {
                lifecycle.handle(RunEvent::Cancel);
                RunOutcome::Canceled
            }
            Err(Stop::Discarded(reason)) => {
                lifecycle.handle(RunEvent::Discarded);
                RunOutcome::Discarded { reason }
            }
            Err(Stop::Error(err)) => {
                lifecycle.handle(RunEvent::Failed {
                    reason: err.to_string(),
                });
                warn!(error = %err, "Local operation failed");
                return Err(err);
            }
        };

        info!(phase = ?lifecycle.phase(), "{}", outcome.summary());
        Ok(RunReport {
            run_id: plan_id,
            workspace: LOCAL_WORKSPACE.to_string(),
            phase: lifecycle.phase(),
            outcome,
        })
    }

    async fn drive(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
        lifecycle: &mut RunLifecycle,
        plan_id: &mut Option<String>,
    ) -> Result<RunOutcome, Stop> {
        let providers = self.resolve_providers(&op.config)?;
        lifecycle.advance(RunEvent::UploadStarted, RunPhase::ConfigVersionUploading)?;

        let request = PlanRequest {
            snapshot: op.config.clone(),
            destroy: op.destroy,
            providers,
        };
        let plan = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Stop::Canceled),
            plan = self.executor.plan(request) => plan?,
        };
        *plan_id = Some(plan.id.clone());
        lifecycle.advance(
            RunEvent::RunCreated {
                run_id: plan.id.clone(),
            },
            RunPhase::RunPending,
        )?;
        let has_changes = plan.changes.has_changes();
        lifecycle.advance(
            RunEvent::PlanFinished {
                status: PlanStatus::Finished,
                has_changes,
            },
            RunPhase::PlanFinished,
        )?;
        lifecycle.advance(RunEvent::PolicyChecksStarted { count: 0 }, RunPhase::PlanFinished)?;
        info!(plan.id = %plan.id, changes = %plan.changes, "Local plan finished");

        if !has_changes && !(op.apply_if_no_changes && !op.is_plan_only()) {
            lifecycle.advance(RunEvent::NoChanges, RunPhase::Applied)?;
            return Ok(RunOutcome::NoChanges);
        }
        if op.is_plan_only() {
            lifecycle.advance(RunEvent::PlanOnlyComplete, RunPhase::Planned)?;
            return Ok(RunOutcome::Planned {
                changes: plan.changes,
            });
        }
        lifecycle.advance(RunEvent::ReadyToConfirm, RunPhase::AwaitingConfirmation)?;

        if !op.auto_approve {
            let question = Question::approve(format!(
                "Local execution will perform these actions: {}. Only 'yes' will be accepted to approve.",
                plan.changes
            ));
            let answer = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Stop::Canceled),
                answer = tokio::time::timeout(self.confirm_timeout, self.confirmer.ask(&question)) => answer,
            };
            match answer {
                Ok(Ok(Answer::Yes)) => {}
                Ok(Ok(Answer::No)) => {
                    lifecycle.advance(RunEvent::Rejected, RunPhase::Discarded)?;
                    return Err(Stop::Discarded(DiscardReason::OperatorRejected));
                }
                Ok(Ok(Answer::Abort)) => return Err(Stop::Canceled),
                Ok(Err(source)) => {
                    return Err(RunError::Confirmation {
                        run_id: plan_id.clone(),
                        source,
                    }
                    .into())
                }
                Err(_) => {
                    lifecycle.advance(RunEvent::Rejected, RunPhase::Discarded)?;
                    return Err(Stop::Discarded(DiscardReason::ConfirmationTimedOut));
                }
            }
        }

        lifecycle.advance(RunEvent::Confirmed, RunPhase::Applying)?;
        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Stop::Canceled),
            applied = self.executor.apply(&plan) => applied?,
        };
        lifecycle.advance(RunEvent::ApplyFinished, RunPhase::Applied)?;

        Ok(RunOutcome::Applied {
            changes: applied.changes,
            state_version: Some(StateVersion {
                id: format!("local-{}", applied.serial),
                workspace_id: LOCAL_WORKSPACE.to_string(),
                serial: applied.serial,
                download_url: None,
            }),
        })
    }
}
