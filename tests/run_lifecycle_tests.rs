//! End-to-end run lifecycle scenarios against the in-memory remote service.
//!
//! Every scenario drives the real orchestrator; the service scripts the
//! remote status progression and counts the calls made against it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use remote_runs::api::mock::PolicyScript;
use remote_runs::api::types::{
    ApplyStatus, PlanStatus, PolicyStatus, ResourceChanges, RunStatus, Workspace,
    WorkspaceCreateOptions,
};
use remote_runs::api::{ApiError, InMemoryService, RetryConfig, RetryHandler, RunScript};
use remote_runs::backend::RemoteBackend;
use remote_runs::clock::RecordingSleeper;
use remote_runs::config::RemoteRunsConfig;
use remote_runs::confirm::{
    AnswerMap, AutoApprove, ConfirmError, Confirmer, Question, Answer, APPROVE,
};
use remote_runs::observability::ApiMetrics;
use remote_runs::run::{
    ConfigurationSnapshot, DiscardReason, ErrorKind, Operation, OrchestratorSettings, RunError,
    RunOrchestrator, RunOutcome, RunPhase,
};
use remote_runs::workspace::WorkspaceSettings;

const ORG: &str = "hashicorp";

/// Confirmer whose operator never answers
struct SilentOperator;

#[async_trait]
impl Confirmer for SilentOperator {
    async fn ask(&self, _question: &Question) -> Result<Answer, ConfirmError> {
        std::future::pending().await
    }
}

fn snapshot() -> ConfigurationSnapshot {
    ConfigurationSnapshot::new().with_file(
        "main.tf",
        "resource \"null_resource\" \"cluster\" {}\n",
    )
}

fn service_with_prod(script: RunScript) -> (Arc<InMemoryService>, Workspace) {
    let service = Arc::new(InMemoryService::new().with_script(script));
    service.add_organization(ORG, true);
    let workspace = service.add_workspace(ORG, WorkspaceCreateOptions::named("prod"));
    (service, workspace)
}

fn orchestrator_with(
    service: Arc<InMemoryService>,
    confirmer: Arc<dyn Confirmer>,
    sleeper: Arc<RecordingSleeper>,
    settings: OrchestratorSettings,
) -> RunOrchestrator {
    RunOrchestrator::new(
        service,
        confirmer,
        sleeper,
        RetryHandler::new(RetryConfig::default(), Arc::new(RecordingSleeper::new())),
        settings,
    )
}

fn orchestrator(service: Arc<InMemoryService>, confirmer: Arc<dyn Confirmer>) -> RunOrchestrator {
    orchestrator_with(
        service,
        confirmer,
        Arc::new(RecordingSleeper::new()),
        OrchestratorSettings::default(),
    )
}

fn remote_config(workspaces: WorkspaceSettings) -> RemoteRunsConfig {
    let mut config = RemoteRunsConfig::default();
    config.backend.organization = Some(ORG.to_string());
    config.backend.workspaces = workspaces;
    config
}

#[tokio::test]
async fn test_missing_workspace_is_created_and_noop_plan_reports_no_changes() {
    let service = Arc::new(InMemoryService::new().with_script(RunScript::no_changes()));
    service.add_organization(ORG, true);

    let backend = RemoteBackend::with_service(
        &remote_config(WorkspaceSettings::named("prod")),
        service.clone(),
        Arc::new(AnswerMap::default()),
        Arc::new(RecordingSleeper::new()),
        Arc::new(ApiMetrics::new()),
    )
    .unwrap();

    let report = backend
        .operation(&Operation::plan(snapshot()), "default", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::NoChanges);
    assert_eq!(report.workspace, "prod");
    assert!(service.workspace(ORG, "prod").is_some());
    assert_eq!(service.calls("create_workspace"), 1);
    assert_eq!(service.calls("create_apply"), 0);

    let run = service.run(report.run_id.as_deref().unwrap()).unwrap();
    assert_eq!(run.status, RunStatus::Planned);
}

#[tokio::test]
async fn test_failed_policy_check_discards_without_apply() {
    let (service, workspace) =
        service_with_prod(RunScript::default().with_policy(PolicyScript::failing(false)));
    let confirmer = Arc::new(AnswerMap::default().with(APPROVE, "yes"));

    let err = orchestrator(service.clone(), confirmer.clone())
        .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PolicyDenied);
    let run_id = err.run_id().unwrap().to_string();
    assert_eq!(service.run(&run_id).unwrap().status, RunStatus::Discarded);
    assert_eq!(service.calls("discard_run"), 1);
    assert_eq!(service.calls("create_apply"), 0);
    assert!(confirmer.asked().is_empty());
}

#[tokio::test]
async fn test_cancellation_while_polling_stops_remote_run_once() {
    let (service, workspace) = service_with_prod(RunScript::default());
    let cancel = CancellationToken::new();
    let sleeper = Arc::new(RecordingSleeper::cancel_after(2, cancel.clone()));

    let report = orchestrator_with(
        service.clone(),
        Arc::new(AutoApprove),
        sleeper.clone(),
        OrchestratorSettings::default(),
    )
    .execute(&workspace, &Operation::apply(snapshot()), &cancel)
    .await
    .unwrap();

    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert_eq!(report.phase, RunPhase::Canceled);
    assert_eq!(
        service.calls("cancel_run") + service.calls("discard_run"),
        1
    );
    assert_eq!(service.calls("create_apply"), 0);
    assert_eq!(sleeper.delays().len(), 2);

    let run = service.run(report.run_id.as_deref().unwrap()).unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
}

#[tokio::test]
async fn test_cancellation_before_any_run_makes_no_remote_stop_call() {
    let (service, workspace) = service_with_prod(RunScript::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(&workspace, &Operation::apply(snapshot()), &cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert_eq!(report.run_id, None);
    assert_eq!(service.calls("create_run"), 0);
    assert_eq!(service.calls("cancel_run") + service.calls("discard_run"), 0);
}

#[tokio::test]
async fn test_state_serials_strictly_increase_across_applies() {
    let (service, workspace) = service_with_prod(RunScript::default());
    let orchestrator = orchestrator(service.clone(), Arc::new(AutoApprove));

    let mut serials = Vec::new();
    for _ in 0..3 {
        let report = orchestrator
            .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
            .await
            .unwrap();
        match report.outcome {
            RunOutcome::Applied {
                state_version: Some(sv),
                ..
            } => serials.push(sv.serial),
            other => panic!("expected an applied run, got {other:?}"),
        }
    }

    assert_eq!(serials, vec![1, 2, 3]);
    assert!(serials.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(service.state_serial(&workspace.id), Some(3));
}

#[tokio::test]
async fn test_transport_errors_are_retried_then_succeed() {
    let (service, workspace) = service_with_prod(RunScript::default());
    service.fail_next("read_run", ApiError::transport("connection reset by peer"));
    let retry_sleeper = Arc::new(RecordingSleeper::new());

    let report = RunOrchestrator::new(
        service.clone(),
        Arc::new(AnswerMap::default()),
        Arc::new(RecordingSleeper::new()),
        RetryHandler::new(RetryConfig::default(), retry_sleeper.clone()),
        OrchestratorSettings::default(),
    )
    .execute(&workspace, &Operation::plan(snapshot()), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.phase, RunPhase::Planned);
    assert_eq!(service.calls("read_run"), 4);
    assert_eq!(retry_sleeper.delays().len(), 1);
}

#[tokio::test]
async fn test_exhausted_transport_retries_surface_with_run_context() {
    let (service, workspace) = service_with_prod(RunScript::default());
    for _ in 0..3 {
        service.fail_next("read_run", ApiError::transport("timed out"));
    }

    let err = orchestrator(service.clone(), Arc::new(AnswerMap::default()))
        .execute(&workspace, &Operation::plan(snapshot()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.run_id().is_some());
    assert!(matches!(err, RunError::Api { operation: "read_run", .. }));
    assert_eq!(service.calls("read_run"), 3);
}

#[tokio::test]
async fn test_non_retryable_errors_propagate_immediately() {
    let (service, workspace) = service_with_prod(RunScript::default());
    service.fail_next(
        "read_run",
        ApiError::Server {
            status: 503,
            message: "maintenance".to_string(),
        },
    );

    let err = orchestrator(service.clone(), Arc::new(AnswerMap::default()))
        .execute(&workspace, &Operation::plan(snapshot()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(service.calls("read_run"), 1);
}

#[tokio::test]
async fn test_conflicting_active_run_is_waited_out() {
    let (service, workspace) = service_with_prod(RunScript::no_changes());
    service.fail_next("create_run", ApiError::conflict("run", "workspace is locked"));
    let sleeper = Arc::new(RecordingSleeper::new());

    let report = orchestrator_with(
        service.clone(),
        Arc::new(AnswerMap::default()),
        sleeper.clone(),
        OrchestratorSettings::default(),
    )
    .execute(&workspace, &Operation::plan(snapshot()), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.outcome, RunOutcome::NoChanges);
    assert_eq!(service.calls("create_run"), 2);
    assert!(!sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_conflict_fails_when_not_waiting_for_active_runs() {
    let (service, workspace) = service_with_prod(RunScript::default());
    service.fail_next("create_run", ApiError::conflict("run", "workspace is locked"));
    let settings = OrchestratorSettings {
        wait_for_active_run: false,
        ..OrchestratorSettings::default()
    };

    let err = orchestrator_with(
        service.clone(),
        Arc::new(AnswerMap::default()),
        Arc::new(RecordingSleeper::new()),
        settings,
    )
    .execute(&workspace, &Operation::plan(snapshot()), &CancellationToken::new())
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(err, RunError::RunCreationFailed { stage: "run", .. }));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_confirmation_times_out_and_discards() {
    let (service, workspace) = service_with_prod(RunScript::default());
    let settings = OrchestratorSettings {
        confirm_timeout: Duration::from_secs(60),
        ..OrchestratorSettings::default()
    };

    let report = orchestrator_with(
        service.clone(),
        Arc::new(SilentOperator),
        Arc::new(RecordingSleeper::new()),
        settings,
    )
    .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Discarded {
            reason: DiscardReason::ConfirmationTimedOut
        }
    );
    assert_eq!(report.phase, RunPhase::Discarded);
    assert_eq!(service.calls("discard_run"), 1);
    assert_eq!(service.calls("create_apply"), 0);
}

#[tokio::test]
async fn test_abort_answer_cancels_planned_run_by_discarding() {
    let (service, workspace) = service_with_prod(RunScript::default());
    let confirmer = Arc::new(AnswerMap::default().with(APPROVE, "abort"));

    let report = orchestrator(service.clone(), confirmer)
        .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert_eq!(service.calls("discard_run"), 1);
    assert_eq!(service.calls("cancel_run"), 0);
}

#[tokio::test]
async fn test_auto_apply_workspace_skips_confirmation() {
    let service = Arc::new(InMemoryService::new());
    service.add_organization(ORG, true);
    let workspace = service.add_workspace(
        ORG,
        WorkspaceCreateOptions {
            auto_apply: true,
            ..WorkspaceCreateOptions::named("prod")
        },
    );
    let confirmer = Arc::new(AnswerMap::default());

    let report = orchestrator(service.clone(), confirmer.clone())
        .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Applied);
    assert!(matches!(report.outcome, RunOutcome::Applied { .. }));
    assert_eq!(service.calls("create_apply"), 0);
    assert!(confirmer.asked().is_empty());
}

fn auto_apply_workspace(script: RunScript) -> (Arc<InMemoryService>, Workspace) {
    let service = Arc::new(InMemoryService::new().with_script(script));
    service.add_organization(ORG, true);
    let workspace = service.add_workspace(
        ORG,
        WorkspaceCreateOptions {
            auto_apply: true,
            ..WorkspaceCreateOptions::named("prod")
        },
    );
    (service, workspace)
}

#[tokio::test]
async fn test_auto_apply_unknown_run_status_exhausts() {
    let (service, workspace) = auto_apply_workspace(
        RunScript::default()
            .without_auto_apply_start()
            .with_run_statuses(vec![
                RunStatus::Pending,
                RunStatus::Planning,
                RunStatus::Planned,
                RunStatus::parse("policy_checked"),
            ]),
    );
    let cancel = CancellationToken::new();
    let sleeper = Arc::new(RecordingSleeper::cancel_after(200, cancel.clone()));

    let err = orchestrator_with(
        service.clone(),
        Arc::new(AnswerMap::default()),
        sleeper,
        OrchestratorSettings::default(),
    )
    .execute(&workspace, &Operation::apply(snapshot()), &cancel)
    .await
    .unwrap_err();

    match err {
        RunError::UnknownRunState { status, polls, .. } => {
            assert_eq!(status, "policy_checked");
            assert_eq!(polls, 10);
        }
        other => panic!("expected an unknown run state, got {other:?}"),
    }
    assert!(!cancel.is_cancelled());
    assert_eq!(service.calls("create_apply"), 0);
}

#[tokio::test]
async fn test_auto_apply_that_never_starts_is_confirmed() {
    let (service, workspace) = auto_apply_workspace(RunScript::default().without_auto_apply_start());
    let confirmer = Arc::new(AnswerMap::default());

    let report = orchestrator(service.clone(), confirmer.clone())
        .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Applied);
    assert!(matches!(report.outcome, RunOutcome::Applied { .. }));
    assert_eq!(service.calls("create_apply"), 1);
    assert!(confirmer.asked().is_empty());
}

#[tokio::test]
async fn test_lagging_plan_is_polled_until_finished() {
    let (service, workspace) = service_with_prod(
        RunScript::default()
            .with_changes(ResourceChanges::new(1, 0, 0))
            .with_plan_lag(vec![PlanStatus::Running, PlanStatus::Pending]),
    );

    let report = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(
            &workspace,
            &Operation::apply(snapshot()).auto_approve(true),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Applied);
    match report.outcome {
        RunOutcome::Applied { changes, .. } => assert_eq!(changes, ResourceChanges::new(1, 0, 0)),
        other => panic!("expected an applied run, got {other:?}"),
    }
    assert_eq!(service.calls("read_plan"), 3);
    assert_eq!(service.calls("create_apply"), 1);
}

#[tokio::test]
async fn test_plan_stuck_in_unknown_status_never_reaches_apply() {
    let (service, workspace) = service_with_prod(
        RunScript::default().with_plan_lag(vec![PlanStatus::parse("awaiting_decision"); 12]),
    );

    let err = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(
            &workspace,
            &Operation::apply(snapshot()).auto_approve(true),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::UnknownRunState { polls: 10, .. }));
    assert_eq!(service.calls("read_plan"), 10);
    assert_eq!(service.calls("create_apply"), 0);
}

#[tokio::test]
async fn test_policy_check_in_unknown_status_exhausts() {
    let (service, workspace) = service_with_prod(RunScript::default().with_policy(PolicyScript {
        statuses: vec![PolicyStatus::parse("soft_failed_pending")],
        overridable: false,
    }));

    let err = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(&workspace, &Operation::plan(snapshot()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::UnknownRunState { polls: 10, .. }));
    assert_eq!(err.kind(), ErrorKind::UnknownRunState);
    assert_eq!(service.calls("create_apply"), 0);
}

#[tokio::test]
async fn test_apply_in_unknown_status_exhausts() {
    let (service, workspace) = service_with_prod(
        RunScript::default().with_apply_statuses(vec![ApplyStatus::parse("finishing")]),
    );

    let err = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(
            &workspace,
            &Operation::apply(snapshot()).auto_approve(true),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        RunError::UnknownRunState { status, polls, .. } => {
            assert_eq!(status, "finishing");
            assert_eq!(polls, 10);
        }
        other => panic!("expected an unknown run state, got {other:?}"),
    }
    assert_eq!(service.calls("create_apply"), 1);
}

#[tokio::test]
async fn test_remote_plan_error_fails_run() {
    let (service, workspace) = service_with_prod(
        RunScript::default().with_run_statuses(vec![RunStatus::Planning, RunStatus::Errored]),
    );

    let err = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(&workspace, &Operation::apply(snapshot()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::RunErrored { .. }));
    assert_eq!(err.kind(), ErrorKind::Failed);
    assert_eq!(service.calls("create_apply"), 0);
}

#[tokio::test]
async fn test_destroy_flag_only_reaches_remote_request() {
    let (service, workspace) = service_with_prod(RunScript::default());

    let report = orchestrator(service.clone(), Arc::new(AutoApprove))
        .execute(
            &workspace,
            &Operation::apply(snapshot()).destroy(true),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.phase, RunPhase::Applied);
    let run = service.run(report.run_id.as_deref().unwrap()).unwrap();
    assert!(run.is_destroy);
}
