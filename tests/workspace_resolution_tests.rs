//! Workspace resolution against the in-memory remote service

use proptest::prelude::*;
use std::sync::Arc;

use remote_runs::api::types::WorkspaceCreateOptions;
use remote_runs::api::{InMemoryService, RetryConfig, RetryHandler};
use remote_runs::clock::RecordingSleeper;
use remote_runs::workspace::{
    Resolution, ResolveError, WorkspaceResolver, WorkspaceSelector, WorkspaceSettings,
    DEFAULT_ENVIRONMENT,
};

fn retry() -> RetryHandler {
    RetryHandler::new(RetryConfig::default(), Arc::new(RecordingSleeper::new()))
}

fn seeded_service() -> Arc<InMemoryService> {
    let service = Arc::new(InMemoryService::new());
    service.add_organization("hashicorp", true);
    for name in ["my-app-prod", "my-app-staging", "my-app-", "other-prod"] {
        service.add_workspace("hashicorp", WorkspaceCreateOptions::named(name));
    }
    service
}

#[tokio::test]
async fn test_name_mode_resolves_exactly_one_workspace() {
    let service = seeded_service();
    let resolver = WorkspaceResolver::new(
        service.clone(),
        "hashicorp",
        &WorkspaceSettings::named("other-prod"),
        retry(),
    )
    .unwrap();

    match resolver.resolve().await.unwrap() {
        Resolution::Single(ws) => assert_eq!(ws.name, "other-prod"),
        other => panic!("expected a single workspace, got {other:?}"),
    }
    assert_eq!(resolver.workspace_names().await.unwrap(), vec![DEFAULT_ENVIRONMENT]);
}

#[tokio::test]
async fn test_prefix_mode_lists_matching_environments() {
    let service = seeded_service();
    let resolver = WorkspaceResolver::new(
        service.clone(),
        "hashicorp",
        &WorkspaceSettings::prefixed("my-app-"),
        retry(),
    )
    .unwrap();

    let workspaces = resolver.resolve().await.unwrap().into_workspaces();
    assert_eq!(workspaces.len(), 3);
    assert!(workspaces.iter().all(|w| w.name.starts_with("my-app-")));

    // The bare prefix has no environment name and is left out
    assert_eq!(
        resolver.workspace_names().await.unwrap(),
        vec!["prod".to_string(), "staging".to_string()]
    );

    let staging = resolver.resolve_named("staging").await.unwrap();
    assert_eq!(staging.name, "my-app-staging");
}

#[tokio::test]
async fn test_prefix_mode_may_match_nothing() {
    let service = seeded_service();
    let resolver = WorkspaceResolver::new(
        service,
        "hashicorp",
        &WorkspaceSettings::prefixed("nothing-"),
        retry(),
    )
    .unwrap();

    assert_eq!(resolver.resolve().await.unwrap(), Resolution::Matching(Vec::new()));
    assert!(resolver.workspace_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_prefix_mode_rejects_default_environment() {
    let resolver = WorkspaceResolver::new(
        seeded_service(),
        "hashicorp",
        &WorkspaceSettings::prefixed("my-app-"),
        retry(),
    )
    .unwrap();

    let err = resolver.resolve_named(DEFAULT_ENVIRONMENT).await.unwrap_err();
    assert!(matches!(err, ResolveError::Configuration(_)));
}

#[tokio::test]
async fn test_unknown_organization_is_configuration_error_before_any_run() {
    let service = seeded_service();
    let resolver = WorkspaceResolver::new(
        service.clone(),
        "other-org",
        &WorkspaceSettings::named("prod"),
        retry(),
    )
    .unwrap();

    let err = resolver.resolve_named(DEFAULT_ENVIRONMENT).await.unwrap_err();
    match err {
        ResolveError::Configuration(message) => assert!(message.contains("other-org")),
        other => panic!("expected a configuration error, got {other:?}"),
    }
    assert_eq!(service.calls("create_workspace"), 0);
    assert_eq!(service.calls("create_configuration_version"), 0);
    assert_eq!(service.calls("create_run"), 0);
}

#[test]
fn test_empty_organization_is_rejected() {
    let err = WorkspaceResolver::new(
        seeded_service(),
        "",
        &WorkspaceSettings::named("prod"),
        retry(),
    )
    .unwrap_err();
    assert!(matches!(err, ResolveError::Configuration(_)));
}

fn workspace_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}"
}

proptest! {
    #[test]
    fn prop_name_and_prefix_together_are_rejected(
        name in workspace_name(),
        prefix in workspace_name(),
    ) {
        let settings = WorkspaceSettings { name: Some(name), prefix: Some(prefix) };
        prop_assert!(matches!(settings.selector(), Err(ResolveError::Configuration(_))));
    }

    #[test]
    fn prop_exactly_one_selector_is_accepted(name in workspace_name(), by_name in any::<bool>()) {
        let settings = if by_name {
            WorkspaceSettings::named(&name)
        } else {
            WorkspaceSettings::prefixed(&name)
        };
        let expected = if by_name {
            WorkspaceSelector::Name(name.clone())
        } else {
            WorkspaceSelector::Prefix(name.clone())
        };
        prop_assert_eq!(settings.selector().unwrap(), expected);
    }
}
