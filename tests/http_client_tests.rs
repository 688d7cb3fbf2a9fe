//! HTTP remote service tests
//!
//! These tests use wiremock to serve JSON:API documents so the HTTP client
//! and the error taxonomy can be checked without network access.

use reqwest::Url;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use remote_runs::api::types::{RunStatus, Workspace};
use remote_runs::api::{
    ApiError, HttpRemoteService, RemoteService, RetryConfig, RetryHandler,
};
use remote_runs::clock::RecordingSleeper;
use remote_runs::confirm::AnswerMap;
use remote_runs::http::{RateLimit, RateLimitedHttpClient};
use remote_runs::observability::ApiMetrics;
use remote_runs::run::{
    ConfigurationSnapshot, Operation, OrchestratorSettings, RunOrchestrator, RunOutcome,
};

const TOKEN: &str = "mock-token";

struct RemoteApiMock {
    server: MockServer,
    metrics: Arc<ApiMetrics>,
}

impl RemoteApiMock {
    async fn new() -> Self {
        Self {
            server: MockServer::start().await,
            metrics: Arc::new(ApiMetrics::new()),
        }
    }

    fn service(&self) -> HttpRemoteService {
        let base = Url::parse(&format!("{}/api/v2", self.server.uri())).unwrap();
        let client = RateLimitedHttpClient::new(
            base,
            TOKEN.to_string(),
            RateLimit::default(),
            Duration::from_secs(5),
            self.metrics.clone(),
        )
        .unwrap();
        HttpRemoteService::new(client)
    }

    async fn respond(&self, verb: &str, route: &str, status: u16, body: Value) {
        Mock::given(method(verb))
            .and(path(route))
            .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
    }
}

fn error_body(title: &str, detail: &str) -> Value {
    json!({ "errors": [{ "status": "error", "title": title, "detail": detail }] })
}

#[tokio::test]
async fn test_read_organization_decodes_permissions() {
    let api = RemoteApiMock::new().await;
    api.respond(
        "GET",
        "/api/v2/organizations/hashicorp",
        200,
        json!({
            "data": {
                "id": "hashicorp",
                "type": "organizations",
                "attributes": {
                    "name": "hashicorp",
                    "email": "admin@hashicorp.example",
                    "permissions": { "can-create-workspace": true, "can-update": false }
                }
            }
        }),
    )
    .await;

    let org = api.service().read_organization("hashicorp").await.unwrap();
    assert_eq!(org.name, "hashicorp");
    assert!(org.permissions.can_create_workspace);
    assert!(!org.permissions.can_update);
    assert_eq!(api.metrics.get_stats().total_requests, 1);
}

#[tokio::test]
async fn test_error_statuses_map_to_typed_errors() {
    let api = RemoteApiMock::new().await;
    api.respond("GET", "/api/v2/runs/run-404", 404, error_body("not found", "run-404")).await;
    api.respond(
        "POST",
        "/api/v2/runs/run-409/actions/discard",
        409,
        error_body("transition not allowed", "run is already applied"),
    )
    .await;
    api.respond("GET", "/api/v2/runs/run-401", 401, error_body("unauthorized", "bad token")).await;
    api.respond("GET", "/api/v2/runs/run-500", 500, json!({})).await;
    api.respond(
        "POST",
        "/api/v2/runs",
        422,
        error_body("invalid attribute", "Configuration version is missing"),
    )
    .await;

    let service = api.service();

    let err = service.read_run("run-404").await.unwrap_err();
    assert!(err.is_not_found());

    let err = service.discard_run("run-409", "done").await.unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("run is already applied"));

    let err = service.read_run("run-401").await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized { .. }));
    assert!(err.hint().is_some());

    let err = service.read_run("run-500").await.unwrap_err();
    assert!(matches!(err, ApiError::Server { status: 500, .. }));
    assert!(!err.is_retryable());

    let options = remote_runs::api::types::RunCreateOptions {
        workspace_id: "ws-1".to_string(),
        configuration_version_id: "cv-1".to_string(),
        is_destroy: false,
        message: None,
    };
    let err = service.create_run(&options).await.unwrap_err();
    match err {
        ApiError::Rejected { status, message } => {
            assert_eq!(status, 422);
            assert_eq!(message, "invalid attribute: Configuration version is missing");
        }
        other => panic!("expected a rejected request, got {other:?}"),
    }

    assert_eq!(api.metrics.get_stats().errors, 5);
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    // Nothing listens on port 1
    let client = RateLimitedHttpClient::new(
        Url::parse("http://127.0.0.1:1/api/v2").unwrap(),
        TOKEN.to_string(),
        RateLimit::default(),
        Duration::from_secs(2),
        Arc::new(ApiMetrics::new()),
    )
    .unwrap();

    let err = HttpRemoteService::new(client).read_run("run-1").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, ApiError::Transport { .. }));
}

#[tokio::test]
async fn test_list_workspaces_follows_pagination_and_filters_prefix() {
    let api = RemoteApiMock::new().await;
    let workspace = |id: &str, name: &str| {
        json!({ "id": id, "type": "workspaces", "attributes": { "name": name } })
    };

    Mock::given(method("GET"))
        .and(path("/api/v2/organizations/hashicorp/workspaces"))
        .and(query_param("page[number]", "1"))
        .and(query_param("search[name]", "app-"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [workspace("ws-1", "app-prod"), workspace("ws-2", "my-app-dev")],
            "meta": { "pagination": { "current-page": 1, "next-page": 2 } }
        })))
        .mount(&api.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/organizations/hashicorp/workspaces"))
        .and(query_param("page[number]", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [workspace("ws-3", "app-staging")],
            "meta": { "pagination": { "current-page": 2, "next-page": null } }
        })))
        .mount(&api.server)
        .await;

    let workspaces = api
        .service()
        .list_workspaces("hashicorp", Some("app-"))
        .await
        .unwrap();
    let names: Vec<&str> = workspaces.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, vec!["app-prod", "app-staging"]);
    assert!(workspaces.iter().all(|w| w.organization == "hashicorp"));
}

#[tokio::test]
async fn test_noop_plan_over_http() {
    let api = RemoteApiMock::new().await;
    let upload_url = format!("{}/upload/cv-1", api.server.uri());

    Mock::given(method("POST"))
        .and(path("/api/v2/workspaces/ws-1/configuration-versions"))
        .and(body_partial_json(json!({
            "data": { "attributes": { "speculative": true } }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {
                "id": "cv-1",
                "type": "configuration-versions",
                "attributes": { "status": "pending", "speculative": true, "upload-url": upload_url }
            }
        })))
        .expect(1)
        .mount(&api.server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/cv-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&api.server)
        .await;

    let run = json!({
        "data": {
            "id": "run-1",
            "type": "runs",
            "attributes": { "status": "planned", "is-destroy": false, "message": "queued" },
            "relationships": {
                "workspace": { "data": { "id": "ws-1", "type": "workspaces" } },
                "plan": { "data": { "id": "plan-1", "type": "plans" } },
                "policy-checks": { "data": [] }
            }
        }
    });
    Mock::given(method("POST"))
        .and(path("/api/v2/runs"))
        .and(body_partial_json(json!({
            "data": { "relationships": { "configuration-version": { "data": { "id": "cv-1" } } } }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(run.clone()))
        .expect(1)
        .mount(&api.server)
        .await;
    api.respond("GET", "/api/v2/runs/run-1", 200, run).await;
    api.respond(
        "GET",
        "/api/v2/plans/plan-1",
        200,
        json!({
            "data": {
                "id": "plan-1",
                "type": "plans",
                "attributes": {
                    "status": "finished",
                    "resource-additions": 0,
                    "resource-changes": 0,
                    "resource-destructions": 0
                }
            }
        }),
    )
    .await;
    api.respond("GET", "/api/v2/runs/run-1/policy-checks", 200, json!({ "data": [] })).await;
    Mock::given(method("POST"))
        .and(path("/api/v2/runs/run-1/actions/apply"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&api.server)
        .await;

    let sleeper = Arc::new(RecordingSleeper::new());
    let orchestrator = RunOrchestrator::new(
        Arc::new(api.service()),
        Arc::new(AnswerMap::default()),
        sleeper.clone(),
        RetryHandler::new(RetryConfig::default(), sleeper),
        OrchestratorSettings::default(),
    );
    let workspace = Workspace {
        id: "ws-1".to_string(),
        name: "prod".to_string(),
        organization: "hashicorp".to_string(),
        working_directory: None,
        auto_apply: false,
    };
    let config = ConfigurationSnapshot::new().with_file("main.tf", "# empty\n");

    let report = orchestrator
        .execute(&workspace, &Operation::plan(config), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::NoChanges);
    assert_eq!(report.run_id.as_deref(), Some("run-1"));

    let run = api.service().read_run("run-1").await.unwrap();
    assert_eq!(run.status, RunStatus::Planned);
    assert_eq!(run.plan_id.as_deref(), Some("plan-1"));
    assert!(run.policy_check_ids.is_empty());
}
