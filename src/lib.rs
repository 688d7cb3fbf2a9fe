// remote-runs library: plan/apply runs against a remote execution service
// This exposes the core components for testing and integration

pub mod api;
pub mod backend;
pub mod clock;
pub mod config;
pub mod confirm;
pub mod credentials;
pub mod discovery;
pub mod http;
pub mod local;
pub mod observability;
pub mod run;
pub mod shutdown;
pub mod telemetry;
pub mod workspace;

// Re-export key types for easy access
pub use api::{ApiError, HttpRemoteService, InMemoryService, RemoteService, RetryConfig, RetryHandler};
pub use backend::{Backend, BackendError, RemoteBackend};
pub use clock::{RecordingSleeper, Sleeper, TokioSleeper};
pub use config::RemoteRunsConfig;
pub use confirm::{Answer, AnswerMap, AutoApprove, Confirmer, TerminalConfirmer};
pub use credentials::{ChainedCredentials, CredentialsSource, EnvCredentials, StaticCredentials};
pub use discovery::Disco;
pub use http::RateLimitedHttpClient;
pub use local::{LocalDelegate, LocalExecutor, ProviderSource, StaticProviders};
pub use observability::{ApiMetrics, OperationTimer};
pub use run::{
    ConfigurationSnapshot, DiscardReason, ErrorKind, Operation, RunError, RunOrchestrator,
    RunOutcome, RunPhase, RunReport,
};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_run_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workspace::{ResolveError, WorkspaceResolver, WorkspaceSettings};
