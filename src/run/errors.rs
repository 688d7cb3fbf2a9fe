use thiserror::Error;

use crate::api::types::RunStatus;
use crate::api::ApiError;
use crate::confirm::ConfirmError;
use crate::local::LocalError;
use crate::run::package::PackageError;
use crate::run::state_machine::TransitionError;
use crate::workspace::ResolveError;

/// Coarse classification of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    NotFound,
    Conflict,
    Unauthorized,
    Server,
    PolicyDenied,
    Canceled,
    UnknownRunState,
    Failed,
}

impl ErrorKind {
    fn of_api(err: &ApiError) -> Self {
        match err {
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::Conflict { .. } => ErrorKind::Conflict,
            ApiError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ApiError::Transport { .. } => ErrorKind::Transport,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Rejected { .. } | ApiError::Decode { .. } => ErrorKind::Failed,
        }
    }
}

fn describe(run_id: &Option<String>, status: &Option<RunStatus>) -> String {
    match (run_id, status) {
        (Some(id), Some(status)) => format!(" (run {id}, last status {status})"),
        (Some(id), None) => format!(" (run {id})"),
        _ => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to create run during {stage}: {source}")]
    RunCreationFailed {
        stage: &'static str,
        #[source]
        source: ApiError,
    },

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("{operation} failed: {source}{}", describe(run_id, status))]
    Api {
        operation: &'static str,
        run_id: Option<String>,
        status: Option<RunStatus>,
        #[source]
        source: ApiError,
    },

    #[error("run {run_id} errored during planning")]
    RunErrored { run_id: String, status: RunStatus },

    #[error("apply {apply_id} of run {run_id} errored")]
    ApplyErrored { run_id: String, apply_id: String },

    #[error("run {run_id} was discarded: policy checks failed ({})", failed.join(", "))]
    PolicyDenied { run_id: String, failed: Vec<String> },

    #[error("run {run_id} reported unrecognized status {status:?} for {polls} consecutive polls")]
    UnknownRunState {
        run_id: String,
        status: String,
        polls: u32,
    },

    #[error("run {run_id} applied but the state serial of {workspace_id} did not advance past {previous:?}")]
    StateNotAdvanced {
        run_id: String,
        workspace_id: String,
        previous: Option<u64>,
    },

    #[error("run {run_id} was canceled outside this session")]
    CanceledRemotely { run_id: String },

    #[error("confirmation failed{}: {source}", run_id.as_ref().map(|id| format!(" for run {id}")).unwrap_or_default())]
    Confirmation {
        run_id: Option<String>,
        #[source]
        source: ConfirmError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Local(#[from] LocalError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::RunCreationFailed { source, .. } | RunError::Api { source, .. } => {
                ErrorKind::of_api(source)
            }
            RunError::Package(_) => ErrorKind::Configuration,
            RunError::RunErrored { .. }
            | RunError::ApplyErrored { .. }
            | RunError::StateNotAdvanced { .. }
            | RunError::Confirmation { .. }
            | RunError::Transition(_) => ErrorKind::Failed,
            RunError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            RunError::UnknownRunState { .. } => ErrorKind::UnknownRunState,
            RunError::CanceledRemotely { .. } => ErrorKind::Canceled,
            RunError::Resolve(ResolveError::Configuration(_)) => ErrorKind::Configuration,
            RunError::Resolve(ResolveError::Api(err)) => ErrorKind::of_api(err),
            RunError::Local(LocalError::MissingProvider { .. }) => ErrorKind::Configuration,
            RunError::Local(_) => ErrorKind::Failed,
        }
    }

    /// Id of the remote run involved, when one had been created
    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunError::Api { run_id, .. } | RunError::Confirmation { run_id, .. } => {
                run_id.as_deref()
            }
            RunError::RunErrored { run_id, .. }
            | RunError::ApplyErrored { run_id, .. }
            | RunError::PolicyDenied { run_id, .. }
            | RunError::UnknownRunState { run_id, .. }
            | RunError::StateNotAdvanced { run_id, .. }
            | RunError::CanceledRemotely { run_id } => Some(run_id),
            _ => None,
        }
    }

    /// Operator hint for the underlying API failure, if any
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RunError::RunCreationFailed { source, .. } | RunError::Api { source, .. } => {
                source.hint()
            }
            RunError::Resolve(ResolveError::Api(err)) => err.hint(),
            RunError::PolicyDenied { .. } => {
                Some("review the failed policy checks in the remote run before retrying")
            }
            _ => None,
        }
    }
}
