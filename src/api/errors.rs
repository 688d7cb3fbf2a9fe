use serde::Deserialize;
use thiserror::Error;

/// Failure of a single remote service call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("could not decode response: {message}")]
    Decode { message: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        ApiError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        ApiError::Transport {
            message: message.into(),
        }
    }

    /// Map an HTTP error status onto the error taxonomy
    pub fn from_status(status: u16, resource: &str, message: String) -> Self {
        match status {
            404 => ApiError::NotFound {
                resource: resource.to_string(),
            },
            409 => ApiError::Conflict {
                resource: resource.to_string(),
                message,
            },
            401 | 403 => ApiError::Unauthorized { message },
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::Rejected { status, message },
        }
    }

    /// Only transport failures are safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }

    /// A short next step shown to the operator next to the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ApiError::NotFound { .. } => {
                Some("check the organization and workspace names in remote-runs.toml")
            }
            ApiError::Unauthorized { .. } => {
                Some("verify the API token for this hostname (REMOTE_RUNS_BACKEND__TOKEN)")
            }
            ApiError::Transport { .. } => Some("check network connectivity to the remote service"),
            ApiError::Conflict { .. } => Some("another run may be active in this workspace"),
            ApiError::Server { .. } => Some("the remote service is failing; retry later"),
            ApiError::Rejected { .. } | ApiError::Decode { .. } => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ApiError::Decode {
                message: err.to_string(),
            };
        }
        match err.status() {
            Some(status) => ApiError::from_status(status.as_u16(), "request", err.to_string()),
            None => ApiError::Transport {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    errors: Vec<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    title: Option<String>,
    detail: Option<String>,
}

/// Pull a human-readable message out of an error response body.
pub fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<ErrorDocument>(body)
        .ok()
        .and_then(|doc| doc.errors.into_iter().next())
        .and_then(|e| match (e.title, e.detail) {
            (Some(title), Some(detail)) => Some(format!("{title}: {detail}")),
            (title, detail) => title.or(detail),
        });

    match parsed {
        Some(message) => message,
        None if body.trim().is_empty() => "no response body".to_string(),
        None => body.trim().chars().take(200).collect(),
    }
}
