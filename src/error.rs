//! Error types for mock resolution and execution.

use http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the mock engine.
///
/// Every variant is a single-attempt, caller-visible failure. Nothing here is
/// retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MockError {
    /// No definition matched the request.
    #[error("no matching mock definition")]
    NotFound,

    /// The project is on the block list.
    #[error("interface requested too frequently, access restricted")]
    Blocked,

    /// A write was rejected before reaching the repository.
    #[error("{0}")]
    InvalidRequest(String),

    /// A definition with the same project, pattern and method already exists.
    #[error("mock definition already exists")]
    Conflict,

    /// The template did not finish within its wall-clock budget.
    #[error("template execution timed out")]
    SandboxTimeout,

    /// The template failed to compile or threw while running.
    #[error("template error: {0}")]
    SandboxRuntime(String),

    /// The upstream of a proxy-mode definition could not be reached or errored.
    #[error("{0}")]
    UpstreamFailure(String),

    /// Repository or cache failure.
    #[error("repository error: {0}")]
    Repository(String),
}

/// Result alias used across the crate.
pub type MockResult<T> = Result<T, MockError>;

impl MockError {
    /// HTTP status the calling layer should use for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            MockError::NotFound => StatusCode::NOT_FOUND,
            MockError::SandboxTimeout
            | MockError::SandboxRuntime(_)
            | MockError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MockError::Blocked
            | MockError::InvalidRequest(_)
            | MockError::Conflict
            | MockError::UpstreamFailure(_) => StatusCode::OK,
        }
    }

    /// Envelope `code` for this error.
    pub fn code(&self) -> i64 {
        match self {
            MockError::NotFound => 404,
            MockError::InvalidRequest(_) => 10001,
            MockError::SandboxTimeout | MockError::SandboxRuntime(_) | MockError::Repository(_) => {
                500
            }
            MockError::Blocked | MockError::Conflict | MockError::UpstreamFailure(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(MockError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(MockError::SandboxTimeout.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            MockError::UpstreamFailure("boom".into()).status(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_upstream_message_is_surfaced() {
        let err = MockError::UpstreamFailure("connect ECONNREFUSED".to_string());
        assert_eq!(err.to_string(), "connect ECONNREFUSED");
        assert_eq!(err.code(), -1);
    }
}
