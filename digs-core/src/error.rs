use thiserror::Error;

/// Mirrors the `Status` codes the scheduler's C++ ancestor returns from
/// every public entry point, so log lines and error messages stay
/// recognizable across the two implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigsError {
    #[error("illegal parameter: {0}")]
    IllegalParameter(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid state transition: {0}")]
    StateError(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("no satisfied resource available for request {0}")]
    NoSatisfiedResource(String),

    #[error("statistical error: {0}")]
    StatisticalError(String),
}

pub type DigsResult<T> = Result<T, DigsError>;
