//! Maps the three crate-local error enums onto HTTP status codes, the way
//! `minisgl-cpu-gateway` maps upstream proxy failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use digs_core::DigsError;
use digs_leader::LeaderLockError;
use digs_rolemgr::RoleManagerError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] DigsError),

    #[error(transparent)]
    RoleManager(#[from] RoleManagerError),

    #[error(transparent)]
    Leader(#[from] LeaderLockError),
}

impl ServiceError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServiceError::Core(DigsError::IllegalParameter(_)) => (StatusCode::BAD_REQUEST, "ILLEGAL_PARAMETER"),
            ServiceError::Core(DigsError::ResourceNotFound(_)) => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND"),
            ServiceError::Core(DigsError::StateError(_)) => (StatusCode::CONFLICT, "STATE_ERROR"),
            ServiceError::Core(DigsError::Timeout(_)) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ServiceError::Core(DigsError::NoSatisfiedResource(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_SATISFIED_RESOURCE")
            }
            ServiceError::Core(DigsError::StatisticalError(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STATISTICAL_ERROR")
            }
            ServiceError::RoleManager(RoleManagerError::Core(inner)) => {
                return ServiceError::Core(inner.clone()).status_and_code()
            }
            ServiceError::RoleManager(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ROLE_MANAGER_ERROR"),
            ServiceError::Leader(LeaderLockError::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ServiceError::Leader(_) => (StatusCode::INTERNAL_SERVER_ERROR, "LEADER_LOCK_ERROR"),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        tracing::warn!(error = %self, code, "request failed");
        (
            status,
            Json(json!({
                "error": {
                    "message": self.to_string(),
                    "code": code,
                }
            })),
        )
            .into_response()
    }
}
