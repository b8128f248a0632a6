use std::sync::Arc;

use axum::{
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::{ledger::StoreError, membership::MembershipError, session::SessionError};

/// Seconds a client should wait before retrying after an infrastructure failure.
pub const RETRY_AFTER_SECS: &str = "5";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized")]
    Unauthenticated,

    #[error("Forbidden")]
    Forbidden,

    #[error("Unknown proposal: {0}")]
    NotFound(String),

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Service unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        error!("Upvote store failure: {e}");
        AppError::InfrastructureUnavailable("upvote store".to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        error!("Session store failure: {e}");
        AppError::InfrastructureUnavailable("session store".to_string())
    }
}

fn membership_failure(e: &MembershipError) -> AppError {
    match e {
        MembershipError::InvalidToken => AppError::Unauthenticated,
        e => {
            error!("GitHub failure: {e}");
            AppError::InfrastructureUnavailable("github".to_string())
        }
    }
}

impl From<MembershipError> for AppError {
    fn from(e: MembershipError) -> Self {
        membership_failure(&e)
    }
}

/// Shared by every caller waiting on the same cached lookup.
impl From<Arc<MembershipError>> for AppError {
    fn from(e: Arc<MembershipError>) -> Self {
        membership_failure(&e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::InfrastructureUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut response = (status, self.to_string()).into_response();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let cases = [
            (AppError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AppError::Forbidden, StatusCode::FORBIDDEN),
            (AppError::NotFound("s1".to_string()), StatusCode::NOT_FOUND),
            (AppError::MalformedPayload, StatusCode::BAD_REQUEST),
            (
                AppError::InfrastructureUnavailable("redis".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn unavailable_asks_for_retry() {
        let response = AppError::InfrastructureUnavailable("redis".to_string()).into_response();

        assert_eq!(response.headers()[RETRY_AFTER], RETRY_AFTER_SECS);
    }

    #[test]
    fn rejected_token_is_unauthenticated() {
        assert!(matches!(
            AppError::from(MembershipError::InvalidToken),
            AppError::Unauthenticated
        ));
        assert!(matches!(
            AppError::from(Arc::new(MembershipError::InvalidToken)),
            AppError::Unauthenticated
        ));
        assert!(matches!(
            AppError::from(Arc::new(MembershipError::Status(
                reqwest::StatusCode::BAD_GATEWAY
            ))),
            AppError::InfrastructureUnavailable(_)
        ));
    }
}
