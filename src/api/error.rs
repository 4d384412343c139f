//! Mapping from marketplace errors to HTTP responses.

use axum::http::StatusCode;

use crate::marketplace::MarketError;

/// HTTP status for a marketplace error kind.
pub fn status_for(err: &MarketError) -> StatusCode {
    match err {
        MarketError::AlreadyHasActiveTask
        | MarketError::TaskAlreadyTaken
        | MarketError::TaskUnavailable
        | MarketError::AlreadyFinalized { .. }
        | MarketError::InvalidTransition { .. } => StatusCode::CONFLICT,
        MarketError::ClaimExpired => StatusCode::GONE,
        MarketError::WrongProofSlot { .. } | MarketError::InvalidArtifact(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        MarketError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        MarketError::NotOwner | MarketError::Forbidden(_) => StatusCode::FORBIDDEN,
        MarketError::NotFound(_) => StatusCode::NOT_FOUND,
        MarketError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Convert a marketplace error into the `(StatusCode, String)` handlers return.
///
/// The body is the user-facing message; storage details only go to the log.
pub fn market_error(err: MarketError) -> (StatusCode, String) {
    if let MarketError::Storage(detail) = &err {
        tracing::error!("Storage failure: {}", detail);
    }
    (status_for(&err), err.user_message())
}

/// Map any displayable error to a 500 response.
pub fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    tracing::error!("Internal error: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplace::ClaimStatus;

    #[test]
    fn test_race_errors_are_conflicts() {
        assert_eq!(status_for(&MarketError::TaskAlreadyTaken), StatusCode::CONFLICT);
        assert_eq!(status_for(&MarketError::AlreadyHasActiveTask), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&MarketError::AlreadyFinalized {
                status: ClaimStatus::Failed
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_proof_errors() {
        assert_eq!(status_for(&MarketError::ClaimExpired), StatusCode::GONE);
        assert_eq!(
            status_for(&MarketError::InvalidArtifact("too large".to_string())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&MarketError::NotOwner), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_storage_hides_detail() {
        let (status, body) = market_error(MarketError::storage("database is locked"));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.contains("locked"));
        assert!(body.contains("try again"));
    }
}
