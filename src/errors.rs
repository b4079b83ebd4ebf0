use hyper::{Method, StatusCode};

use crate::auth::AuthError;
use crate::storage::StorageError;
use crate::upstream::UpstreamError;

/// Failure modes of the relay path. Each variant maps to exactly one wire
/// status; the message becomes the `error` field of the JSON body.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid or expired token")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::InsufficientBalance | RelayError::Upstream(_) | RelayError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidToken => RelayError::Unauthorized,
            AuthError::Storage(e) => RelayError::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_variant_maps_to_its_wire_status() {
        assert_eq!(RelayError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RelayError::NotFound("forwarding route").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::MethodNotAllowed(Method::PATCH).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            RelayError::InsufficientBalance.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn insufficient_balance_keeps_its_wire_message() {
        assert_eq!(
            RelayError::InsufficientBalance.to_string(),
            "Insufficient balance"
        );
    }
}
