//! HTTP error taxonomy shared by every handler.
//!
//! Each variant maps to exactly one status code. The response body mirrors the
//! identity backend's error document so front-ends can treat both the same way:
//!
//! ```json
//! {"error": {"code": 401, "class": "InvalidCredentialError", "details": "..."}}
//! ```

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{
    identity::IdentityError,
    oidc::OidcError,
    session::{CodecError, StoreError},
    totp::TotpError,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InputParameter(String),
    #[error("{0}")]
    MissingParameter(String),
    #[error("{0}")]
    InvalidCredential(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ResourceBusy(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    InternalServer(String),
    /// Error returned by the identity backend, surfaced verbatim.
    #[error("{details}")]
    Remote {
        code: u16,
        class: String,
        details: String,
    },
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InputParameter(_) | Self::MissingParameter(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredential(_) | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ResourceBusy(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::InternalServer(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Remote { code, .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Error class name as reported to clients, e.g. `InvalidCredentialError`.
    #[must_use]
    pub fn class(&self) -> &str {
        match self {
            Self::InputParameter(_) => "InputParameterError",
            Self::MissingParameter(_) => "MissingParameterError",
            Self::InvalidCredential(_) => "InvalidCredentialError",
            Self::Unauthorized(_) => "UnauthorizedError",
            Self::Forbidden(_) => "ForbiddenError",
            Self::NotFound(_) => "NotFoundError",
            Self::Conflict(_) => "ConflictError",
            Self::ResourceBusy(_) => "ResourceBusyError",
            Self::Timeout(_) => "TimeoutError",
            Self::NotImplemented(_) => "NotImplementedError",
            Self::InternalServer(_) => "InternalServerError",
            Self::Remote { class, .. } => class,
        }
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        Self::InternalServer(err.to_string())
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Remote {
                code,
                class,
                details,
                ..
            } => Self::Remote {
                code,
                class,
                details,
            },
            IdentityError::NotFound(what) => Self::NotFound(what),
            IdentityError::Timeout => Self::Timeout("identity backend timeout".to_string()),
            other => Self::InternalServer(other.to_string()),
        }
    }
}

impl From<TotpError> for ApiError {
    fn from(err: TotpError) -> Self {
        match err {
            TotpError::Backend(err) => err.into(),
            TotpError::RecoveryMismatch | TotpError::NoQuestions => {
                Self::InputParameter(err.to_string())
            }
            other => Self::InternalServer(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::InternalServer(err.to_string())
    }
}

/// Anything that fails to decode is a bad credential from the client's view.
impl From<CodecError> for ApiError {
    fn from(err: CodecError) -> Self {
        Self::InvalidCredential(format!("invalid session token: {err}"))
    }
}

impl From<OidcError> for ApiError {
    fn from(err: OidcError) -> Self {
        match err {
            OidcError::Json(err) => Self::InternalServer(err.to_string()),
            other => Self::InvalidCredential(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "class": self.class(),
                "details": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[test]
    fn kinds_map_to_status() {
        let cases = [
            (ApiError::InputParameter(String::new()), 400),
            (ApiError::MissingParameter(String::new()), 400),
            (ApiError::InvalidCredential(String::new()), 401),
            (ApiError::Unauthorized(String::new()), 401),
            (ApiError::Forbidden(String::new()), 403),
            (ApiError::NotFound(String::new()), 404),
            (ApiError::Conflict(String::new()), 409),
            (ApiError::ResourceBusy(String::new()), 429),
            (ApiError::Timeout(String::new()), 504),
            (ApiError::NotImplemented(String::new()), 501),
            (ApiError::InternalServer(String::new()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code, "{}", err.class());
        }
    }

    #[test]
    fn remote_error_keeps_backend_code_and_class() {
        let err = ApiError::from(IdentityError::Remote {
            code: 409,
            class: "UserLockedError".to_string(),
            details: "too many failed attempts".to_string(),
            data: None,
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.class(), "UserLockedError");
        assert_eq!(err.to_string(), "too many failed attempts");
    }

    #[test]
    fn totp_errors_map_to_kinds() {
        assert_eq!(
            ApiError::from(TotpError::RecoveryMismatch).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(TotpError::Qr("boom".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(CodecError::TooShort).class(),
            "InvalidCredentialError"
        );
    }

    #[tokio::test]
    async fn renders_json_body() {
        let response = ApiError::ResourceBusy("locked, retry after 30 seconds".to_string())
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["class"], "ResourceBusyError");
        assert_eq!(value["error"]["code"], 429);
        assert_eq!(value["error"]["details"], "locked, retry after 30 seconds");
    }
}
