use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Every failure a service or handler can return.
///
/// Domain variants carry a stable code that clients may branch on.
/// Anything unexpected is wrapped in `Internal` and rendered generically.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("token has expired")]
    TokenExpired,
    #[error("token has already been used")]
    TokenAlreadyUsed,
    #[error("invalid or unknown password reset token")]
    InvalidResetToken,
    #[error("invalid or unknown email verification token")]
    InvalidVerificationToken,
    #[error("an account with this email already exists")]
    EmailAlreadyExists,
    #[error("email is already verified")]
    EmailAlreadyVerified,
    #[error("account deletion is already scheduled")]
    DeletionAlreadyScheduled,
    #[error("user not found")]
    UserNotFound,
    #[error("missing Authorization header")]
    MissingAuthHeader,
    #[error("Authorization header must use the Bearer scheme")]
    InvalidAuthFormat,
    #[error("{0}")]
    Validation(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::TokenRevoked => "TOKEN_REVOKED",
            AppError::TokenExpired => "TOKEN_EXPIRED",
            AppError::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            AppError::InvalidResetToken => "INVALID_RESET_TOKEN",
            AppError::InvalidVerificationToken => "INVALID_VERIFICATION_TOKEN",
            AppError::EmailAlreadyExists => "EMAIL_ALREADY_EXISTS",
            AppError::EmailAlreadyVerified => "EMAIL_ALREADY_VERIFIED",
            AppError::DeletionAlreadyScheduled => "DELETION_ALREADY_SCHEDULED",
            AppError::UserNotFound => "USER_NOT_FOUND",
            AppError::MissingAuthHeader => "MISSING_AUTH_HEADER",
            AppError::InvalidAuthFormat => "INVALID_AUTH_FORMAT",
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidCredentials
            | AppError::InvalidToken
            | AppError::TokenRevoked
            | AppError::TokenExpired
            | AppError::MissingAuthHeader
            | AppError::InvalidAuthFormat => StatusCode::UNAUTHORIZED,
            AppError::TokenAlreadyUsed
            | AppError::InvalidResetToken
            | AppError::InvalidVerificationToken
            | AppError::EmailAlreadyExists
            | AppError::EmailAlreadyVerified
            | AppError::DeletionAlreadyScheduled => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::UserNotFound => StatusCode::NOT_FOUND,
            AppError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            AppError::Internal(e) => e,
            other => anyhow::Error::new(other),
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Internal(e) => {
                error!(error = ?e, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            code: self.code(),
            message,
        };
        (self.status(), Json(body)).into_response()
    }
}
