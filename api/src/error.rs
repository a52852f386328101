use std::collections::BTreeMap;

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Per-field registration/validation messages, keyed by form field name.
pub type FieldErrors = BTreeMap<&'static str, &'static str>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("password hashing error: {0}")]
    PasswordHash(argon2::password_hash::Error),
    #[error("invalid credentials")]
    LoginFail,
    #[error("account locked")]
    AccountLocked,
    #[error("email not verified")]
    EmailNotVerified,
    #[error("invalid csrf token")]
    CsrfMismatch,
    #[error("{message}")]
    RateLimited {
        message: &'static str,
        retry_after: i64,
    },
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("validation failed")]
    Validation(FieldErrors),
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{message}")]
    Conflict {
        field: &'static str,
        message: &'static str,
    },
    #[error("not authenticated")]
    Unauthenticated,
    #[error("{0}")]
    NotFound(&'static str),
}

impl From<argon2::password_hash::Error> for AppError {
    fn from(inner: argon2::password_hash::Error) -> Self {
        AppError::PasswordHash(inner)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Sqlx(e) => {
                if let Some(db_err) = e.as_database_error() {
                    if db_err.is_unique_violation() {
                        return (
                            StatusCode::CONFLICT,
                            Json(json!({"error": "Email or username already exists"})),
                        )
                            .into_response();
                    }
                }
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "An internal error occurred. Please try again later."}),
                )
            }
            AppError::PasswordHash(e) => {
                tracing::error!("Password hashing error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "An internal error occurred. Please try again later."}),
                )
            }
            AppError::LoginFail => (
                StatusCode::UNAUTHORIZED,
                json!({"error": "Invalid credentials"}),
            ),
            AppError::AccountLocked => (
                StatusCode::LOCKED,
                json!({"error": "Account is temporarily locked due to too many failed attempts"}),
            ),
            AppError::EmailNotVerified => (
                StatusCode::FORBIDDEN,
                json!({"error": "Please verify your email address before logging in"}),
            ),
            AppError::CsrfMismatch => (
                StatusCode::FORBIDDEN,
                json!({"error": "Invalid CSRF token"}),
            ),
            AppError::RateLimited {
                message,
                retry_after,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": message, "retry_after": retry_after})),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
                return response;
            }
            AppError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": "Method not allowed"}),
            ),
            AppError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "Validation failed", "details": details}),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            AppError::Conflict { field, message } => (
                StatusCode::CONFLICT,
                json!({"error": message, "field": field}),
            ),
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                json!({"error": "Not authenticated"}),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_outcomes() {
        let cases = [
            (AppError::LoginFail, StatusCode::UNAUTHORIZED),
            (AppError::AccountLocked, StatusCode::LOCKED),
            (AppError::EmailNotVerified, StatusCode::FORBIDDEN),
            (AppError::CsrfMismatch, StatusCode::FORBIDDEN),
            (AppError::MethodNotAllowed, StatusCode::METHOD_NOT_ALLOWED),
            (AppError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AppError::Sqlx(sqlx::Error::RowNotFound), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = AppError::RateLimited {
            message: "Too many login attempts. Please try again later.",
            retry_after: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "42");
    }
}
