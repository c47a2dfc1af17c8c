//! Error type returned by REST handlers and its HTTP mapping.
//!
//! Internal failures are logged with full detail and surface to the caller
//! as a generic 500 body.

use axum::{
    extract::multipart::MultipartError,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::AuthError;
use crate::packaging::PackagingError;
use crate::provider::ProviderError;
use crate::storage::StorageError;

/// Body of every non-2xx response.
#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("domain {0} is already taken")]
    DomainTaken(String),

    #[error("an account with email {0} already exists")]
    EmailTaken(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::DomainTaken(_) | Self::EmailTaken(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Packaging(
                PackagingError::UnsafePath(_)
                | PackagingError::TooLarge { .. }
                | PackagingError::UnsupportedEntry(_)
                | PackagingError::Corrupt(_),
            ) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Storage(_)
            | Self::Auth(_)
            | Self::Provider(_)
            | Self::Packaging(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DomainTaken(domain) => Self::DomainTaken(domain),
            StorageError::EmailTaken(email) => Self::EmailTaken(email),
            StorageError::DeploymentNotFound(_) => Self::NotFound("deployment"),
            StorageError::UserNotFound(_) => Self::NotFound("user"),
            other => Self::Storage(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::Validation(format!("invalid multipart body: {}", err.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
