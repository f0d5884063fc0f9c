use service_core::error::AppError;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use validator::{ValidationError, ValidationErrors};

use crate::models::Role;

/// Why an authorization check failed. Logged, never shown to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzDenial {
    NotAMember,
    InsufficientRole { held: Role },
}

impl fmt::Display for AuthzDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthzDenial::NotAMember => f.write_str("not a member"),
            AuthzDenial::InsufficientRole { held } => write!(f, "insufficient role ({held})"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Forbidden: {0}")]
    Forbidden(AuthzDenial),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Gone(String),

    #[error("{0}")]
    LastOwnerViolation(String),

    #[error("{entity} {id} does not belong to {scope}")]
    ScopeMismatch {
        entity: &'static str,
        id: Uuid,
        scope: String,
    },

    #[error("Ciphertext failed integrity verification")]
    Integrity,

    #[error("Rate limit exceeded for {class}")]
    Throttled {
        class: &'static str,
        remaining: u32,
        retry_after_secs: u64,
    },

    #[error("Storage transaction timed out")]
    Timeout,

    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Single-field validation failure.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        let mut error = ValidationError::new("invalid");
        error.message = Some(Cow::Owned(message.into()));
        let mut errors = ValidationErrors::new();
        errors.add(field, error);
        ServiceError::Validation(errors)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound(what.into())
    }

    pub fn database(context: &str, err: sqlx::Error) -> Self {
        ServiceError::Database(anyhow::anyhow!("{}: {}", context, err))
    }

    pub fn poisoned() -> Self {
        ServiceError::Internal(anyhow::anyhow!("in-memory store lock poisoned"))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(e) => AppError::ValidationError(e),
            ServiceError::Forbidden(_) => {
                AppError::Forbidden(anyhow::anyhow!("Insufficient permissions"))
            }
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::Gone(msg) => AppError::Gone(anyhow::anyhow!(msg)),
            ServiceError::LastOwnerViolation(msg) => {
                AppError::LastOwnerViolation(anyhow::anyhow!(msg))
            }
            e @ ServiceError::ScopeMismatch { .. } => {
                AppError::ScopeMismatch(anyhow::anyhow!(e.to_string()))
            }
            ServiceError::Integrity => {
                AppError::InternalError(anyhow::anyhow!("stored ciphertext failed verification"))
            }
            ServiceError::Throttled {
                class,
                remaining,
                retry_after_secs,
            } => AppError::TooManyRequests {
                message: format!("Rate limit exceeded for {}. Please try again later.", class),
                retry_after: Some(retry_after_secs),
                remaining: Some(remaining),
            },
            ServiceError::Timeout => AppError::ServiceUnavailable,
            ServiceError::Database(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
