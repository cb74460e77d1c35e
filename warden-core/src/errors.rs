//! Warden error types
//!
//! One taxonomy for every core operation. Single-item operations surface these
//! directly; bulk operations fold per-pair failures into a report and only
//! raise `BulkAborted` when running atomically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::GrantKey;

/// Error category for structured logging and wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown identity, access point, zone or template
    NotFound,
    /// Optimistic version mismatch
    Conflict,
    /// Request rejected before touching any state
    Validation,
    /// Emergency transition not allowed from the current phase
    InvalidState,
    /// Bulk operation with mixed per-pair outcomes
    PartialFailure,
    /// Ledger or audit backend cannot commit
    Unavailable,
    /// Door controller did not acknowledge in time
    CommandTimeout,
    /// Unexpected logic bug
    Internal,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Validation => "VALIDATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::Unavailable => "UNAVAILABLE",
            Self::CommandTimeout => "COMMAND_TIMEOUT",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same request later can succeed without changes.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::CommandTimeout)
    }
}

/// A failure attributed to one (identity, access point) pair of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailure {
    pub key: GrantKey,
    pub category: ErrorCategory,
    pub message: String,
}

impl PairFailure {
    pub fn new(key: GrantKey, err: &WardenError) -> Self {
        Self {
            key,
            category: err.category(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: GrantKey,
        expected: u64,
        actual: u64,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("invalid emergency state: {message}")]
    InvalidState { message: String },

    #[error("bulk operation partially failed: {failed} of {total} pairs")]
    PartialFailure { failed: usize, total: usize },

    #[error("bulk operation aborted, nothing committed ({} failing pairs)", failures.len())]
    BulkAborted { failures: Vec<PairFailure> },

    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("door {access_point_id} did not acknowledge {command} within {timeout_ms}ms")]
    CommandTimeout {
        access_point_id: String,
        command: String,
        timeout_ms: u64,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl WardenError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::InvalidState { .. } => ErrorCategory::InvalidState,
            Self::PartialFailure { .. } | Self::BulkAborted { .. } => {
                ErrorCategory::PartialFailure
            }
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::CommandTimeout { .. } => ErrorCategory::CommandTimeout,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessPointId, IdentityId};
    use pretty_assertions::assert_eq;

    #[test]
    fn categories_map_from_variants() {
        let key = GrantKey::new(IdentityId::from("u1"), AccessPointId::from("d1"));
        let conflict = WardenError::Conflict {
            key: key.clone(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(conflict.category(), ErrorCategory::Conflict);
        assert_eq!(conflict.category().as_str(), "CONFLICT");
        assert!(conflict.to_string().contains("u1/d1"));

        let aborted = WardenError::BulkAborted {
            failures: vec![PairFailure::new(key, &conflict)],
        };
        assert_eq!(aborted.category(), ErrorCategory::PartialFailure);
        assert!(!aborted.category().retryable());
        assert!(WardenError::unavailable("db down").category().retryable());
    }
}
