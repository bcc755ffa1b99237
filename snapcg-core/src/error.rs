//! Error types for snapshot reconciliation
//!
//! Provides a unified error type for every reconciliation run.

use thiserror::Error;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// Unified error type for the reconciler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapError {
    // ===== Input Errors =====
    #[error("Validation error: {0}")]
    Validation(String),

    // ===== Inventory Errors =====
    #[error("Lookup failed for endpoint [{endpoint}]: {message}")]
    LookupFailure { endpoint: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    // ===== Capacity Errors =====
    #[error("Insufficient free space for reserve capacity volumes in storage pools {pools:?}")]
    CapacityInsufficient { pools: Vec<String> },

    #[error("No reserve capacity candidate for volume [{volume}] in storage pool [{pool}]")]
    NoCandidate { volume: String, pool: String },

    #[error("Reserve capacity cannot be trimmed while snapshot images exist for base volume [{volume}]")]
    TrimBlockedByImages { volume: String },

    #[error("Cannot delete initial reserve capacity volume of [{volume}]; minimum reserve capacity is {minimum_pct}%")]
    HeadMemberProtected { volume: String, minimum_pct: u32 },

    // ===== Resolution Errors =====
    #[error("Ambiguous resolution: {0}")]
    AmbiguousResolution(String),

    // ===== Apply Errors =====
    #[error("Mutation [{step}] failed after {} completed step(s): {message}", completed.len())]
    MutationFailure {
        step: String,
        completed: Vec<String>,
        message: String,
    },
}

impl SnapError {
    /// Build a lookup failure from an endpoint and any displayable error
    pub fn lookup(endpoint: impl Into<String>, error: impl std::fmt::Display) -> Self {
        SnapError::LookupFailure {
            endpoint: endpoint.into(),
            message: error.to_string(),
        }
    }

    /// Whether the error was raised before any mutation was issued
    pub fn is_pre_mutation(&self) -> bool {
        !matches!(self, SnapError::MutationFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SnapError::HeadMemberProtected {
            volume: "vol1".to_string(),
            minimum_pct: 20,
        };
        assert_eq!(
            err.to_string(),
            "Cannot delete initial reserve capacity volume of [vol1]; minimum reserve capacity is 20%"
        );
    }

    #[test]
    fn test_mutation_failure_counts_steps() {
        let err = SnapError::MutationFailure {
            step: "trim".to_string(),
            completed: vec!["update settings".to_string(), "remove vol2".to_string()],
            message: "HTTP 422".to_string(),
        };
        assert!(err.to_string().contains("after 2 completed step(s)"));
        assert!(!err.is_pre_mutation());
        assert!(SnapError::Validation("x".into()).is_pre_mutation());
    }

    #[test]
    fn test_lookup_helper() {
        let err = SnapError::lookup("storage-pools", "connection refused");
        assert!(matches!(
            err,
            SnapError::LookupFailure { ref endpoint, ref message }
                if endpoint == "storage-pools" && message == "connection refused"
        ));
    }
}
