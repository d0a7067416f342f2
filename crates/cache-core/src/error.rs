use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{GroupId, MutationState};

/// Broad error category used for caller handling and rollback decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CacheErrorCategory {
    /// Transport or server failure reported by the remote API.
    Remote,
    /// Target entity is absent (locally, or server-side for `update_group`).
    NotFound,
    /// A pagination request for the same group is already outstanding.
    Busy,
    /// Response payload was missing required fields or carried invalid values.
    Malformed,
    /// Cache bug or invalid mutation transition.
    Internal,
}

/// Stable cache error payload surfaced to callers and settle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct CacheError {
    /// High-level error category.
    pub category: CacheErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl CacheError {
    /// Construct a new cache error.
    pub fn new(
        category: CacheErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport/server failure.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CacheErrorCategory::Remote, code, message)
    }

    /// Missing entity, identified by kind and id for logs.
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::new(
            CacheErrorCategory::NotFound,
            format!("{entity}_not_found"),
            format!("{entity} {id} not found"),
        )
    }

    /// Concurrent pagination rejected for `group_id`.
    pub fn busy(group_id: GroupId) -> Self {
        Self::new(
            CacheErrorCategory::Busy,
            "pagination_in_flight",
            format!("a page request for group {group_id} is already outstanding"),
        )
    }

    /// Response payload missing `field` (or carrying an unusable value).
    pub fn malformed(field: &str, detail: impl Into<String>) -> Self {
        Self::new(
            CacheErrorCategory::Malformed,
            "malformed_response",
            format!("{field}: {}", detail.into()),
        )
    }

    /// Build a standard invalid-mutation-transition error.
    pub fn invalid_transition(current: Option<MutationState>, action: impl Into<String>) -> Self {
        let action = action.into();
        let current = match current {
            Some(state) => format!("{state:?}"),
            None => "Unknown".to_owned(),
        };
        Self::new(
            CacheErrorCategory::Internal,
            "invalid_mutation_transition",
            format!("cannot run '{action}' while mutation is in state {current}"),
        )
    }

    /// Whether the failure came from the remote boundary.
    ///
    /// `Malformed` responses are handled exactly like transport failures.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self.category,
            CacheErrorCategory::Remote | CacheErrorCategory::Malformed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_counts_as_remote_failure() {
        assert!(CacheError::malformed("id", "missing").is_remote_failure());
        assert!(CacheError::remote("timeout", "no response").is_remote_failure());
        assert!(!CacheError::busy(GroupId(7)).is_remote_failure());
        assert!(!CacheError::not_found("group", GroupId(7)).is_remote_failure());
    }

    #[test]
    fn keeps_error_codes_stable() {
        assert_eq!(CacheError::busy(GroupId(7)).code, "pagination_in_flight");
        assert_eq!(CacheError::not_found("group", GroupId(7)).code, "group_not_found");
        assert_eq!(
            CacheError::malformed("insertedAt", "missing").code,
            "malformed_response"
        );

        let err = CacheError::invalid_transition(Some(MutationState::Committed), "settle");
        assert_eq!(err.code, "invalid_mutation_transition");
        assert_eq!(err.category, CacheErrorCategory::Internal);
        assert!(err.message.contains("Committed"));
    }

    #[test]
    fn display_includes_category_and_code() {
        let err = CacheError::not_found("group", GroupId(12));
        assert_eq!(err.to_string(), "NotFound:group_not_found: group 12 not found");
    }
}
