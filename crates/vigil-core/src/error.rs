//! The common error taxonomy for the Vigil platform.

use thiserror::Error;

/// Top-level error type shared across Vigil components.
///
/// The variants partition failures by how callers should react:
/// `Validation` is never retried, `Infrastructure` is retried with backoff
/// and surfaced as `Unavailable` once exhausted, `Scan` follows the
/// scheduler's retry policy, and `Conflict` marks idempotent duplicates.
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Operation {op} not allowed in state {state}")]
    WrongState { op: &'static str, state: String },
}

/// Classification used by the retry helper: transient failures may succeed
/// on a later attempt, everything else fails fast.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for VigilError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            VigilError::Infrastructure(_) | VigilError::Scan(_) | VigilError::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(VigilError::Infrastructure("disk gone".into()).is_transient());
        assert!(VigilError::Scan("timeout".into()).is_transient());
        assert!(!VigilError::Validation("bad range".into()).is_transient());
        assert!(!VigilError::NotFound {
            kind: "snapshot",
            id: "abc".into()
        }
        .is_transient());
        assert!(!VigilError::Conflict("duplicate diff".into()).is_transient());
    }
}
