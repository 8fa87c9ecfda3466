use thiserror::Error;

/// Errors surfaced by the memory engine.
///
/// Each variant corresponds to one wire-visible error kind; callers match on
/// the variant, hosts log the message.
#[derive(Debug, Error)]
pub enum EngramError {
    /// Caller input violates a documented constraint (empty text, too long,
    /// too many tags, query too long).
    #[error("validation error: {0}")]
    Validation(String),

    /// The durable layer failed, including rate-limit rejection.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding model not available, load timed out, or vector dimension
    /// mismatch.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Invalid filter combination or index unavailable.
    #[error("search error: {0}")]
    Search(String),

    /// A recall deadline fired; partial work was discarded.
    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout {
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// Config file malformed or a required option missing.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<rusqlite::Error> for EngramError {
    fn from(err: rusqlite::Error) -> Self {
        EngramError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for EngramError {
    fn from(err: std::io::Error) -> Self {
        EngramError::Storage(err.to_string())
    }
}

/// Convenience result type used throughout the crate.
pub type Result<T, E = EngramError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_kind() {
        let err = EngramError::Validation("Memory text cannot be empty".to_string());
        assert_eq!(
            err.to_string(),
            "validation error: Memory text cannot be empty"
        );

        let err = EngramError::QueryTimeout { timeout_ms: 250 };
        assert_eq!(err.to_string(), "query timed out after 250ms");
    }

    #[test]
    fn sqlite_errors_become_storage_errors() {
        let sqlite_err = rusqlite::Error::InvalidQuery;
        let err: EngramError = sqlite_err.into();
        assert!(matches!(err, EngramError::Storage(_)));
    }
}
