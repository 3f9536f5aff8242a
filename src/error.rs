// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("primary store error: {0}")]
    Primary(#[source] sqlx::Error),
    #[error("fallback store error: {0}")]
    Fallback(#[source] sqlx::Error),
    #[error("cannot translate query: {0}")]
    Translation(String),
    #[error("primary store probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported column type {type_name} for column '{column}'")]
    UnsupportedType { column: String, type_name: String },
    #[error("invalid value for column '{column}': {reason}")]
    InvalidValue { column: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// True when the error means the store could not be reached at all,
    /// as opposed to a query the store rejected.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Primary(e) | Self::Fallback(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unreachable_stores_count_as_connectivity() {
        assert!(DbError::Timeout(Duration::from_secs(5)).is_connectivity());
        assert!(DbError::Primary(sqlx::Error::PoolTimedOut).is_connectivity());
        assert!(DbError::Fallback(sqlx::Error::PoolClosed).is_connectivity());

        assert!(!DbError::Primary(sqlx::Error::RowNotFound).is_connectivity());
        assert!(!DbError::Translation("empty statement".into()).is_connectivity());
        assert!(!DbError::Config("missing primary_url".into()).is_connectivity());
        assert!(!DbError::Backend("closed".into()).is_connectivity());
    }
}
