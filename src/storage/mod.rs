// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`postgres::PgStore`]: the primary store of record
//! - [`sqlite::FallbackStore`]: the local store used while the primary is down

pub mod traits;
pub mod postgres;
pub mod sqlite;

pub use traits::{Backend, BackendConnection};

/// Identifiers are interpolated into generated SQL, so only plain names pass.
pub(crate) fn checked_identifier(name: &str) -> Result<&str, crate::error::DbError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(crate::error::DbError::Translation(format!("invalid identifier '{name}'")))
    }
}
