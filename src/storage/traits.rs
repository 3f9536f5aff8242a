// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;

use crate::dialect::Statement;
use crate::error::DbError;
use crate::value::{QueryResult, SqlValue};

/// A store that accepts canonical-dialect statements.
///
/// Both the primary (PostgreSQL) and the fallback (SQLite) implement this,
/// so the manager can route a statement to either without knowing which.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human readable backend name, reported by status endpoints.
    fn name(&self) -> &'static str;

    async fn query(&self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError>;

    /// Trivial round trip used by connectivity probes.
    async fn ping(&self) -> Result<(), DbError>;

    /// Check out a dedicated connection. Released when dropped.
    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, DbError>;

    /// Move the table's identity sequence past rows inserted with explicit ids.
    /// Default implementation does nothing (no sequences to maintain).
    async fn realign_identity(&self, _table: &str) -> Result<(), DbError> {
        Ok(())
    }

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A single checked-out connection.
///
/// Dropping a connection while a transaction is open closes it instead of
/// returning it to the pool, so the server discards the transaction.
#[async_trait]
pub trait BackendConnection: Send {
    async fn query(&mut self, stmt: &Statement, params: &[SqlValue]) -> Result<QueryResult, DbError>;

    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;
}
