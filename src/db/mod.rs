//! Database collaborators
//!
//! The worker drives the database through these traits. A driver supplies
//! transactions, out-of-band execution for non-transactional migrations and
//! the bookkeeping table operations.

#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;

pub use postgres::PostgresDatabase;

use crate::error::DbError;
use crate::version::{Version, VersionId};
use async_trait::async_trait;
use postgres_types::ToSql;

/// A database that migrations can be applied to
#[async_trait]
pub trait Database: Send + Sync {
    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    /// Execute a single statement outside of any transaction.
    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, DbError>;

    /// Execute one or more statements outside of any transaction.
    async fn batch_execute(&self, sql: &str) -> Result<(), DbError>;

    /// Create the bookkeeping table if it does not already exist.
    async fn create_migrations_table(&self, table: &str) -> Result<(), DbError>;

    /// Reports whether DDL statements can be rolled back. When false every
    /// SQL migration runs out of band.
    fn supports_transactional_ddl(&self) -> bool;
}

/// An open transaction. Dropping it without calling `commit` or `rollback`
/// abandons the work.
#[async_trait]
pub trait Transaction: Send {
    async fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, DbError>;

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    async fn insert_version(&mut self, table: &str, version: &Version) -> Result<(), DbError>;

    async fn delete_version(&mut self, table: &str, id: VersionId) -> Result<(), DbError>;

    async fn set_version_failed(
        &mut self,
        table: &str,
        id: VersionId,
        failed: bool,
    ) -> Result<(), DbError>;

    async fn set_version_locked(
        &mut self,
        table: &str,
        id: VersionId,
        locked: bool,
    ) -> Result<(), DbError>;

    /// Every row of the bookkeeping table in ascending id order.
    async fn list_versions(&mut self, table: &str) -> Result<Vec<Version>, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
