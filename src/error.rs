//! Error handling module
//!
//! Two classes of errors: schema validation errors, which are collected while
//! the migration schema is compiled and reported together, and execution
//! errors, which abort the operation in flight.

use crate::version::VersionId;
use std::fmt;
use thiserror::Error;

/// Error type returned by migration functions supplied by the caller.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a database driver
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Message(String),
}

/// A single problem found in a migration schema definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{version}: {description}")]
pub struct SchemaError {
    pub version: VersionId,
    pub description: String,
}

impl SchemaError {
    pub fn new(version: VersionId, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
        }
    }
}

/// All of the problems found in a migration schema definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaErrors(pub Vec<SchemaError>);

impl SchemaErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaError> {
        self.0.iter()
    }

    pub(crate) fn push(&mut self, err: SchemaError) {
        self.0.push(err);
    }

    pub(crate) fn extend(&mut self, errs: impl IntoIterator<Item = SchemaError>) {
        self.0.extend(errs);
    }
}

impl fmt::Display for SchemaErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(lines.join("\n").trim())
    }
}

impl std::error::Error for SchemaErrors {}

/// Errors raised while performing migrations
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("{0}")]
    Schema(#[from] SchemaErrors),

    #[error("invalid schema version id={0}")]
    InvalidVersion(VersionId),

    #[error("{0}: previously failed")]
    PreviouslyFailed(VersionId),

    #[error("database schema version locked id={0}")]
    Locked(VersionId),

    #[error("cannot {verb} unapplied version id={id}")]
    Unapplied { verb: &'static str, id: VersionId },

    #[error("missing plan for version {0}")]
    MissingPlan(VersionId),

    #[error("{0}: no up migration defined")]
    NoUpMigration(VersionId),

    #[error("{0}: no down migration defined")]
    NoDownMigration(VersionId),

    #[error("cannot begin tx: {0}")]
    Begin(#[source] DbError),

    #[error("cannot commit tx: {0}")]
    Commit(#[source] DbError),

    #[error("{id}: {source}")]
    Migrate {
        id: VersionId,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("migration cancelled")]
    Cancelled,
}

impl MigrationError {
    /// Wrap a failure of the migration for version `id`.
    pub fn migrate(id: VersionId, source: impl Into<BoxError>) -> Self {
        MigrationError::Migrate {
            id,
            source: source.into(),
        }
    }
}

/// Result type alias for worker operations
pub type MigrationResult<T> = Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_errors_display_one_per_line() {
        let errs = SchemaErrors(vec![
            SchemaError::new(1, "defined more than once"),
            SchemaError::new(3, "alter table t1 needs a manual down migration"),
        ]);

        assert_eq!(
            errs.to_string(),
            "1: defined more than once\n3: alter table t1 needs a manual down migration"
        );
    }

    #[test]
    fn test_migrate_error_names_version() {
        let err = MigrationError::migrate(20, DbError::Message("relation t2 exists".to_string()));
        assert_eq!(err.to_string(), "20: relation t2 exists");
    }
}
