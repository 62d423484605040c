//! SchemaFlow Migrate - versioned, reversible schema migrations
//!
//! Migrations are defined in code as a [`Schema`] of numbered versions, each
//! with an up migration and an optional down migration. When the up migration
//! is plain DDL the down migration is usually derived automatically:
//! - `create table`, `create domain`, ...: drop the objects in reverse order
//! - `create view`, `create function`, ...: restore the previous definition
//!
//! A [`Worker`] applies the schema to a database. It records applied versions
//! in a bookkeeping table, runs migrations in transactions where it can, and
//! supports locking versions against accidental down migrations.

pub mod config;
pub mod db;
pub mod ddl;
pub mod error;
pub mod schema;
pub mod version;
pub mod worker;

pub use db::{Database, PostgresDatabase, Transaction};
pub use error::{BoxError, DbError, MigrationError, MigrationResult, SchemaError, SchemaErrors};
pub use schema::{BoxFuture, Definition, Schema, DEFAULT_MIGRATIONS_TABLE};
pub use version::{Version, VersionId};
pub use worker::Worker;

pub use tokio_util::sync::CancellationToken;
