//! Migration definitions
//!
//! A [`Definition`] describes one schema version: how to migrate up to it
//! from the previous version, and optionally how to migrate back down.

use crate::db::{Database, Transaction};
use crate::error::{BoxError, SchemaError};
use crate::version::VersionId;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A migration function run inside the worker's transaction. If it fails,
/// the transaction is rolled back and the version is left unchanged.
pub type TxFn = Arc<
    dyn for<'a> Fn(&'a mut dyn Transaction) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
>;

/// A migration function run directly against the database, outside of any
/// transaction. If it fails the version is marked failed and needs manual
/// repair followed by a force.
pub type DbFn =
    Arc<dyn for<'a> Fn(&'a dyn Database) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync>;

/// How a migration step is performed
#[derive(Clone)]
pub enum Executor {
    Sql(String),
    Tx(TxFn),
    Db(DbFn),
}

impl Executor {
    /// Human-readable form reported in [`crate::Version`].
    pub fn describe(&self) -> String {
        match self {
            Executor::Sql(sql) => sql.clone(),
            Executor::Tx(_) => "(tx fn)".to_string(),
            Executor::Db(_) => "(db fn)".to_string(),
        }
    }

    pub fn as_sql(&self) -> Option<&str> {
        match self {
            Executor::Sql(sql) => Some(sql),
            _ => None,
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Executor::Tx(_) => f.write_str("Tx(..)"),
            Executor::Db(_) => f.write_str("Db(..)"),
        }
    }
}

/// The executors assigned to one direction of a migration. Each setter
/// fills its own slot so that conflicting calls can be reported.
#[derive(Clone, Default)]
struct Slots {
    sql: Option<String>,
    db: Option<DbFn>,
    tx: Option<TxFn>,
}

impl Slots {
    fn methods(&self, prefix: &'static str) -> Vec<String> {
        let mut methods = Vec::new();
        if self.sql.is_some() {
            methods.push(prefix.to_string());
        }
        if self.db.is_some() {
            methods.push(format!("{}_db", prefix));
        }
        if self.tx.is_some() {
            methods.push(format!("{}_tx", prefix));
        }
        methods
    }

    fn executor(&self) -> Option<Executor> {
        if let Some(sql) = &self.sql {
            return Some(Executor::Sql(sql.clone()));
        }
        if let Some(db) = &self.db {
            return Some(Executor::Db(db.clone()));
        }
        self.tx.as_ref().map(|tx| Executor::Tx(tx.clone()))
    }
}

/// Defines a database schema version, the actions required to migrate up
/// from the previous version, and the actions required to migrate back down.
#[derive(Clone)]
pub struct Definition {
    id: VersionId,
    description: Option<String>,
    up: Slots,
    down: Slots,
}

impl Definition {
    pub(crate) fn new(id: VersionId) -> Self {
        Self {
            id,
            description: None,
            up: Slots::default(),
            down: Slots::default(),
        }
    }

    pub fn id(&self) -> VersionId {
        self.id
    }

    /// Override the description derived from the up SQL.
    pub fn description(&mut self, text: impl Into<String>) -> &mut Self {
        self.description = Some(text.into()).filter(|s| !s.is_empty());
        self
    }

    /// SQL to migrate up to this version.
    ///
    /// When the SQL consists only of recognised DDL statements the down
    /// migration can usually be derived:
    ///
    /// | up                           | derived down                              |
    /// |------------------------------|-------------------------------------------|
    /// | `create table/domain/...`    | drop, in reverse order                    |
    /// | `create view/function/...`   | restore the previous definition, or drop  |
    /// | `drop view/function/...`     | restore the previous definition           |
    pub fn up(&mut self, sql: impl Into<String>) -> &mut Self {
        self.up.sql = Some(sql.into()).filter(|s| !s.is_empty());
        self
    }

    /// Migrate up inside the worker's transaction.
    pub fn up_tx<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut dyn Transaction) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.up.tx = Some(Arc::new(f));
        self
    }

    /// Migrate up outside of any transaction. Prefer [`Definition::up_tx`].
    pub fn up_db<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a dyn Database) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.up.db = Some(Arc::new(f));
        self
    }

    /// SQL to migrate down to the previous version. Often optional, see
    /// [`Definition::up`].
    pub fn down(&mut self, sql: impl Into<String>) -> &mut Self {
        self.down.sql = Some(sql.into()).filter(|s| !s.is_empty());
        self
    }

    pub fn down_tx<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut dyn Transaction) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.down.tx = Some(Arc::new(f));
        self
    }

    pub fn down_db<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a dyn Database) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.down.db = Some(Arc::new(f));
        self
    }

    pub(crate) fn explicit_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub(crate) fn up_executor(&self) -> Option<Executor> {
        self.up.executor()
    }

    pub(crate) fn down_executor(&self) -> Option<Executor> {
        self.down.executor()
    }

    pub(crate) fn up_sql(&self) -> Option<&str> {
        self.up.sql.as_deref()
    }

    /// Problems with the executors assigned to this definition.
    pub(crate) fn errors(&self) -> Vec<SchemaError> {
        let mut errs = Vec::new();

        let up = self.up.methods("up");
        if up.is_empty() {
            errs.push(SchemaError::new(self.id, "must call one of [up, up_db, up_tx]"));
        } else if up.len() > 1 {
            errs.push(SchemaError::new(
                self.id,
                format!("call only one of [{}]", up.join(", ")),
            ));
        }

        let down = self.down.methods("down");
        if down.len() > 1 {
            errs.push(SchemaError::new(
                self.id,
                format!("call only one of [{}]", down.join(", ")),
            ));
        }

        errs
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("up", &self.up.methods("up"))
            .field("down", &self.down.methods("down"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn messages(def: &Definition) -> Vec<String> {
        def.errors().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_definition_requires_up() {
        let mut def = Definition::new(1);
        def.down("do something");
        assert_eq!(messages(&def), vec!["1: must call one of [up, up_db, up_tx]"]);
    }

    #[test]
    fn test_definition_rejects_multiple_up() {
        let mut def = Definition::new(1);
        def.down("do something")
            .up("do something")
            .up_db(|_db| Box::pin(async { Ok(()) }));
        assert_eq!(messages(&def), vec!["1: call only one of [up, up_db]"]);

        let mut def = Definition::new(1);
        def.up_tx(|_tx| Box::pin(async { Ok(()) }))
            .up_db(|_db| Box::pin(async { Ok(()) }));
        assert_eq!(messages(&def), vec!["1: call only one of [up_db, up_tx]"]);
    }

    #[test]
    fn test_definition_rejects_multiple_down() {
        let mut def = Definition::new(1);
        def.up("do something")
            .down_tx(|_tx| Box::pin(async { Ok(()) }))
            .down_db(|_db| Box::pin(async { Ok(()) }));
        assert_eq!(messages(&def), vec!["1: call only one of [down_db, down_tx]"]);
    }

    #[test]
    fn test_empty_sql_unsets() {
        let mut def = Definition::new(2);
        def.up("create table t1(id int);").up("");
        assert!(def.up_executor().is_none());
        assert_eq!(messages(&def), vec!["2: must call one of [up, up_db, up_tx]"]);
    }

    #[test]
    fn test_executor_describe() {
        let mut def = Definition::new(3);
        def.up("create table t1(id int);")
            .down_db(|_db| Box::pin(async { Ok(()) }));

        let up = def.up_executor().map(|e| e.describe());
        let down = def.down_executor().map(|e| e.describe());
        assert_eq!(up.as_deref(), Some("create table t1(id int);"));
        assert_eq!(down.as_deref(), Some("(db fn)"));
    }
}
