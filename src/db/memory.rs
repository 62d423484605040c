//! In-memory driver for unit tests
//!
//! Transactions work on a snapshot of the state and publish it on commit.
//! Executed SQL is recorded so tests can assert on what ran.

use super::{Database, Transaction};
use crate::error::DbError;
use crate::version::{Version, VersionId};
use async_trait::async_trait;
use postgres_types::ToSql;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub(crate) struct State {
    pub tables_created: usize,
    pub versions: BTreeMap<VersionId, Version>,
    pub executed: Vec<String>,
}

#[derive(Clone)]
pub(crate) struct MemoryDatabase {
    state: Arc<Mutex<State>>,
    transactional_ddl: bool,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            transactional_ddl: true,
            fail_on: Arc::default(),
        }
    }

    /// A database that cannot roll back DDL.
    pub fn non_transactional() -> Self {
        Self {
            transactional_ddl: false,
            ..Self::new()
        }
    }

    /// Fail any SQL that contains `pattern`.
    pub fn fail_on(&self, pattern: Option<&str>) {
        *self.fail_on.lock().unwrap() = pattern.map(str::to_string);
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    pub fn version(&self, id: VersionId) -> Option<Version> {
        self.state.lock().unwrap().versions.get(&id).cloned()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state().executed
    }

    fn run(&self, state: &mut State, sql: &str) -> Result<(), DbError> {
        if let Some(pattern) = self.fail_on.lock().unwrap().as_deref() {
            if sql.contains(pattern) {
                return Err(DbError::Message(format!("simulated failure: {}", sql)));
            }
        }
        state.executed.push(sql.to_string());
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        Ok(Box::new(MemoryTransaction {
            db: self.clone(),
            state: self.state(),
        }))
    }

    async fn execute(&self, sql: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<u64, DbError> {
        let mut state = self.state.lock().unwrap();
        self.run(&mut state, sql)?;
        Ok(0)
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        self.run(&mut state, sql)
    }

    async fn create_migrations_table(&self, _table: &str) -> Result<(), DbError> {
        self.state.lock().unwrap().tables_created += 1;
        Ok(())
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }
}

struct MemoryTransaction {
    db: MemoryDatabase,
    state: State,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DbError> {
        self.db.run(&mut self.state, sql)?;
        Ok(0)
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.db.run(&mut self.state, sql)
    }

    async fn insert_version(&mut self, _table: &str, version: &Version) -> Result<(), DbError> {
        if self.state.versions.contains_key(&version.id) {
            return Err(DbError::Message(format!(
                "duplicate key value violates unique constraint id={}",
                version.id
            )));
        }
        self.state.versions.insert(version.id, version.clone());
        Ok(())
    }

    async fn delete_version(&mut self, _table: &str, id: VersionId) -> Result<(), DbError> {
        self.state.versions.remove(&id);
        Ok(())
    }

    async fn set_version_failed(
        &mut self,
        _table: &str,
        id: VersionId,
        failed: bool,
    ) -> Result<(), DbError> {
        if let Some(version) = self.state.versions.get_mut(&id) {
            version.failed = failed;
        }
        Ok(())
    }

    async fn set_version_locked(
        &mut self,
        _table: &str,
        id: VersionId,
        locked: bool,
    ) -> Result<(), DbError> {
        if let Some(version) = self.state.versions.get_mut(&id) {
            version.locked = locked;
        }
        Ok(())
    }

    async fn list_versions(&mut self, _table: &str) -> Result<Vec<Version>, DbError> {
        Ok(self.state.versions.values().cloned().collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let MemoryTransaction { db, state } = *self;
        *db.state.lock().unwrap() = state;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}
