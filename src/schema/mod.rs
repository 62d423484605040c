//! Migration schema
//!
//! The [`Schema`] is built by the caller, one [`Definition`] per version, and
//! handed to the worker. It is compiled into an ordered list of plans.

mod definition;
mod plan;

pub use definition::{BoxFuture, DbFn, Definition, Executor, TxFn};
pub use plan::MigrationPlan;

use crate::error::{SchemaError, SchemaErrors};
use crate::version::VersionId;

/// Default name of the bookkeeping table that records applied versions.
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// All of the versions of a database schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    definitions: Vec<Definition>,
    migrations_table: Option<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a new schema version. Defining the same id twice is reported
    /// by [`Schema::check`].
    pub fn define(&mut self, id: VersionId) -> &mut Definition {
        self.definitions.push(Definition::new(id));
        let last = self.definitions.len() - 1;
        &mut self.definitions[last]
    }

    /// Use `table` instead of [`DEFAULT_MIGRATIONS_TABLE`]. The name may be
    /// schema qualified.
    pub fn set_migrations_table(&mut self, table: impl Into<String>) -> &mut Self {
        self.migrations_table = Some(table.into()).filter(|t| !t.is_empty());
        self
    }

    pub fn migrations_table(&self) -> &str {
        self.migrations_table
            .as_deref()
            .unwrap_or(DEFAULT_MIGRATIONS_TABLE)
    }

    /// Report every problem with the schema at once.
    pub fn check(&self) -> Result<(), SchemaErrors> {
        let (_, errs) = self.compile();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(errs)
        }
    }

    /// Compile the definitions into plans in ascending version order, along
    /// with all validation errors.
    pub(crate) fn compile(&self) -> (Vec<MigrationPlan>, SchemaErrors) {
        let mut errs = SchemaErrors::default();
        let mut defs: Vec<&Definition> = Vec::with_capacity(self.definitions.len());

        for def in &self.definitions {
            if def.id() <= 0 {
                errs.push(SchemaError::new(def.id(), "version id must be positive"));
                continue;
            }
            if defs.iter().any(|d| d.id() == def.id()) {
                errs.push(SchemaError::new(def.id(), "defined more than once"));
                continue;
            }
            defs.push(def);
        }
        defs.sort_by_key(|d| d.id());

        let mut plans: Vec<MigrationPlan> = Vec::with_capacity(defs.len());
        for def in defs {
            let plan = MigrationPlan::new(def, &plans);
            errs.extend(plan.errors.iter().cloned());
            plans.push(plan);
        }

        (plans, errs)
    }
}
