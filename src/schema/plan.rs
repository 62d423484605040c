//! Migration plans
//!
//! A plan is the finalized form of a definition: its up executor, its down
//! executor (explicit or derived from the DDL actions of the up SQL), and any
//! validation errors found on the way.

use super::definition::{Definition, Executor};
use crate::ddl::{DdlAction, DdlActions, DdlVerb, ObjectType};
use crate::error::SchemaError;
use crate::version::VersionId;

/// Everything needed to migrate to a version from the previous one, and back.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub id: VersionId,
    pub description: Option<String>,
    pub up: Option<Executor>,
    pub down: Option<Executor>,
    pub actions: DdlActions,
    pub errors: Vec<SchemaError>,
}

impl MigrationPlan {
    /// Build the plan for `def`. `prior` holds the plans of every lower
    /// version in ascending order and is only used to look back for the
    /// previous definition of a restorable object.
    pub fn new(def: &Definition, prior: &[MigrationPlan]) -> Self {
        let actions = def.up_sql().map(DdlActions::parse).unwrap_or_default();
        let mut plan = Self {
            id: def.id(),
            description: def.explicit_description().map(str::to_string),
            up: def.up_executor(),
            down: def.down_executor(),
            actions,
            errors: def.errors(),
        };

        if plan.description.is_none() && !plan.actions.is_empty() {
            let parts: Vec<String> = plan.actions.iter().map(ToString::to_string).collect();
            plan.description = Some(parts.join(", "));
        }

        let explicit_down = plan.down.is_some();
        if let Some(sql) = plan.derive_down(explicit_down, prior) {
            plan.down = Some(Executor::Sql(sql));
        }

        if plan.down.is_none() {
            plan.error("must call one of [down, down_db, down_tx]");
        }

        plan
    }

    pub fn up_sql(&self) -> Option<&str> {
        self.up.as_ref().and_then(Executor::as_sql)
    }

    pub fn up_description(&self) -> String {
        self.up.as_ref().map(Executor::describe).unwrap_or_default()
    }

    pub fn down_description(&self) -> String {
        self.down.as_ref().map(Executor::describe).unwrap_or_default()
    }

    fn error(&mut self, description: impl Into<String>) {
        self.errors.push(SchemaError::new(self.id, description));
    }

    /// Derive the down SQL from the actions of the up SQL. Returns `None`
    /// when no SQL can or should be derived.
    fn derive_down(&mut self, explicit_down: bool, prior: &[MigrationPlan]) -> Option<String> {
        let mut restorable = 0;
        let mut droppable = 0;
        for act in self.actions.iter() {
            if act.object_type.should_restore() && act.verb != DdlVerb::Alter {
                restorable += 1;
            } else {
                droppable += 1;
            }
        }

        // A restorable object has to be alone in its migration so that its
        // previous definition is exactly the previous up SQL.
        if restorable > 1 || (restorable > 0 && droppable > 0) {
            let errs: Vec<String> = self
                .actions
                .iter()
                .filter(|act| act.object_type.should_restore() && act.verb != DdlVerb::Alter)
                .map(|act| format!("{} must be in its own migration", act))
                .collect();
            for err in errs {
                self.error(err);
            }
            return None;
        }

        if explicit_down || self.actions.is_empty() {
            return None;
        }

        let irreversible: Vec<String> = self
            .actions
            .iter()
            .filter(|act| !is_reversible(act))
            .map(|act| format!("{} needs a manual down migration", act))
            .collect();
        if !irreversible.is_empty() {
            for err in irreversible {
                self.error(err);
            }
            return None;
        }

        if restorable == 1 {
            let act = self.actions.iter().next()?.clone();
            return self.restore(&act, prior);
        }

        let mut sql = String::new();
        let actions: Vec<DdlAction> = self.actions.iter().rev().cloned().collect();
        for act in &actions {
            sql.push_str(&self.drop_sql(act));
        }
        Some(sql)
    }

    /// Down SQL for a single restorable action: put back the most recent
    /// previous definition of the object.
    fn restore(&mut self, act: &DdlAction, prior: &[MigrationPlan]) -> Option<String> {
        let previous = prior.iter().rev().find_map(|plan| {
            let found = plan.actions.find(
                DdlVerb::Create,
                act.object_type,
                act.schema.as_deref(),
                &act.name,
            )?;
            Some((found.drop_before, plan.up_sql()?.to_string()))
        });

        match (act.verb, previous) {
            (DdlVerb::Create, Some((drop_before, up_sql))) => {
                let mut sql = String::new();
                if !drop_before {
                    sql.push_str(&act.drop_sql());
                }
                sql.push_str(&up_sql);
                Some(sql)
            }
            (DdlVerb::Create, None) => Some(self.drop_sql(act)),
            (_, Some((_, up_sql))) => Some(up_sql),
            (_, None) => {
                self.error(format!("{} needs a manual down migration", act));
                None
            }
        }
    }

    /// Best-effort drop statement. The drop target of an index or a trigger
    /// cannot be reliably recovered from the create statement, so the
    /// statement is offered but a manual down migration is still required.
    fn drop_sql(&mut self, act: &DdlAction) -> String {
        if matches!(act.object_type, ObjectType::Index | ObjectType::Trigger) {
            self.error(format!("{} needs a manual down migration", act));
        }
        act.drop_sql()
    }
}

/// Only creates, and drops of restorable objects, can be reversed without
/// help.
fn is_reversible(act: &DdlAction) -> bool {
    match act.verb {
        DdlVerb::Create => true,
        DdlVerb::Drop => act.object_type.should_restore(),
        DdlVerb::Alter => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile(defs: &[(VersionId, &str)]) -> Vec<MigrationPlan> {
        let mut plans: Vec<MigrationPlan> = Vec::new();
        for (id, up) in defs {
            let mut def = Definition::new(*id);
            def.up(*up);
            let plan = MigrationPlan::new(&def, &plans);
            plans.push(plan);
        }
        plans
    }

    fn downs(plans: &[MigrationPlan]) -> Vec<String> {
        plans.iter().map(MigrationPlan::down_description).collect()
    }

    fn errors(plans: &[MigrationPlan]) -> Vec<String> {
        plans
            .iter()
            .flat_map(|plan| plan.errors.iter().map(ToString::to_string))
            .collect()
    }

    #[test]
    fn test_derive_drop_table() {
        let plans = compile(&[(1, "create table t1(id int);")]);
        assert_eq!(errors(&plans), Vec::<String>::new());
        assert_eq!(downs(&plans), vec!["drop table t1;\n"]);
        assert_eq!(plans[0].description.as_deref(), Some("create table t1"));
    }

    #[test]
    fn test_derive_ignores_absorbed_statements() {
        let plans = compile(&[(1, "create table t1;create index on t1;alter table t1;")]);
        assert_eq!(errors(&plans), Vec::<String>::new());
        assert_eq!(downs(&plans), vec!["drop table t1;\n"]);
    }

    #[test]
    fn test_derive_restores_previous_view() {
        let plans = compile(&[
            (1, "create view v1 as select * from t1;"),
            (2, "drop view v1; create view v1 as select * from t2;"),
        ]);
        assert_eq!(errors(&plans), Vec::<String>::new());
        assert_eq!(
            downs(&plans),
            vec![
                "drop view v1;\n",
                "drop view v1;\ncreate view v1 as select * from t1;",
            ]
        );
    }

    #[test]
    fn test_derive_restore_skips_drop_when_previous_replaced_itself() {
        let plans = compile(&[
            (1, "drop view if exists v1; create view v1 as select 1;"),
            (2, "create view v1 as select 2;"),
        ]);
        assert_eq!(
            downs(&plans)[1],
            "drop view if exists v1; create view v1 as select 1;"
        );
    }

    #[test]
    fn test_derive_restores_dropped_function() {
        let plans = compile(&[
            (1, "create function f1() returns int as $$ select 1; $$ language sql;"),
            (2, "drop function f1;"),
        ]);
        assert_eq!(errors(&plans), Vec::<String>::new());
        assert_eq!(
            downs(&plans)[1],
            "create function f1() returns int as $$ select 1; $$ language sql;"
        );
    }

    #[test]
    fn test_derive_drop_of_unknown_restorable_needs_manual_down() {
        let plans = compile(&[(1, "drop view v1;")]);
        assert_eq!(
            errors(&plans),
            vec![
                "1: drop view v1 needs a manual down migration",
                "1: must call one of [down, down_db, down_tx]",
            ]
        );
    }

    #[test]
    fn test_derive_drops_in_reverse_order() {
        let plans = compile(&[(1, "create domain d1; create table t1;")]);
        assert_eq!(errors(&plans), Vec::<String>::new());
        assert_eq!(downs(&plans), vec!["drop table t1;\ndrop domain d1;\n"]);
    }

    #[test]
    fn test_restorable_must_be_alone() {
        let plans = compile(&[(1, "create table t1(id int); create view v1 as select * from t1;")]);
        assert_eq!(
            errors(&plans),
            vec![
                "1: create view v1 must be in its own migration",
                "1: must call one of [down, down_db, down_tx]",
            ]
        );
        assert!(plans[0].down.is_none());
    }

    #[test]
    fn test_restorable_must_be_alone_even_with_explicit_down() {
        let mut def = Definition::new(1);
        def.up("create table t1(id int);create view v1 as select * from t1;")
            .down("drop view v1; drop table t1;");
        let plan = MigrationPlan::new(&def, &[]);
        assert_eq!(
            errors(&[plan]),
            vec!["1: create view v1 must be in its own migration"]
        );
    }

    #[test]
    fn test_manual_down_required() {
        let plans = compile(&[(1, "create table t1(id int);drop table t2;")]);
        assert_eq!(
            errors(&plans),
            vec![
                "1: drop table t2 needs a manual down migration",
                "1: must call one of [down, down_db, down_tx]",
            ]
        );

        let plans = compile(&[(1, "create table t1(id int);"), (3, "alter table t1;")]);
        assert_eq!(
            errors(&plans),
            vec![
                "3: alter table t1 needs a manual down migration",
                "3: must call one of [down, down_db, down_tx]",
            ]
        );
    }

    #[test]
    fn test_index_and_trigger_drop_is_offered_with_error() {
        let plans = compile(&[
            (2, "create index i1 on t1(id);"),
            (3, "create index on t2(id);"),
            (4, "create trigger tr1 after insert on t1 execute function f1();"),
        ]);
        assert_eq!(
            errors(&plans),
            vec![
                "2: create index i1 on t1 needs a manual down migration",
                "3: create index on t2 needs a manual down migration",
                "4: create trigger tr1 needs a manual down migration",
            ]
        );
        assert_eq!(
            downs(&plans),
            vec!["drop index i1;\n", "drop index on t2;\n", "drop trigger tr1;\n"]
        );
    }

    #[test]
    fn test_opaque_sql_requires_down() {
        let plans = compile(&[(1, "create table t1(id int);"), (2, "unknown DDL command")]);
        assert_eq!(
            errors(&plans),
            vec!["2: must call one of [down, down_db, down_tx]"]
        );
        assert!(plans[1].description.is_none());
    }

    #[test]
    fn test_explicit_description_wins() {
        let mut def = Definition::new(5);
        def.up("create table t1(id int);").description("cities");
        let plan = MigrationPlan::new(&def, &[]);
        assert_eq!(plan.description.as_deref(), Some("cities"));
    }
}
