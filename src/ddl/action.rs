//! DDL action extraction
//!
//! Classifies each statement of an up migration as a create, alter or drop of
//! a database object. The result is only used to decide how a migration can be
//! reversed, so the grammar is deliberately narrow:
//!
//! ```text
//! <verb> [unique] <object-type> [concurrently] [if [not] exists] [<index-name>] [on] [only] [<schema> .] <name>
//! ```

use super::tokens::{statements, Lexemes, Statement};
use serde::Serialize;
use std::fmt;

/// The verb at the beginning of a DDL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DdlVerb {
    Alter,
    Create,
    Drop,
}

impl DdlVerb {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "alter" => Some(DdlVerb::Alter),
            "create" => Some(DdlVerb::Create),
            "drop" => Some(DdlVerb::Drop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DdlVerb::Alter => "alter",
            DdlVerb::Create => "create",
            DdlVerb::Drop => "drop",
        }
    }
}

impl fmt::Display for DdlVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported database object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Domain,
    Function,
    Index,
    Procedure,
    Sequence,
    Table,
    Trigger,
    Type,
    View,
}

impl ObjectType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(ObjectType::Domain),
            "function" => Some(ObjectType::Function),
            "index" => Some(ObjectType::Index),
            "procedure" => Some(ObjectType::Procedure),
            "sequence" => Some(ObjectType::Sequence),
            "table" => Some(ObjectType::Table),
            "trigger" => Some(ObjectType::Trigger),
            "type" => Some(ObjectType::Type),
            "view" => Some(ObjectType::View),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Domain => "domain",
            ObjectType::Function => "function",
            ObjectType::Index => "index",
            ObjectType::Procedure => "procedure",
            ObjectType::Sequence => "sequence",
            ObjectType::Table => "table",
            ObjectType::Trigger => "trigger",
            ObjectType::Type => "type",
            ObjectType::View => "view",
        }
    }

    /// Reports whether a derived down migration should restore the previous
    /// definition of the object rather than simply dropping it.
    pub fn should_restore(&self) -> bool {
        matches!(
            self,
            ObjectType::View | ObjectType::Trigger | ObjectType::Procedure | ObjectType::Function
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of the action performed by a single DDL statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DdlAction {
    pub verb: DdlVerb,
    pub object_type: ObjectType,
    pub schema: Option<String>,
    pub name: String,
    /// Index name, for `create index <name> on <table>`
    pub index: Option<String>,
    /// A drop of the same object immediately preceded this create
    pub drop_before: bool,
    pub check_exists: bool,
    pub check_not_exists: bool,
}

impl DdlAction {
    /// Match a statement against the DDL grammar. Returns `None` if the
    /// statement is not a recognised DDL statement.
    pub fn from_statement(stmt: &Statement) -> Option<Self> {
        let mut lexemes = stmt.lexemes();

        let verb = DdlVerb::parse(lexemes.lexeme(0))?;
        lexemes = &lexemes[1..];

        if lexemes.begins_with(&["unique", "index"]) {
            lexemes = &lexemes[1..];
        }

        let object_type = ObjectType::parse(lexemes.lexeme(0))?;
        lexemes = &lexemes[1..];

        lexemes = lexemes.skip_prefix(&["concurrently"]);

        let mut check_exists = false;
        let mut check_not_exists = false;
        if lexemes.begins_with(&["if", "exists"]) {
            check_exists = true;
            lexemes = &lexemes[2..];
        } else if lexemes.begins_with(&["if", "not", "exists"]) {
            check_not_exists = true;
            lexemes = &lexemes[3..];
        }

        let mut index = None;
        if object_type == ObjectType::Index {
            if !lexemes.begins_with(&["on"]) && !lexemes.is_empty() {
                index = Some(lexemes[0].clone());
                lexemes = &lexemes[1..];
            }
            lexemes = lexemes.skip_prefix(&["on"]);
            lexemes = lexemes.skip_prefix(&["only"]);
        }

        let (schema, name) = if lexemes.lexeme(1) == "." {
            (Some(lexemes.lexeme(0)), lexemes.lexeme(2))
        } else {
            (None, lexemes.lexeme(0))
        };

        if !is_identifier(name) || !schema.map_or(true, is_identifier) {
            return None;
        }

        Some(Self {
            verb,
            object_type,
            schema: schema.map(str::to_string),
            name: name.to_string(),
            index,
            drop_before: false,
            check_exists,
            check_not_exists,
        })
    }

    /// The object name, including the schema if one was specified.
    pub fn qualified_name(&self) -> String {
        qualify(self.schema.as_deref(), &self.name)
    }

    /// SQL that drops the object created by this action.
    pub fn drop_sql(&self) -> String {
        match (self.object_type, &self.index) {
            (ObjectType::Index, Some(index)) => {
                format!("drop index {};\n", qualify(self.schema.as_deref(), index))
            }
            (ObjectType::Index, None) => format!("drop index on {};\n", self.qualified_name()),
            _ => format!("drop {} {};\n", self.object_type, self.qualified_name()),
        }
    }

    /// Reports whether `other` acts on the same database object.
    pub fn same_object(&self, other: &DdlAction) -> bool {
        self.object_type == other.object_type
            && self.schema == other.schema
            && self.name == other.name
            && self.index == other.index
    }
}

impl fmt::Display for DdlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.object_type)?;
        if self.object_type == ObjectType::Index {
            if let Some(index) = &self.index {
                write!(f, " {}", index)?;
            }
            f.write_str(" on")?;
        }
        write!(f, " {}", self.qualified_name())
    }
}

fn qualify(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", schema, name),
        None => name.to_string(),
    }
}

fn is_identifier(lexeme: &str) -> bool {
    lexeme
        .chars()
        .next()
        .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '"' || c == '`')
}

/// The actions of a whole up migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DdlActions(pub Vec<DdlAction>);

impl DdlActions {
    /// Extract the actions of every statement in `sql`.
    ///
    /// If any statement is not understood the result is empty: a migration
    /// containing opaque SQL cannot have its down migration derived.
    pub fn parse(sql: &str) -> Self {
        let mut actions = Vec::new();
        for stmt in statements(sql) {
            match DdlAction::from_statement(&stmt) {
                Some(action) => actions.push(action),
                None => return Self::default(),
            }
        }

        let actions = merge_drop_create(actions);
        let actions = merge_create_table(actions);
        Self(actions)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &DdlAction> {
        self.0.iter()
    }

    /// The last action matching the verb and object. Searching backwards
    /// handles the contrived case of an object created more than once.
    pub fn find(
        &self,
        verb: DdlVerb,
        object_type: ObjectType,
        schema: Option<&str>,
        name: &str,
    ) -> Option<&DdlAction> {
        self.0.iter().rev().find(|act| {
            act.verb == verb
                && act.object_type == object_type
                && act.schema.as_deref() == schema
                && act.name == name
        })
    }
}

/// Collapse a drop immediately followed by a create of the same object into
/// the create, flagged as having a preceding drop.
fn merge_drop_create(actions: Vec<DdlAction>) -> Vec<DdlAction> {
    let mut merged: Vec<DdlAction> = Vec::with_capacity(actions.len());
    for action in actions {
        if let Some(prev) = merged.last() {
            if prev.verb == DdlVerb::Drop
                && action.verb == DdlVerb::Create
                && prev.same_object(&action)
                && !prev.drop_before
            {
                let check_exists = prev.check_exists;
                merged.pop();
                merged.push(DdlAction {
                    drop_before: true,
                    check_exists,
                    ..action
                });
                continue;
            }
        }
        merged.push(action);
    }
    merged
}

/// Remove alter tables and create indexes that follow a create table of the
/// same table. Reversing them is covered by dropping the table.
fn merge_create_table(actions: Vec<DdlAction>) -> Vec<DdlAction> {
    let mut keep = vec![true; actions.len()];
    for (i, act) in actions.iter().enumerate() {
        if !keep[i] || act.verb != DdlVerb::Create || act.object_type != ObjectType::Table {
            continue;
        }
        for (j, next) in actions.iter().enumerate().skip(i + 1) {
            let dependent = matches!(
                (next.verb, next.object_type),
                (DdlVerb::Alter, ObjectType::Table) | (DdlVerb::Create, ObjectType::Index)
            );
            if dependent && next.schema == act.schema && next.name == act.name {
                keep[j] = false;
            }
        }
    }

    actions
        .into_iter()
        .zip(keep)
        .filter_map(|(act, keep)| keep.then_some(act))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn action(verb: DdlVerb, object_type: ObjectType, name: &str) -> DdlAction {
        DdlAction {
            verb,
            object_type,
            schema: None,
            name: name.to_string(),
            index: None,
            drop_before: false,
            check_exists: false,
            check_not_exists: false,
        }
    }

    #[test]
    fn test_parse_create_table_without_semicolon() {
        let actions = DdlActions::parse("create table t1");
        assert_eq!(
            actions.0,
            vec![action(DdlVerb::Create, ObjectType::Table, "t1")]
        );
    }

    #[test]
    fn test_parse_merges_drop_then_create() {
        let actions = DdlActions::parse("drop table if exists t1;create table t1");
        assert_eq!(
            actions.0,
            vec![DdlAction {
                drop_before: true,
                check_exists: true,
                ..action(DdlVerb::Create, ObjectType::Table, "t1")
            }]
        );
    }

    #[test]
    fn test_parse_rejects_whole_batch_on_unknown_statement() {
        assert!(DdlActions::parse("something not supported").is_empty());
        assert!(DdlActions::parse("create table t1; insert into t1 values (1);").is_empty());
    }

    #[test]
    fn test_parse_absorbs_index_into_create_table() {
        let actions = DdlActions::parse("create table s.t1; create index on s.t1;");
        assert_eq!(
            actions.0,
            vec![DdlAction {
                schema: Some("s".to_string()),
                ..action(DdlVerb::Create, ObjectType::Table, "t1")
            }]
        );
    }

    #[test]
    fn test_parse_absorbs_alter_into_create_table() {
        let actions = DdlActions::parse("create table t1; alter table t1 set whatever;");
        assert_eq!(
            actions.0,
            vec![action(DdlVerb::Create, ObjectType::Table, "t1")]
        );
    }

    #[test]
    fn test_parse_absorbs_per_table() {
        let actions = DdlActions::parse(
            "create table t1; create table t2; create index on t1; \
             alter table t1; alter table t2; create index on t2",
        );
        assert_eq!(
            actions.0,
            vec![
                action(DdlVerb::Create, ObjectType::Table, "t1"),
                action(DdlVerb::Create, ObjectType::Table, "t2"),
            ]
        );
    }

    #[test]
    fn test_parse_index_variants() {
        let actions = DdlActions::parse(
            "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS i1 ON ONLY s.t1 (id);",
        );
        assert_eq!(
            actions.0,
            vec![DdlAction {
                schema: Some("s".to_string()),
                index: Some("i1".to_string()),
                check_not_exists: true,
                ..action(DdlVerb::Create, ObjectType::Index, "t1")
            }]
        );
        assert_eq!(actions.0[0].to_string(), "create index i1 on s.t1");
        assert_eq!(actions.0[0].drop_sql(), "drop index s.i1;\n");

        let anonymous = DdlActions::parse("create index on t2(id);");
        assert_eq!(anonymous.0[0].to_string(), "create index on t2");
    }

    #[test]
    fn test_parse_rejects_missing_name() {
        assert!(DdlActions::parse("create table;").is_empty());
        assert!(DdlActions::parse("drop view").is_empty());
    }

    #[test]
    fn test_should_restore() {
        assert!(ObjectType::View.should_restore());
        assert!(ObjectType::Trigger.should_restore());
        assert!(ObjectType::Procedure.should_restore());
        assert!(ObjectType::Function.should_restore());
        assert!(!ObjectType::Table.should_restore());
        assert!(!ObjectType::Index.should_restore());
        assert!(!ObjectType::Domain.should_restore());
        assert!(!ObjectType::Sequence.should_restore());
        assert!(!ObjectType::Type.should_restore());
    }

    #[test]
    fn test_find_searches_backwards() {
        let actions = DdlActions::parse("create view v1 as select 1; create view v2 as select 2;");
        let found = actions
            .find(DdlVerb::Create, ObjectType::View, None, "v2")
            .map(|act| act.name.clone());
        assert_eq!(found, Some("v2".to_string()));
        assert!(actions.find(DdlVerb::Drop, ObjectType::View, None, "v2").is_none());
    }
}
