//! DDL statement analysis
//!
//! - `tokens`: splits SQL text into statements of lexemes
//! - `action`: classifies statements as create/alter/drop actions

pub mod action;
pub mod tokens;

pub use action::{DdlAction, DdlActions, DdlVerb, ObjectType};
pub use tokens::{statements, Statement};
