//! Schema version records

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Uniquely identifies a database schema version. Versions are applied in
/// ascending order of id.
pub type VersionId = i64;

/// Information about a single database schema version.
///
/// Rows in the bookkeeping table only exist for applied versions. Unapplied
/// versions are filled in from the schema definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: VersionId,
    /// When the migration was applied, or `None` if it has not been
    pub applied_at: Option<DateTime<Utc>>,
    /// An out-of-band migration was started and never confirmed
    pub failed: bool,
    /// Down migrations may not pass this version
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// SQL for the up migration, or a marker for a function
    pub up: String,
    /// SQL for the down migration, or a marker for a function
    pub down: String,
}

impl Version {
    /// A version that has not been applied to the database.
    pub fn unapplied(id: VersionId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}
