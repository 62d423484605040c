//! Version summary
//!
//! Combines the rows of the bookkeeping table with the compiled plans. A
//! summary is always read inside the transaction that acts on it.

use crate::error::{MigrationError, MigrationResult};
use crate::schema::MigrationPlan;
use crate::version::{Version, VersionId};
use std::collections::HashMap;

pub(crate) struct VersionSummary<'p> {
    /// Applied and unapplied versions, ascending
    pub versions: Vec<Version>,
    /// Applied plans, most recent first
    pub applied: Vec<&'p MigrationPlan>,
    /// Unapplied plans, ascending
    pub unapplied: Vec<&'p MigrationPlan>,
    index: HashMap<VersionId, usize>,
}

impl<'p> VersionSummary<'p> {
    /// Build a summary that tolerates failed versions and rows without a
    /// plan, for inspection and repair.
    pub fn new(rows: Vec<Version>, plans: &'p [MigrationPlan]) -> Self {
        let mut versions = rows;
        let applied_ids: HashMap<VersionId, usize> = versions
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id, i))
            .collect();

        let mut applied = Vec::new();
        let mut unapplied = Vec::new();
        for plan in plans {
            let idx = match applied_ids.get(&plan.id) {
                Some(&idx) => {
                    applied.push(plan);
                    idx
                }
                None => {
                    unapplied.push(plan);
                    versions.push(Version::unapplied(plan.id));
                    versions.len() - 1
                }
            };
            let version = &mut versions[idx];
            version.description = plan.description.clone();
            version.up = plan.up_description();
            version.down = plan.down_description();
        }

        versions.sort_by_key(|v| v.id);
        applied.sort_by(|a, b| b.id.cmp(&a.id));
        unapplied.sort_by_key(|p| p.id);

        let index = versions
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id, i))
            .collect();

        Self {
            versions,
            applied,
            unapplied,
            index,
        }
    }

    /// Build a summary for an operation that changes the schema. Fails if
    /// any version is marked failed or a row has no plan.
    pub fn strict(rows: Vec<Version>, plans: &'p [MigrationPlan]) -> MigrationResult<Self> {
        let summary = Self::new(rows, plans);
        for version in &summary.versions {
            if version.failed {
                return Err(MigrationError::PreviouslyFailed(version.id));
            }
        }
        for version in &summary.versions {
            if !plans.iter().any(|p| p.id == version.id) {
                return Err(MigrationError::MissingPlan(version.id));
            }
        }
        Ok(summary)
    }

    pub fn get(&self, id: VersionId) -> Option<&Version> {
        self.index.get(&id).map(|&i| &self.versions[i])
    }

    pub fn is_applied(&self, id: VersionId) -> bool {
        self.applied.iter().any(|plan| plan.id == id)
    }

    /// The most recently applied version.
    pub fn current(&self) -> Option<&Version> {
        self.applied.first().and_then(|plan| self.get(plan.id))
    }

    /// Fail if a locked version would have to be migrated down to reach
    /// `target`.
    pub fn check_locked(&self, target: VersionId) -> MigrationResult<()> {
        for plan in &self.applied {
            if plan.id <= target {
                break;
            }
            if self.get(plan.id).map_or(false, |v| v.locked) {
                return Err(MigrationError::Locked(plan.id));
            }
        }
        Ok(())
    }

    /// Down and up steps still needed to reach `target`.
    pub fn steps_to(&self, target: VersionId) -> (usize, usize) {
        let down = self
            .applied
            .iter()
            .take_while(|plan| plan.id > target)
            .count();
        let up = self
            .unapplied
            .iter()
            .take_while(|plan| plan.id <= target)
            .count();
        (down, up)
    }
}
