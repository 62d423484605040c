//! Migration worker
//!
//! Applies the plans of a [`Schema`] to a database. Every public operation
//! reads the version summary inside its own transaction before acting, so no
//! state is cached between calls.
//!
//! Migrations that cannot run inside a transaction (the database cannot roll
//! back DDL, or the author supplied a non-transactional function) are run out
//! of band: the version row is first marked failed in a committed transaction,
//! the migration runs, and the mark is cleared afterwards. If the process dies
//! or the operation is cancelled in between, the version stays failed until
//! [`Worker::force`] is called.

mod summary;

use crate::db::{Database, Transaction};
use crate::error::{BoxError, MigrationError, MigrationResult};
use crate::schema::{Executor, MigrationPlan, Schema};
use crate::version::{Version, VersionId};
use chrono::Utc;
use std::future::Future;
use summary::VersionSummary;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a single step attempted inside a transaction
enum Step {
    /// Nothing left to do, or stopped at a locked version
    Idle,
    /// Performed inside the transaction
    Done { id: VersionId, more: bool },
    /// Has to be performed outside of a transaction
    Escalate { id: VersionId, more: bool },
}

/// A bookkeeping change committed in its own transaction
enum Bookkeeping<'a> {
    Insert(&'a Version),
    Delete(VersionId),
    SetFailed(VersionId, bool),
}

/// Performs database migrations for a schema against a database.
pub struct Worker<D: Database> {
    db: D,
    plans: Vec<MigrationPlan>,
    table: String,
    initialized: OnceCell<()>,
}

impl<D: Database> Worker<D> {
    /// Create a worker. Fails with every validation error if the schema is
    /// not valid.
    pub fn new(db: D, schema: &Schema) -> MigrationResult<Self> {
        let (plans, errs) = schema.compile();
        if !errs.is_empty() {
            return Err(errs.into());
        }

        Ok(Self {
            db,
            plans,
            table: schema.migrations_table().to_string(),
            initialized: OnceCell::new(),
        })
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Migrate up to the latest version.
    pub async fn up(&self, token: &CancellationToken) -> MigrationResult<()> {
        self.init(token).await?;
        while self.up_one(token).await? {}
        self.finished(token, "migrate up").await;
        Ok(())
    }

    /// Migrate down until every version is reversed, or until the most
    /// recent remaining version is locked.
    pub async fn down(&self, token: &CancellationToken) -> MigrationResult<()> {
        self.init(token).await?;
        while self.down_one(token).await? {}
        self.finished(token, "migrate down").await;
        Ok(())
    }

    /// Migrate up or down to version `id`. Zero migrates all the way down.
    pub async fn goto(&self, token: &CancellationToken, id: VersionId) -> MigrationResult<()> {
        if id != 0 {
            self.check_version(id)?;
        }
        self.init(token).await?;
        while self.goto_one(token, id).await? {}
        self.finished(token, "migrate goto").await;
        Ok(())
    }

    /// Details of version `id`. Unlike the other operations this works
    /// while a version is marked failed.
    pub async fn version(
        &self,
        token: &CancellationToken,
        id: VersionId,
    ) -> MigrationResult<Version> {
        self.check_version(id)?;
        self.init(token).await?;

        let mut tx = self.begin(token).await?;
        let result = self
            .summary(token, tx.as_mut(), false)
            .await
            .and_then(|summary| {
                summary
                    .get(id)
                    .cloned()
                    .ok_or(MigrationError::InvalidVersion(id))
            });
        self.finish(token, tx, result).await
    }

    /// Every known version, applied or not, in ascending order.
    pub async fn versions(&self, token: &CancellationToken) -> MigrationResult<Vec<Version>> {
        self.init(token).await?;

        let mut tx = self.begin(token).await?;
        let result = self
            .summary(token, tx.as_mut(), true)
            .await
            .map(|summary| summary.versions);
        self.finish(token, tx, result).await
    }

    /// Force the bookkeeping to version `id` after a failed out-of-band
    /// migration has been repaired by hand. Rows above `id` are deleted and
    /// the failure mark on `id` is cleared. No migration is run.
    pub async fn force(&self, token: &CancellationToken, id: VersionId) -> MigrationResult<()> {
        self.check_version(id)?;
        self.init(token).await?;

        let mut tx = self.begin(token).await?;
        let result = self.force_in_tx(token, tx.as_mut(), id).await;
        self.finish(token, tx, result).await
    }

    /// Prevent down migrations past version `id`.
    pub async fn lock(&self, token: &CancellationToken, id: VersionId) -> MigrationResult<()> {
        self.set_locked(token, id, true).await
    }

    pub async fn unlock(&self, token: &CancellationToken, id: VersionId) -> MigrationResult<()> {
        self.set_locked(token, id, false).await
    }

    async fn init(&self, token: &CancellationToken) -> MigrationResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                cancellable(token, self.db.create_migrations_table(&self.table)).await??;
                debug!("Migrations table {} ready", self.table);
                Ok::<(), MigrationError>(())
            })
            .await?;
        Ok(())
    }

    fn check_version(&self, id: VersionId) -> MigrationResult<()> {
        self.plan(id).map(|_| ()).ok_or(MigrationError::InvalidVersion(id))
    }

    fn plan(&self, id: VersionId) -> Option<&MigrationPlan> {
        self.plans.iter().find(|plan| plan.id == id)
    }

    async fn begin(&self, token: &CancellationToken) -> MigrationResult<Box<dyn Transaction>> {
        cancellable(token, self.db.begin())
            .await?
            .map_err(MigrationError::Begin)
    }

    /// Commit on success, otherwise roll back and return the step error.
    async fn finish<T>(
        &self,
        token: &CancellationToken,
        tx: Box<dyn Transaction>,
        result: MigrationResult<T>,
    ) -> MigrationResult<T> {
        match result {
            Ok(value) => {
                cancellable(token, tx.commit())
                    .await?
                    .map_err(MigrationError::Commit)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!("Rollback failed: {}", e);
                }
                Err(err)
            }
        }
    }

    async fn summary(
        &self,
        token: &CancellationToken,
        tx: &mut dyn Transaction,
        strict: bool,
    ) -> MigrationResult<VersionSummary<'_>> {
        let rows = cancellable(token, tx.list_versions(&self.table)).await??;
        if strict {
            VersionSummary::strict(rows, &self.plans)
        } else {
            Ok(VersionSummary::new(rows, &self.plans))
        }
    }

    async fn record(
        &self,
        token: &CancellationToken,
        change: Bookkeeping<'_>,
    ) -> MigrationResult<()> {
        let mut tx = self.begin(token).await?;
        let table = self.table.as_str();
        let result = match change {
            Bookkeeping::Insert(version) => {
                cancellable(token, tx.insert_version(table, version)).await
            }
            Bookkeeping::Delete(id) => cancellable(token, tx.delete_version(table, id)).await,
            Bookkeeping::SetFailed(id, failed) => {
                cancellable(token, tx.set_version_failed(table, id, failed)).await
            }
        }
        .and_then(|res| res.map_err(MigrationError::from));
        self.finish(token, tx, result).await
    }

    /// Migrate up one version. Reports whether another up migration is
    /// pending.
    async fn up_one(&self, token: &CancellationToken) -> MigrationResult<bool> {
        let mut tx = self.begin(token).await?;
        let result = self.up_in_tx(token, tx.as_mut()).await;
        match self.finish(token, tx, result).await? {
            Step::Idle => Ok(false),
            Step::Done { id, more } => {
                info!("migrated up version={}", id);
                Ok(more)
            }
            Step::Escalate { id, more } => {
                self.up_out_of_band(token, id).await?;
                info!("migrated up version={}", id);
                Ok(more)
            }
        }
    }

    async fn up_in_tx(
        &self,
        token: &CancellationToken,
        tx: &mut dyn Transaction,
    ) -> MigrationResult<Step> {
        let summary = self.summary(token, &mut *tx, true).await?;
        let Some(plan) = summary.unapplied.first().copied() else {
            return Ok(Step::Idle);
        };
        let id = plan.id;
        let more = summary.unapplied.len() > 1;

        match &plan.up {
            Some(Executor::Tx(up)) => cancellable(token, up(&mut *tx))
                .await?
                .map_err(|e| MigrationError::migrate(id, e))?,
            Some(Executor::Sql(sql)) if self.db.supports_transactional_ddl() => {
                cancellable(token, tx.batch_execute(sql))
                    .await?
                    .map_err(|e| MigrationError::migrate(id, e))?
            }
            Some(_) => return Ok(Step::Escalate { id, more }),
            None => return Err(MigrationError::NoUpMigration(id)),
        }

        let version = Version {
            id,
            applied_at: Some(Utc::now()),
            ..Version::default()
        };
        cancellable(token, tx.insert_version(&self.table, &version))
            .await?
            .map_err(|e| MigrationError::migrate(id, e))?;

        Ok(Step::Done { id, more })
    }

    async fn up_out_of_band(
        &self,
        token: &CancellationToken,
        id: VersionId,
    ) -> MigrationResult<()> {
        let plan = self.plan(id).ok_or(MigrationError::MissingPlan(id))?;

        let marker = Version {
            id,
            applied_at: Some(Utc::now()),
            failed: true,
            ..Version::default()
        };
        self.record(token, Bookkeeping::Insert(&marker)).await?;
        debug!("Running up migration outside of a transaction version={}", id);

        match &plan.up {
            Some(executor) => self.run_out_of_band(token, id, executor).await?,
            None => return Err(MigrationError::NoUpMigration(id)),
        }

        self.record(token, Bookkeeping::SetFailed(id, false)).await
    }

    /// Migrate down one version. Reports whether another down migration is
    /// available.
    async fn down_one(&self, token: &CancellationToken) -> MigrationResult<bool> {
        let mut tx = self.begin(token).await?;
        let result = self.down_in_tx(token, tx.as_mut()).await;
        match self.finish(token, tx, result).await? {
            Step::Idle => Ok(false),
            Step::Done { id, more } => {
                info!("migrated down version={}", id);
                Ok(more)
            }
            Step::Escalate { id, more } => {
                self.down_out_of_band(token, id).await?;
                info!("migrated down version={}", id);
                Ok(more)
            }
        }
    }

    async fn down_in_tx(
        &self,
        token: &CancellationToken,
        tx: &mut dyn Transaction,
    ) -> MigrationResult<Step> {
        let summary = self.summary(token, &mut *tx, true).await?;
        let Some(plan) = summary.applied.first().copied() else {
            return Ok(Step::Idle);
        };
        let id = plan.id;
        if summary.get(id).map_or(false, |v| v.locked) {
            info!("locked version={}", id);
            return Ok(Step::Idle);
        }
        let more = summary.applied.len() > 1;

        match &plan.down {
            Some(Executor::Tx(down)) => cancellable(token, down(&mut *tx))
                .await?
                .map_err(|e| MigrationError::migrate(id, e))?,
            Some(Executor::Sql(sql)) if self.db.supports_transactional_ddl() => {
                cancellable(token, tx.batch_execute(sql))
                    .await?
                    .map_err(|e| MigrationError::migrate(id, e))?
            }
            Some(_) => return Ok(Step::Escalate { id, more }),
            None => return Err(MigrationError::NoDownMigration(id)),
        }

        cancellable(token, tx.delete_version(&self.table, id))
            .await?
            .map_err(|e| MigrationError::migrate(id, e))?;

        Ok(Step::Done { id, more })
    }

    async fn down_out_of_band(
        &self,
        token: &CancellationToken,
        id: VersionId,
    ) -> MigrationResult<()> {
        let plan = self.plan(id).ok_or(MigrationError::MissingPlan(id))?;

        self.record(token, Bookkeeping::SetFailed(id, true)).await?;
        debug!("Running down migration outside of a transaction version={}", id);

        match &plan.down {
            Some(executor) => self.run_out_of_band(token, id, executor).await?,
            None => return Err(MigrationError::NoDownMigration(id)),
        }

        self.record(token, Bookkeeping::Delete(id)).await
    }

    async fn run_out_of_band(
        &self,
        token: &CancellationToken,
        id: VersionId,
        executor: &Executor,
    ) -> MigrationResult<()> {
        let result: Result<(), BoxError> = match executor {
            Executor::Db(f) => cancellable(token, f(&self.db)).await?,
            Executor::Sql(sql) => cancellable(token, self.db.batch_execute(sql))
                .await?
                .map_err(BoxError::from),
            Executor::Tx(_) => Err("tx fn cannot run out of band".into()),
        };
        result.map_err(|e| MigrationError::migrate(id, e))
    }

    /// Take one step towards `target`, preferring a down step. Reports
    /// whether more steps remain.
    async fn goto_one(
        &self,
        token: &CancellationToken,
        target: VersionId,
    ) -> MigrationResult<bool> {
        let mut tx = self.begin(token).await?;
        let result = self.goto_steps(token, tx.as_mut(), target).await;
        let (mut down, mut up) = self.finish(token, tx, result).await?;

        if down > 0 {
            self.down_one(token).await?;
            down -= 1;
        } else if up > 0 {
            self.up_one(token).await?;
            up -= 1;
        }

        Ok(down + up > 0)
    }

    async fn goto_steps(
        &self,
        token: &CancellationToken,
        tx: &mut dyn Transaction,
        target: VersionId,
    ) -> MigrationResult<(usize, usize)> {
        let summary = self.summary(token, tx, true).await?;
        summary.check_locked(target)?;
        Ok(summary.steps_to(target))
    }

    async fn force_in_tx(
        &self,
        token: &CancellationToken,
        tx: &mut dyn Transaction,
        id: VersionId,
    ) -> MigrationResult<()> {
        let summary = self.summary(token, &mut *tx, false).await?;
        summary.check_locked(id)?;
        if !summary.is_applied(id) {
            return Err(MigrationError::Unapplied { verb: "force", id });
        }

        for version in &summary.versions {
            if version.id > id && version.is_applied() {
                cancellable(token, tx.delete_version(&self.table, version.id)).await??;
                info!("deleted database version id={}", version.id);
            } else if version.id == id && version.failed {
                cancellable(token, tx.set_version_failed(&self.table, id, false)).await??;
                info!("cleared database version failure id={}", id);
            }
        }
        Ok(())
    }

    async fn set_locked(
        &self,
        token: &CancellationToken,
        id: VersionId,
        locked: bool,
    ) -> MigrationResult<()> {
        self.check_version(id)?;
        self.init(token).await?;

        let verb = if locked { "lock" } else { "unlock" };
        let mut tx = self.begin(token).await?;
        let result = self.set_locked_in_tx(token, tx.as_mut(), id, locked, verb).await;
        self.finish(token, tx, result).await?;
        if locked {
            info!("lock set version={}", id);
        } else {
            info!("lock cleared version={}", id);
        }
        Ok(())
    }

    async fn set_locked_in_tx(
        &self,
        token: &CancellationToken,
        tx: &mut dyn Transaction,
        id: VersionId,
        locked: bool,
        verb: &'static str,
    ) -> MigrationResult<()> {
        let summary = self.summary(token, &mut *tx, true).await?;
        if !summary.is_applied(id) {
            return Err(MigrationError::Unapplied { verb, id });
        }
        cancellable(token, tx.set_version_locked(&self.table, id, locked)).await??;
        Ok(())
    }

    /// Log the version the database was left at.
    async fn finished(&self, token: &CancellationToken, op: &str) {
        match self.current_version(token).await {
            Ok(Some(version)) => {
                let mut msg = format!("{} finished version={}", op, version.id);
                if version.locked {
                    msg.push_str(" status=locked");
                }
                if version.failed {
                    msg.push_str(" status=failed");
                }
                info!("{}", msg);
            }
            Ok(None) => info!("{} finished", op),
            Err(e) => warn!("{} finished, cannot read version: {}", op, e),
        }
    }

    async fn current_version(&self, token: &CancellationToken) -> MigrationResult<Option<Version>> {
        let mut tx = self.begin(token).await?;
        let result = self
            .summary(token, tx.as_mut(), false)
            .await
            .map(|summary| summary.current().cloned());
        self.finish(token, tx, result).await
    }
}

/// Race `fut` against cancellation of `token`.
async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> MigrationResult<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(MigrationError::Cancelled),
        output = fut => Ok(output),
    }
}
