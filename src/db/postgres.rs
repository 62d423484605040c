//! PostgreSQL driver
//!
//! Connections come from a `deadpool-postgres` pool. A transaction holds
//! one pooled client for its whole lifetime and is driven with plain
//! `BEGIN` / `COMMIT` / `ROLLBACK` statements.

use super::{Database, Transaction};
use crate::config::DatabaseConfig;
use crate::error::DbError;
use crate::version::{Version, VersionId};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use postgres_types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

/// A PostgreSQL database reached through a connection pool
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: Pool,
}

impl PostgresDatabase {
    /// Create a pool for `config` and verify that a connection can be made.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

        let pool = if config.require_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            cfg.create_pool(Some(Runtime::Tokio1), tls)
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        }
        .map_err(|e| DbError::Config(format!("Failed to create pool: {}", e)))?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        drop(client);

        info!(
            "Connected to database {} on {}:{} (TLS: {})",
            config.database, config.host, config.port, config.require_tls
        );

        Ok(Self { pool })
    }

    /// Use an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        // Owned by the transaction before BEGIN is sent: a failed or
        // abandoned begin drops it and detaches the connection.
        let tx = PgTransaction {
            client: Some(self.pool.get().await?),
        };
        tx.client()?.batch_execute("BEGIN").await?;
        Ok(Box::new(tx))
    }

    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, DbError> {
        let client = self.pool.get().await?;
        Ok(client.execute(sql, params).await?)
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        Ok(client.batch_execute(sql).await?)
    }

    async fn create_migrations_table(&self, table: &str) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGINT PRIMARY KEY,
                applied_at TIMESTAMPTZ NULL,
                failed BOOLEAN NOT NULL DEFAULT FALSE,
                locked BOOLEAN NOT NULL DEFAULT FALSE
            )",
            quote_ident(table)
        );
        client.batch_execute(&sql).await?;
        debug!("Ensured migrations table {}", table);
        Ok(())
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }
}

/// A transaction on a single pooled connection
pub struct PgTransaction {
    client: Option<Object>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Object, DbError> {
        self.client
            .as_ref()
            .ok_or_else(|| DbError::Message("transaction already finished".to_string()))
    }

    async fn finish(&mut self, statement: &str) -> Result<(), DbError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        if let Err(e) = client.batch_execute(statement).await {
            // The connection state is unknown, keep it out of the pool
            drop(Object::take(client));
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // Detaching the connection closes it, which makes the server abort
        // the open transaction.
        if let Some(client) = self.client.take() {
            debug!("Discarding connection of unfinished transaction");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, DbError> {
        Ok(self.client()?.execute(sql, params).await?)
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        Ok(self.client()?.batch_execute(sql).await?)
    }

    async fn insert_version(&mut self, table: &str, version: &Version) -> Result<(), DbError> {
        let sql = format!(
            "INSERT INTO {} (id, applied_at, failed, locked) VALUES ($1, $2, $3, $4)",
            quote_ident(table)
        );
        self.client()?
            .execute(
                &sql,
                &[
                    &version.id,
                    &version.applied_at,
                    &version.failed,
                    &version.locked,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_version(&mut self, table: &str, id: VersionId) -> Result<(), DbError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", quote_ident(table));
        self.client()?.execute(&sql, &[&id]).await?;
        Ok(())
    }

    async fn set_version_failed(
        &mut self,
        table: &str,
        id: VersionId,
        failed: bool,
    ) -> Result<(), DbError> {
        let sql = format!("UPDATE {} SET failed = $2 WHERE id = $1", quote_ident(table));
        self.client()?.execute(&sql, &[&id, &failed]).await?;
        Ok(())
    }

    async fn set_version_locked(
        &mut self,
        table: &str,
        id: VersionId,
        locked: bool,
    ) -> Result<(), DbError> {
        let sql = format!("UPDATE {} SET locked = $2 WHERE id = $1", quote_ident(table));
        self.client()?.execute(&sql, &[&id, &locked]).await?;
        Ok(())
    }

    async fn list_versions(&mut self, table: &str) -> Result<Vec<Version>, DbError> {
        let sql = format!(
            "SELECT id, applied_at, failed, locked FROM {} ORDER BY id",
            quote_ident(table)
        );
        let rows = self.client()?.query(&sql, &[]).await?;
        Ok(rows.iter().map(version_from_row).collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let mut tx = self;
        tx.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        let mut tx = self;
        tx.finish("ROLLBACK").await
    }
}

fn version_from_row(row: &Row) -> Version {
    Version {
        id: row.get("id"),
        applied_at: row.get("applied_at"),
        failed: row.get("failed"),
        locked: row.get("locked"),
        ..Version::default()
    }
}

/// Quote a possibly schema-qualified identifier.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.trim_matches('"').replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}
