pub mod source;

pub use source::{Migration, MigrationSet};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, FromRow, PgConnection, PgPool, Postgres};

use crate::db::{quote_ident, MigrationSession};
use crate::error::MigrationError;

/// Where a migration session runs: search path, tracking table and migration directory.
/// The tracking table lives in the first schema of the search path.
#[derive(Debug, Clone)]
pub struct MigrationTarget {
    pub search_path: Vec<String>,
    pub table_name: String,
    pub migrations: Arc<MigrationSet>,
}

impl MigrationTarget {
    pub fn new(search_path: Vec<String>, table_name: &str, migrations: Arc<MigrationSet>) -> Self {
        Self {
            search_path,
            table_name: table_name.to_string(),
            migrations,
        }
    }

    pub fn schema(&self) -> &str {
        self.search_path.first().map(String::as_str).unwrap_or("public")
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(self.schema()), quote_ident(&self.table_name))
    }

    /// Advisory lock key shared by every session migrating the same tracking table.
    pub fn lock_key(&self) -> i64 {
        let digest = Sha256::digest(format!("{}.{}", self.schema(), self.table_name).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AppliedMigration {
    pub version: i64,
    pub batch: i32,
    pub checksum: String,
}

/// Applied versions must all still exist locally, unchanged.
pub fn verify_applied(
    migrations: &MigrationSet,
    applied: &[AppliedMigration],
) -> Result<(), MigrationError> {
    for record in applied {
        let migration = migrations
            .get(record.version)
            .ok_or(MigrationError::VersionMissing { version: record.version })?;
        if migration.checksum != record.checksum {
            return Err(MigrationError::ChecksumMismatch { version: record.version });
        }
    }
    Ok(())
}

pub fn pending_migrations<'a>(
    migrations: &'a MigrationSet,
    applied: &[AppliedMigration],
) -> Vec<&'a Migration> {
    let done: HashSet<i64> = applied.iter().map(|r| r.version).collect();
    migrations.iter().filter(|m| !done.contains(&m.version)).collect()
}

/// Records of the highest batch, newest first.
pub fn last_batch(applied: &[AppliedMigration]) -> Option<(i32, Vec<&AppliedMigration>)> {
    let batch = applied.iter().map(|r| r.batch).max()?;
    let mut records: Vec<&AppliedMigration> = applied.iter().filter(|r| r.batch == batch).collect();
    records.sort_by(|a, b| b.version.cmp(&a.version));
    Some((batch, records))
}

/// PostgreSQL migration runner for one target.
pub struct PgMigrationSession {
    pool: PgPool,
    target: MigrationTarget,
}

impl PgMigrationSession {
    pub fn new(pool: PgPool, target: MigrationTarget) -> Self {
        Self { pool, target }
    }

    async fn lock(&self) -> Result<PoolConnection<Postgres>, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.target.lock_key())
            .execute(&mut *conn)
            .await?;
        Ok(conn)
    }

    async fn unlock(&self, mut conn: PoolConnection<Postgres>) {
        let released = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.target.lock_key())
            .execute(&mut *conn)
            .await;
        if let Err(e) = released {
            // Closing the connection drops the session-level lock.
            tracing::warn!("Could not release migration lock on {}: {e}", self.target.schema());
            drop(conn.detach());
        }
    }

    async fn ensure_table(&self, conn: &mut PgConnection) -> Result<(), MigrationError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version    BIGINT PRIMARY KEY,
                name       TEXT NOT NULL,
                batch      INTEGER NOT NULL,
                checksum   TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            self.target.qualified_table()
        );
        (&mut *conn).execute(ddl.as_str()).await?;
        Ok(())
    }

    async fn table_exists(&self, conn: &mut PgConnection) -> Result<bool, MigrationError> {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(self.target.qualified_table())
            .fetch_one(&mut *conn)
            .await?;
        Ok(found.is_some())
    }

    async fn fetch_applied(
        &self,
        conn: &mut PgConnection,
    ) -> Result<Vec<AppliedMigration>, MigrationError> {
        let records = sqlx::query_as::<_, AppliedMigration>(&format!(
            "SELECT version, batch, checksum FROM {} ORDER BY version",
            self.target.qualified_table()
        ))
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }

    async fn applied(&self, conn: &mut PgConnection) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_table(conn).await?;
        self.fetch_applied(conn).await
    }

    async fn apply_one(
        &self,
        conn: &mut PgConnection,
        migration: &Migration,
        batch: i32,
    ) -> Result<(), sqlx::Error> {
        let mut tx = conn.begin().await?;
        (&mut *tx).execute(migration.up.as_str()).await?;
        sqlx::query(&format!(
            "INSERT INTO {} (version, name, batch, checksum) VALUES ($1, $2, $3, $4)",
            self.target.qualified_table()
        ))
        .bind(migration.version)
        .bind(&migration.name)
        .bind(batch)
        .bind(&migration.checksum)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    async fn revert_one(
        &self,
        conn: &mut PgConnection,
        version: i64,
        down: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tx = conn.begin().await?;
        (&mut *tx).execute(down).await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE version = $1",
            self.target.qualified_table()
        ))
        .bind(version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    async fn apply_latest_locked(
        &self,
        conn: &mut PgConnection,
    ) -> Result<(i32, Vec<String>), MigrationError> {
        let applied = self.applied(conn).await?;
        verify_applied(&self.target.migrations, &applied)?;

        let current = applied.iter().map(|r| r.batch).max().unwrap_or(0);
        let pending = pending_migrations(&self.target.migrations, &applied);
        if pending.is_empty() {
            return Ok((current, Vec::new()));
        }

        let batch = current + 1;
        let mut done = Vec::with_capacity(pending.len());
        for migration in pending {
            if let Err(source) = self.apply_one(conn, migration, batch).await {
                return Err(MigrationError::Failed {
                    batch,
                    applied: done,
                    name: migration.file_stem(),
                    source,
                });
            }
            tracing::debug!("Applied {} to {}", migration.file_stem(), self.target.schema());
            done.push(migration.file_stem());
        }
        Ok((batch, done))
    }

    async fn rollback_locked(
        &self,
        conn: &mut PgConnection,
    ) -> Result<(i32, Vec<String>), MigrationError> {
        let applied = self.applied(conn).await?;
        let Some((batch, records)) = last_batch(&applied) else {
            return Ok((0, Vec::new()));
        };

        let mut reverted = Vec::with_capacity(records.len());
        for record in records {
            let migration = self
                .target
                .migrations
                .get(record.version)
                .ok_or(MigrationError::VersionMissing { version: record.version })?;
            let down = migration
                .down
                .as_deref()
                .ok_or_else(|| MigrationError::MissingDown { name: migration.file_stem() })?;
            self.revert_one(conn, record.version, down).await?;
            tracing::debug!("Reverted {} in {}", migration.file_stem(), self.target.schema());
            reverted.push(migration.file_stem());
        }
        Ok((batch, reverted))
    }
}

#[async_trait]
impl MigrationSession for PgMigrationSession {
    fn schema(&self) -> &str {
        self.target.schema()
    }

    async fn apply_latest(&self) -> Result<(i32, Vec<String>), MigrationError> {
        let mut conn = self.lock().await?;
        let result = self.apply_latest_locked(&mut conn).await;
        self.unlock(conn).await;
        result
    }

    async fn rollback_last_batch(&self) -> Result<(i32, Vec<String>), MigrationError> {
        let mut conn = self.lock().await?;
        let result = self.rollback_locked(&mut conn).await;
        self.unlock(conn).await;
        result
    }

    /// Read-only: a missing tracking table means nothing has been applied yet.
    async fn pending(&self) -> Result<Vec<String>, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        let applied = if self.table_exists(&mut conn).await? {
            self.fetch_applied(&mut conn).await?
        } else {
            Vec::new()
        };
        verify_applied(&self.target.migrations, &applied)?;
        Ok(pending_migrations(&self.target.migrations, &applied)
            .into_iter()
            .map(Migration::file_stem)
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
