pub mod migrate;
pub mod registry;
pub mod tenant;


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{MigrationError, RegistryError};
use crate::models::tenant::Tenant;
use migrate::{MigrationSet, MigrationTarget, PgMigrationSession};
use registry::PgMasterSession;

pub const MASTER_MIGRATIONS_TABLE: &str = "schema_migrations_master";
pub const TENANT_MIGRATIONS_TABLE: &str = "schema_migrations_tenant";

/// Registry and DDL operations against the shared schema.
#[async_trait]
pub trait MasterSession: Send + Sync {
    async fn upsert_provisioning(&self, org_id: &str, schema_name: &str) -> Result<(), RegistryError>;
    async fn mark_active(&self, org_id: &str) -> Result<(), RegistryError>;
    async fn mark_failed(&self, org_id: &str, error: &str) -> Result<(), RegistryError>;
    async fn list_tenant_schemas(&self) -> Result<Vec<String>, RegistryError>;
    async fn list_tenants(&self) -> Result<Vec<Tenant>, RegistryError>;
    async fn find_tenant(&self, org_id: &str) -> Result<Option<Tenant>, RegistryError>;
    async fn ensure_schema(&self, schema: &str) -> Result<(), sqlx::Error>;
    async fn ensure_extensions(&self, extensions: &[String]) -> Result<(), sqlx::Error>;
    async fn close(&self);
}

/// A migration runner bound to one search path and one migration directory.
#[async_trait]
pub trait MigrationSession: Send + Sync {
    fn schema(&self) -> &str;
    /// Applies every pending migration as a new batch. Returns `(batch, applied files)`.
    async fn apply_latest(&self) -> Result<(i32, Vec<String>), MigrationError>;
    /// Reverts the highest recorded batch. Returns `(batch, rolled back files)`, `(0, [])` when empty.
    async fn rollback_last_batch(&self) -> Result<(i32, Vec<String>), MigrationError>;
    async fn pending(&self) -> Result<Vec<String>, MigrationError>;
    async fn close(&self);
}

/// Hands out fresh, independently closable sessions per scope.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn master(&self) -> Result<Box<dyn MasterSession>, RegistryError>;
    async fn master_migrations(&self) -> Result<Box<dyn MigrationSession>, MigrationError>;
    async fn tenant(&self, schema: &str) -> Result<Box<dyn MigrationSession>, MigrationError>;
}

pub async fn create_pool(
    options: PgConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await
}

/// Quotes a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `search_path` value for an ordered list of schemas.
pub fn search_path_value(schemas: &[&str]) -> String {
    schemas
        .iter()
        .map(|s| quote_ident(s))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct PgConnector {
    options: PgConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
    shared_schema: String,
    master_migrations: Arc<MigrationSet>,
    tenant_migrations: Arc<MigrationSet>,
}

impl PgConnector {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let options: PgConnectOptions = config.database_url.parse()?;
        let master_migrations = MigrationSet::load(config.migrations_dir.join("master"))?;
        let tenant_migrations = MigrationSet::load(config.migrations_dir.join("tenant"))?;
        tracing::debug!(
            "Loaded {} master migrations from {} and {} tenant migrations from {}",
            master_migrations.iter().count(),
            master_migrations.dir().display(),
            tenant_migrations.iter().count(),
            tenant_migrations.dir().display()
        );

        Ok(Self {
            options,
            max_connections: config.max_connections,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            shared_schema: config.shared_schema.clone(),
            master_migrations: Arc::new(master_migrations),
            tenant_migrations: Arc::new(tenant_migrations),
        })
    }

    async fn pool(&self, search_path: &[&str]) -> Result<PgPool, sqlx::Error> {
        let options = self
            .options
            .clone()
            .options([("search_path", search_path_value(search_path))]);
        create_pool(options, self.max_connections, self.acquire_timeout).await
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn master(&self) -> Result<Box<dyn MasterSession>, RegistryError> {
        let pool = self.pool(&[self.shared_schema.as_str()]).await?;
        Ok(Box::new(PgMasterSession::new(pool, &self.shared_schema)))
    }

    async fn master_migrations(&self) -> Result<Box<dyn MigrationSession>, MigrationError> {
        let pool = self.pool(&[self.shared_schema.as_str()]).await?;
        let target = MigrationTarget::new(
            vec![self.shared_schema.clone()],
            MASTER_MIGRATIONS_TABLE,
            self.master_migrations.clone(),
        );
        Ok(Box::new(PgMigrationSession::new(pool, target)))
    }

    async fn tenant(&self, schema: &str) -> Result<Box<dyn MigrationSession>, MigrationError> {
        let pool = self.pool(&[schema, self.shared_schema.as_str()]).await?;
        let target = MigrationTarget::new(
            vec![schema.to_string(), self.shared_schema.clone()],
            TENANT_MIGRATIONS_TABLE,
            self.tenant_migrations.clone(),
        );
        Ok(Box::new(PgMigrationSession::new(pool, target)))
    }
}
