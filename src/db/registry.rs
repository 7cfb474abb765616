use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::db::{quote_ident, tenant, MasterSession};
use crate::error::RegistryError;
use crate::models::tenant::{Tenant, TenantStatus};

/// Upper bound on the stored `error_message`, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

/// What happens to a column when provisioning hits an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Take the value of the row being inserted.
    Incoming,
    /// Set to NULL.
    Reset,
    /// Keep the stored value.
    Preserve,
}

/// Merge rules applied by `upsert_provisioning` on an `external_org_id` conflict.
pub const PROVISIONING_MERGE: &[(&str, OnConflict)] = &[
    ("schema_name", OnConflict::Incoming),
    ("status", OnConflict::Incoming),
    ("started_at", OnConflict::Incoming),
    ("updated_at", OnConflict::Incoming),
    ("activated_at", OnConflict::Reset),
    ("failed_at", OnConflict::Reset),
    ("error_message", OnConflict::Reset),
    ("id", OnConflict::Preserve),
    ("created_at", OnConflict::Preserve),
    ("deleted_at", OnConflict::Preserve),
];

/// Builds the `DO UPDATE SET` list for a set of merge rules.
pub fn merge_assignments(rules: &[(&str, OnConflict)]) -> String {
    rules
        .iter()
        .filter_map(|(column, rule)| match rule {
            OnConflict::Incoming => Some(format!("{column} = EXCLUDED.{column}")),
            OnConflict::Reset => Some(format!("{column} = NULL")),
            OnConflict::Preserve => None,
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cuts an error message down to `MAX_ERROR_MESSAGE_CHARS` characters.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

const TENANT_COLUMNS: &str = "id, external_org_id, schema_name, status, started_at, activated_at, \
     failed_at, error_message, created_at, updated_at, deleted_at";

/// Master registry backed by the `tenants` table of the shared schema.
pub struct PgMasterSession {
    pool: PgPool,
    shared_schema: String,
    table: String,
}

impl PgMasterSession {
    pub fn new(pool: PgPool, shared_schema: &str) -> Self {
        Self {
            pool,
            shared_schema: shared_schema.to_string(),
            table: format!("{}.tenants", quote_ident(shared_schema)),
        }
    }
}

#[async_trait]
impl MasterSession for PgMasterSession {
    async fn upsert_provisioning(&self, org_id: &str, schema_name: &str) -> Result<(), RegistryError> {
        let now = Utc::now();
        sqlx::query(&format!(
            "INSERT INTO {table} (external_org_id, schema_name, status, started_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (external_org_id) DO UPDATE SET {assignments}",
            table = self.table,
            assignments = merge_assignments(PROVISIONING_MERGE),
        ))
        .bind(org_id)
        .bind(schema_name)
        .bind(TenantStatus::Provisioning)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_active(&self, org_id: &str) -> Result<(), RegistryError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = $2, activated_at = $3, updated_at = $3
             WHERE external_org_id = $1",
            self.table
        ))
        .bind(org_id)
        .bind(TenantStatus::Active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::TenantNotFound(org_id.to_string()));
        }
        Ok(())
    }

    async fn mark_failed(&self, org_id: &str, error: &str) -> Result<(), RegistryError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = $2, failed_at = $3, updated_at = $3, error_message = $4
             WHERE external_org_id = $1",
            self.table
        ))
        .bind(org_id)
        .bind(TenantStatus::Failed)
        .bind(Utc::now())
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::TenantNotFound(org_id.to_string()));
        }
        Ok(())
    }

    async fn list_tenant_schemas(&self) -> Result<Vec<String>, RegistryError> {
        let schemas: Vec<String> =
            sqlx::query_scalar(&format!("SELECT schema_name FROM {} ORDER BY id", self.table))
                .fetch_all(&self.pool)
                .await?;
        Ok(schemas)
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, RegistryError> {
        let tenants = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM {} ORDER BY id",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    async fn find_tenant(&self, org_id: &str) -> Result<Option<Tenant>, RegistryError> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM {} WHERE external_org_id = $1",
            self.table
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn ensure_schema(&self, schema: &str) -> Result<(), sqlx::Error> {
        tenant::ensure_schema(&self.pool, schema).await
    }

    async fn ensure_extensions(&self, extensions: &[String]) -> Result<(), sqlx::Error> {
        tenant::ensure_extensions(&self.pool, &self.shared_schema, extensions).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
