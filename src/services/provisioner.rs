use std::sync::Arc;

use tracing::{error, info, warn};

use crate::db::tenant::schema_name;
use crate::db::{Connector, MasterSession, MigrationSession};
use crate::error::{MigrationError, ProvisionError, RegistryError, RollbackError};
use crate::models::tenant::Tenant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub org_id: String,
    pub schema_name: String,
    pub batch: i32,
    pub applied: Vec<String>,
}

/// Creates, migrates and tracks one tenant schema.
pub struct Provisioner {
    connector: Arc<dyn Connector>,
    extensions: Vec<String>,
}

impl Provisioner {
    pub fn new(connector: Arc<dyn Connector>, extensions: Vec<String>) -> Self {
        Self { connector, extensions }
    }

    /// PROVISIONING → ACTIVE, or FAILED with the migration error recorded.
    pub async fn provision_tenant(&self, org_id: &str) -> Result<ProvisionOutcome, ProvisionError> {
        let schema = schema_name(org_id)?;

        let master = self.connector.master().await?;
        let result = self.provision_with(master.as_ref(), org_id, &schema).await;
        master.close().await;
        result
    }

    /// Registry row of `org_id` as it stands now, for reporting after a run.
    pub async fn tenant_state(&self, org_id: &str) -> Result<Option<Tenant>, RegistryError> {
        let master = self.connector.master().await?;
        let tenant = master.find_tenant(org_id).await;
        master.close().await;
        tenant
    }

    async fn provision_with(
        &self,
        master: &dyn MasterSession,
        org_id: &str,
        schema: &str,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        master.upsert_provisioning(org_id, schema).await?;
        info!("Tenant [{org_id}] -> PROVISIONING ({schema})");

        let schema_error = |source: sqlx::Error| ProvisionError::SchemaCreation {
            schema: schema.to_string(),
            source,
        };
        master.ensure_schema(schema).await.map_err(schema_error)?;
        master
            .ensure_extensions(&self.extensions)
            .await
            .map_err(schema_error)?;

        let tenant = match self.connector.tenant(schema).await {
            Ok(tenant) => tenant,
            Err(err) => {
                self.record_failure(master, org_id, schema, &err).await;
                return Err(ProvisionError::Migration {
                    schema: schema.to_string(),
                    source: err,
                });
            }
        };
        let result = self.migrate(master, tenant.as_ref(), org_id, schema).await;
        tenant.close().await;
        result
    }

    async fn migrate(
        &self,
        master: &dyn MasterSession,
        tenant: &dyn MigrationSession,
        org_id: &str,
        schema: &str,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        match tenant.apply_latest().await {
            Ok((batch, applied)) => {
                master.mark_active(org_id).await?;
                info!(
                    "Tenant [{org_id}] -> ACTIVE ({schema}, batch {batch}, {} new migrations)",
                    applied.len()
                );
                Ok(ProvisionOutcome {
                    org_id: org_id.to_string(),
                    schema_name: schema.to_string(),
                    batch,
                    applied,
                })
            }
            Err(err) => {
                error!("Migration failed for {schema}: {err}");
                self.record_failure(master, org_id, schema, &err).await;
                compensate(tenant, schema, &err).await;
                Err(ProvisionError::Migration {
                    schema: schema.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn record_failure(
        &self,
        master: &dyn MasterSession,
        org_id: &str,
        schema: &str,
        err: &MigrationError,
    ) {
        match master.mark_failed(org_id, &err.to_string()).await {
            Ok(()) => info!("Tenant [{org_id}] -> FAILED ({schema})"),
            Err(e) => error!("Could not record FAILED for tenant [{org_id}]: {e}"),
        }
    }
}

/// Best-effort rollback of the batch a failed migration left behind. Never fails.
async fn compensate(tenant: &dyn MigrationSession, schema: &str, err: &MigrationError) {
    let Some(batch) = err.partial_batch() else {
        info!("Nothing partially applied in {schema}, skipping rollback");
        return;
    };

    match tenant.rollback_last_batch().await {
        Ok((rolled_back, files)) => {
            if rolled_back != batch {
                warn!("Rolled back batch {rolled_back} of {schema}, expected batch {batch}");
            }
            info!("Rolled back batch {rolled_back} of {schema}: {files:?}");
        }
        Err(source) => {
            let err = RollbackError {
                schema: schema.to_string(),
                source,
            };
            warn!("{err}");
        }
    }
}
