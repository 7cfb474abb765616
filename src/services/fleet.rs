use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{error, info};

use crate::db::Connector;
use crate::error::{FleetError, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetAction {
    Migrate,
    Rollback,
}

#[derive(Debug)]
pub struct TenantOutcome {
    pub schema: String,
    /// `(batch, files)` applied or rolled back.
    pub result: Result<(i32, Vec<String>), FleetError>,
}

#[derive(Debug)]
pub struct FleetReport {
    pub action: FleetAction,
    pub outcomes: Vec<TenantOutcome>,
}

impl FleetReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TenantOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Runs the tenant migration runner against every schema in the registry.
/// A failing tenant is logged and reported, the pass continues with the next one.
pub struct Fleet {
    connector: Arc<dyn Connector>,
    concurrency: usize,
    step_timeout: Option<Duration>,
}

impl Fleet {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            concurrency: 1,
            step_timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub async fn migrate_all_tenants(&self) -> Result<FleetReport, RegistryError> {
        self.run(FleetAction::Migrate).await
    }

    pub async fn rollback_all_tenants(&self) -> Result<FleetReport, RegistryError> {
        self.run(FleetAction::Rollback).await
    }

    async fn run(&self, action: FleetAction) -> Result<FleetReport, RegistryError> {
        let master = self.connector.master().await?;
        let schemas = match master.list_tenant_schemas().await {
            Ok(schemas) => schemas,
            Err(e) => {
                master.close().await;
                return Err(e);
            }
        };

        info!("{action:?}: {} tenant schema(s)", schemas.len());
        let outcomes: Vec<TenantOutcome> = stream::iter(schemas)
            .map(|schema| self.run_one(action, schema))
            .buffered(self.concurrency)
            .collect()
            .await;
        master.close().await;

        let report = FleetReport { action, outcomes };
        let failed = report.failed().count();
        if failed > 0 {
            error!(
                "{action:?} finished: {} succeeded, {failed} failed",
                report.succeeded()
            );
        } else {
            info!("{action:?} finished: {} succeeded", report.succeeded());
        }
        Ok(report)
    }

    async fn run_one(&self, action: FleetAction, schema: String) -> TenantOutcome {
        match action {
            FleetAction::Migrate => info!("Migrating tenant: {schema}"),
            FleetAction::Rollback => info!("Rolling back tenant schema: {schema}"),
        }

        let result = match self.step_timeout {
            Some(limit) => tokio::time::timeout(limit, self.apply(action, &schema))
                .await
                .unwrap_or(Err(FleetError::Timeout(limit))),
            None => self.apply(action, &schema).await,
        };

        match (&result, action) {
            (Ok((_, files)), FleetAction::Migrate) if files.is_empty() => {
                info!("Tenant {schema} schema up-to-date")
            }
            (Ok((batch, files)), FleetAction::Migrate) => {
                info!("Tenant {schema} migrated to batch {batch}: {files:?}")
            }
            (Ok((_, files)), FleetAction::Rollback) if files.is_empty() => {
                info!("No migrations to roll back for {schema}")
            }
            (Ok((batch, files)), FleetAction::Rollback) => {
                info!("Rolled back batch {batch} for {schema}: {files:?}")
            }
            (Err(e), _) => error!("Tenant {schema} failed: {e}"),
        }

        TenantOutcome { schema, result }
    }

    async fn apply(&self, action: FleetAction, schema: &str) -> Result<(i32, Vec<String>), FleetError> {
        let session = self.connector.tenant(schema).await.map_err(FleetError::Connect)?;
        let result = match action {
            FleetAction::Migrate => session.apply_latest().await,
            FleetAction::Rollback => session.rollback_last_batch().await,
        };
        session.close().await;
        Ok(result?)
    }
}
