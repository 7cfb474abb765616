/// Tenant schema control plane.
///
/// Usage:
///   tenantctl provision <ORG_ID>
///   tenantctl migrate-master [--dry]
///   tenantctl rollback-master
///   tenantctl migrate-all-tenants
///   tenantctl rollback-all-tenants
///   tenantctl tenants [--json]
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tenantctl::config::Config;
use tenantctl::db::{Connector, PgConnector};
use tenantctl::error::ProvisionError;
use tenantctl::services::fleet::Fleet;
use tenantctl::services::master;
use tenantctl::services::provisioner::Provisioner;

#[derive(Parser)]
#[command(name = "tenantctl", about = "Provision and migrate per-tenant PostgreSQL schemas")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create, migrate and register the schema of one tenant
    Provision {
        /// External organization id of the tenant
        org_id: String,
    },
    /// Apply pending migrations to the shared schema
    MigrateMaster {
        /// Only list the migrations that would run
        #[arg(long)]
        dry: bool,
    },
    /// Revert the last batch of shared-schema migrations
    RollbackMaster,
    /// Bring every registered tenant schema up to date
    MigrateAllTenants,
    /// Revert the last migration batch of every registered tenant schema
    RollbackAllTenants,
    /// Print the tenant registry
    Tenants {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let connector: Arc<dyn Connector> = Arc::new(PgConnector::from_config(&config)?);

    match args.command {
        Command::Provision { org_id } => {
            let provisioner = Provisioner::new(connector.clone(), config.tenant_extensions.clone());
            let result = provisioner.provision_tenant(&org_id).await;
            if !matches!(result, Err(ProvisionError::InvalidArgument(_))) {
                match provisioner.tenant_state(&org_id).await {
                    Ok(Some(t)) => info!(
                        "Tenant [{}] is {} in {}{}",
                        t.external_org_id,
                        t.status,
                        t.schema_name,
                        t.error_message.map(|e| format!(": {e}")).unwrap_or_default()
                    ),
                    Ok(None) => warn!("Tenant [{org_id}] has no registry row"),
                    Err(e) => warn!("Could not read registry row of tenant [{org_id}]: {e}"),
                }
            }
            let outcome = result?;
            info!(
                "Tenant [{}] provisioned in {} (batch {})",
                outcome.org_id, outcome.schema_name, outcome.batch
            );
        }
        Command::MigrateMaster { dry } => {
            master::migrate_master(connector.as_ref(), dry).await?;
        }
        Command::RollbackMaster => {
            master::rollback_master(connector.as_ref()).await?;
        }
        Command::MigrateAllTenants => {
            fleet(connector, &config).migrate_all_tenants().await?;
        }
        Command::RollbackAllTenants => {
            fleet(connector, &config).rollback_all_tenants().await?;
        }
        Command::Tenants { json } => {
            let session = connector.master().await?;
            let tenants = session.list_tenants().await;
            session.close().await;
            let tenants = tenants?;

            if json {
                println!("{}", serde_json::to_string_pretty(&tenants)?);
            } else {
                for t in &tenants {
                    println!(
                        "{:<6} {:<40} {:<16} {:<13} {}",
                        t.id,
                        t.external_org_id,
                        t.schema_name,
                        t.status,
                        t.error_message.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}

fn fleet(connector: Arc<dyn Connector>, config: &Config) -> Fleet {
    Fleet::new(connector)
        .with_concurrency(config.fleet_concurrency)
        .with_step_timeout(config.tenant_step_timeout_secs.map(Duration::from_secs))
}
