use tracing::info;

use crate::db::Connector;
use crate::error::MigrationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterRun {
    /// Nothing was applied; these migrations would run.
    DryRun { pending: Vec<String> },
    Applied { batch: i32, files: Vec<String> },
}

/// Runs the shared-schema migrations.
pub async fn migrate_master(connector: &dyn Connector, dry_run: bool) -> Result<MasterRun, MigrationError> {
    let session = connector.master_migrations().await?;
    info!("Running master migrations ({} schema)...", session.schema());

    let result = if dry_run {
        session.pending().await.map(|pending| MasterRun::DryRun { pending })
    } else {
        session
            .apply_latest()
            .await
            .map(|(batch, files)| MasterRun::Applied { batch, files })
    };
    session.close().await;

    match &result {
        Ok(MasterRun::DryRun { pending }) if pending.is_empty() => {
            info!("Dry run: master schema is up-to-date")
        }
        Ok(MasterRun::DryRun { pending }) => {
            info!("Dry run: {} pending master migration(s)", pending.len());
            for file in pending {
                info!("   - {file}");
            }
        }
        Ok(MasterRun::Applied { files, .. }) if files.is_empty() => {
            info!("Master migrations finished. No new migrations.")
        }
        Ok(MasterRun::Applied { batch, files }) => {
            info!("Master migrations finished. Batch {batch} applied:");
            for file in files {
                info!("   - {file}");
            }
        }
        Err(_) => {}
    }
    result
}

/// Reverts the last batch of shared-schema migrations.
pub async fn rollback_master(connector: &dyn Connector) -> Result<(i32, Vec<String>), MigrationError> {
    let session = connector.master_migrations().await?;
    info!("Rolling back last master migration batch...");
    let result = session.rollback_last_batch().await;
    session.close().await;

    if let Ok((batch, files)) = &result {
        if files.is_empty() {
            info!("Nothing to roll back for master schema");
        } else {
            info!("Rolled back batch {batch}: {files:?}");
        }
    }
    result
}
