use md5::{Digest, Md5};
use sqlx::PgPool;

use crate::db::quote_ident;
use crate::error::ProvisionError;

pub const SCHEMA_PREFIX: &str = "tid_";
pub const SCHEMA_HASH_LEN: usize = 10;
/// Width of `tenants.external_org_id`.
pub const MAX_ORG_ID_LEN: usize = 100;

/// SQLSTATE duplicate_object, raised when an extension already exists.
const DUPLICATE_OBJECT: &str = "42710";
/// SQLSTATE unique_violation, raised when two sessions create the same catalog entry.
const UNIQUE_VIOLATION: &str = "23505";

pub fn validate_org_id(org_id: &str) -> Result<(), ProvisionError> {
    if org_id.trim().is_empty() {
        return Err(ProvisionError::InvalidArgument("org id is required".into()));
    }
    if org_id.trim() != org_id {
        return Err(ProvisionError::InvalidArgument(format!(
            "org id {org_id:?} has leading or trailing whitespace"
        )));
    }
    if org_id.chars().any(char::is_control) {
        return Err(ProvisionError::InvalidArgument(format!(
            "org id {org_id:?} contains control characters"
        )));
    }
    if org_id.chars().count() > MAX_ORG_ID_LEN {
        return Err(ProvisionError::InvalidArgument(format!(
            "org id is longer than {MAX_ORG_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Returns the PostgreSQL schema name for a given external org id:
/// `tid_` followed by the first 10 hex characters of its MD5 digest.
pub fn schema_name(org_id: &str) -> Result<String, ProvisionError> {
    validate_org_id(org_id)?;
    let digest = hex::encode(Md5::digest(org_id.as_bytes()));
    Ok(format!("{SCHEMA_PREFIX}{}", &digest[..SCHEMA_HASH_LEN]))
}

fn is_already_exists(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == DUPLICATE_OBJECT || code == UNIQUE_VIOLATION)
}

pub async fn ensure_schema(pool: &PgPool, schema: &str) -> Result<(), sqlx::Error> {
    let result = sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
        .execute(pool)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            tracing::debug!("Schema {schema} was created concurrently");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Makes sure each extension is installed in the shared schema.
pub async fn ensure_extensions(
    pool: &PgPool,
    shared_schema: &str,
    extensions: &[String],
) -> Result<(), sqlx::Error> {
    for extension in extensions {
        let installed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = $1)",
        )
        .bind(extension)
        .fetch_one(pool)
        .await?;

        if installed {
            continue;
        }

        let result = sqlx::raw_sql(&format!(
            "CREATE EXTENSION IF NOT EXISTS {} WITH SCHEMA {}",
            quote_ident(extension),
            quote_ident(shared_schema)
        ))
        .execute(pool)
        .await;

        match result {
            Ok(_) => tracing::info!("Installed extension {extension} in {shared_schema}"),
            Err(e) if is_already_exists(&e) => {
                tracing::debug!("Extension {extension} was installed concurrently");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
