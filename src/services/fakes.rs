//! In-memory stand-ins for the registry, DDL and migration runner.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::db::registry::truncate_error;
use crate::db::{Connector, MasterSession, MigrationSession};
use crate::error::{MigrationError, RegistryError};
use crate::models::tenant::{Tenant, TenantStatus};

pub const TENANT_FILES: &[&str] = &[
    "20251103135720_tenant_init_db",
    "20251103164707_create_org_users_table",
    "20251103165706_create_org_settings_table",
];

pub const MASTER_FILES: &[&str] = &["20251103123228_init_db", "20251103165722_create_categories_table"];

/// Fail the migration at index `commit_first` of the pending list.
#[derive(Debug, Clone)]
pub struct FailPlan {
    pub commit_first: usize,
    pub message: String,
}

impl FailPlan {
    pub fn after(commit_first: usize, message: &str) -> Self {
        Self {
            commit_first,
            message: message.to_string(),
        }
    }
}

#[derive(Default)]
struct State {
    next_id: i32,
    tenants: Vec<Tenant>,
    history: HashMap<String, Vec<TenantStatus>>,
    schemas: HashSet<String>,
    files: HashMap<String, Vec<String>>,
    applied: HashMap<String, Vec<(i32, String)>>,
    fail_migration: HashMap<String, FailPlan>,
    fail_rollback: HashSet<String>,
    fail_connect: HashSet<String>,
    fail_extensions: Option<String>,
    hang: HashSet<String>,
    events: Vec<String>,
    open: usize,
}

/// Key under which the master scope's migrations are tracked.
const MASTER_SCOPE: &str = "public";

pub struct FakeDb {
    state: Mutex<State>,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        let mut state = State::default();
        state.schemas.insert(MASTER_SCOPE.to_string());
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector(self.clone()))
    }

    /// Registers an ACTIVE tenant whose schema exists but has no migrations applied.
    pub fn seed_tenant(&self, org_id: &str, schema: &str) {
        let mut state = self.state();
        state.next_id += 1;
        let now = Utc::now();
        let tenant = Tenant {
            id: state.next_id,
            external_org_id: org_id.to_string(),
            schema_name: schema.to_string(),
            status: TenantStatus::Active,
            started_at: Some(now),
            activated_at: Some(now),
            failed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        state.tenants.push(tenant);
        state.schemas.insert(schema.to_string());
    }

    pub fn add_tenant_file(&self, file: &str) {
        self.state()
            .files
            .entry("tenant".into())
            .or_insert_with(|| TENANT_FILES.iter().map(|f| f.to_string()).collect())
            .push(file.to_string());
    }

    pub fn fail_migration(&self, schema: &str, plan: FailPlan) {
        self.state().fail_migration.insert(schema.to_string(), plan);
    }

    pub fn fail_rollback(&self, schema: &str) {
        self.state().fail_rollback.insert(schema.to_string());
    }

    pub fn fail_connect(&self, schema: &str) {
        self.state().fail_connect.insert(schema.to_string());
    }

    /// Makes `apply_latest` on `schema` never complete.
    pub fn hang(&self, schema: &str) {
        self.state().hang.insert(schema.to_string());
    }

    /// Sessions opened and not yet released, by `close()` or by drop.
    pub fn open_sessions(&self) -> usize {
        self.state().open
    }

    fn release(&self, closed: &AtomicBool) {
        if !closed.swap(true, Ordering::SeqCst) {
            self.state().open -= 1;
        }
    }

    pub fn fail_extensions(&self, message: &str) {
        self.state().fail_extensions = Some(message.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        self.state().tenants.clone()
    }

    pub fn tenant(&self, org_id: &str) -> Option<Tenant> {
        self.state()
            .tenants
            .iter()
            .find(|t| t.external_org_id == org_id)
            .cloned()
    }

    pub fn status_history(&self, org_id: &str) -> Vec<TenantStatus> {
        self.state().history.get(org_id).cloned().unwrap_or_default()
    }

    pub fn schema_exists(&self, schema: &str) -> bool {
        self.state().schemas.contains(schema)
    }

    pub fn applied(&self, schema: &str) -> Vec<String> {
        self.state()
            .applied
            .get(schema)
            .map(|records| records.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }

    fn set_status<'a>(state: &'a mut State, org_id: &str, status: TenantStatus) -> Result<&'a mut Tenant, RegistryError> {
        state
            .history
            .entry(org_id.to_string())
            .or_default()
            .push(status);
        let tenant = state
            .tenants
            .iter_mut()
            .find(|t| t.external_org_id == org_id)
            .ok_or_else(|| RegistryError::TenantNotFound(org_id.to_string()))?;
        tenant.status = status;
        tenant.updated_at = Utc::now();
        Ok(tenant)
    }
}

struct FakeConnector(Arc<FakeDb>);

#[async_trait]
impl Connector for FakeConnector {
    async fn master(&self) -> Result<Box<dyn MasterSession>, RegistryError> {
        self.0.state().open += 1;
        Ok(Box::new(FakeMaster {
            db: self.0.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn master_migrations(&self) -> Result<Box<dyn MigrationSession>, MigrationError> {
        self.0.state().open += 1;
        Ok(Box::new(FakeMigrations {
            db: self.0.clone(),
            schema: MASTER_SCOPE.to_string(),
            scope: "master",
            closed: AtomicBool::new(false),
        }))
    }

    async fn tenant(&self, schema: &str) -> Result<Box<dyn MigrationSession>, MigrationError> {
        let mut state = self.0.state();
        if state.fail_connect.contains(schema) {
            return Err(MigrationError::Database(sqlx::Error::Protocol(
                "connection refused".into(),
            )));
        }
        state.open += 1;
        Ok(Box::new(FakeMigrations {
            db: self.0.clone(),
            schema: schema.to_string(),
            scope: "tenant",
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeMaster {
    db: Arc<FakeDb>,
    closed: AtomicBool,
}

impl Drop for FakeMaster {
    fn drop(&mut self) {
        self.db.release(&self.closed);
    }
}

#[async_trait]
impl MasterSession for FakeMaster {
    async fn upsert_provisioning(&self, org_id: &str, schema_name: &str) -> Result<(), RegistryError> {
        let mut state = self.db.state();
        state.events.push(format!("upsert:{org_id}"));
        let now = Utc::now();

        if !state.tenants.iter().any(|t| t.external_org_id == org_id) {
            state.next_id += 1;
            let id = state.next_id;
            state.tenants.push(Tenant {
                id,
                external_org_id: org_id.to_string(),
                schema_name: schema_name.to_string(),
                status: TenantStatus::Provisioning,
                started_at: None,
                activated_at: None,
                failed_at: None,
                error_message: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            });
        }

        let tenant = FakeDb::set_status(&mut state, org_id, TenantStatus::Provisioning)?;
        tenant.schema_name = schema_name.to_string();
        tenant.started_at = Some(now);
        tenant.activated_at = None;
        tenant.failed_at = None;
        tenant.error_message = None;
        Ok(())
    }

    async fn mark_active(&self, org_id: &str) -> Result<(), RegistryError> {
        let mut state = self.db.state();
        state.events.push(format!("mark_active:{org_id}"));
        let tenant = FakeDb::set_status(&mut state, org_id, TenantStatus::Active)?;
        tenant.activated_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, org_id: &str, error: &str) -> Result<(), RegistryError> {
        let mut state = self.db.state();
        state.events.push(format!("mark_failed:{org_id}"));
        let tenant = FakeDb::set_status(&mut state, org_id, TenantStatus::Failed)?;
        tenant.failed_at = Some(Utc::now());
        tenant.error_message = Some(truncate_error(error));
        Ok(())
    }

    async fn list_tenant_schemas(&self) -> Result<Vec<String>, RegistryError> {
        let mut state = self.db.state();
        state.events.push("list_tenant_schemas".into());
        Ok(state.tenants.iter().map(|t| t.schema_name.clone()).collect())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, RegistryError> {
        Ok(self.db.tenants())
    }

    async fn find_tenant(&self, org_id: &str) -> Result<Option<Tenant>, RegistryError> {
        Ok(self.db.tenant(org_id))
    }

    async fn ensure_schema(&self, schema: &str) -> Result<(), sqlx::Error> {
        let mut state = self.db.state();
        state.events.push(format!("ensure_schema:{schema}"));
        state.schemas.insert(schema.to_string());
        Ok(())
    }

    async fn ensure_extensions(&self, extensions: &[String]) -> Result<(), sqlx::Error> {
        let mut state = self.db.state();
        state.events.push(format!("ensure_extensions:{}", extensions.join(",")));
        match &state.fail_extensions {
            Some(message) => Err(sqlx::Error::Protocol(message.clone())),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.db.release(&self.closed);
    }
}

struct FakeMigrations {
    db: Arc<FakeDb>,
    schema: String,
    scope: &'static str,
    closed: AtomicBool,
}

impl Drop for FakeMigrations {
    fn drop(&mut self) {
        self.db.release(&self.closed);
    }
}

impl FakeMigrations {
    fn files(&self, state: &State) -> Vec<String> {
        if let Some(files) = state.files.get(self.scope) {
            return files.clone();
        }
        let defaults = if self.scope == "master" { MASTER_FILES } else { TENANT_FILES };
        defaults.iter().map(|f| f.to_string()).collect()
    }
}

#[async_trait]
impl MigrationSession for FakeMigrations {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn apply_latest(&self) -> Result<(i32, Vec<String>), MigrationError> {
        let hang = {
            let mut state = self.db.state();
            state.events.push(format!("apply_latest:{}", self.schema));
            state.hang.contains(&self.schema)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.db.state();
        if !state.schemas.contains(&self.schema) {
            return Err(MigrationError::Database(sqlx::Error::Protocol(format!(
                "schema \"{}\" does not exist",
                self.schema
            ))));
        }

        let files = self.files(&state);
        let plan = state.fail_migration.get(&self.schema).cloned();
        let records = state.applied.entry(self.schema.clone()).or_default();
        let current = records.iter().map(|(batch, _)| *batch).max().unwrap_or(0);
        let pending: Vec<String> = files
            .into_iter()
            .filter(|f| !records.iter().any(|(_, done)| done == f))
            .collect();
        if pending.is_empty() {
            return Ok((current, Vec::new()));
        }

        let batch = current + 1;
        let mut done = Vec::new();
        for (index, file) in pending.into_iter().enumerate() {
            if let Some(plan) = plan.as_ref().filter(|p| p.commit_first == index) {
                return Err(MigrationError::Failed {
                    batch,
                    applied: done,
                    name: file,
                    source: sqlx::Error::Protocol(plan.message.clone()),
                });
            }
            records.push((batch, file.clone()));
            done.push(file);
        }
        Ok((batch, done))
    }

    async fn rollback_last_batch(&self) -> Result<(i32, Vec<String>), MigrationError> {
        let mut state = self.db.state();
        state.events.push(format!("rollback_last_batch:{}", self.schema));
        if state.fail_rollback.contains(&self.schema) {
            return Err(MigrationError::Database(sqlx::Error::Protocol(
                "could not roll back".into(),
            )));
        }

        let records = state.applied.entry(self.schema.clone()).or_default();
        let Some(batch) = records.iter().map(|(batch, _)| *batch).max() else {
            return Ok((0, Vec::new()));
        };
        let mut reverted: Vec<String> = records
            .iter()
            .filter(|(b, _)| *b == batch)
            .map(|(_, f)| f.clone())
            .collect();
        reverted.reverse();
        records.retain(|(b, _)| *b != batch);
        Ok((batch, reverted))
    }

    async fn pending(&self) -> Result<Vec<String>, MigrationError> {
        let state = self.db.state();
        let files = self.files(&state);
        let applied = state.applied.get(&self.schema).cloned().unwrap_or_default();
        Ok(files
            .into_iter()
            .filter(|f| !applied.iter().any(|(_, done)| done == f))
            .collect())
    }

    async fn close(&self) {
        self.db.release(&self.closed);
    }
}
