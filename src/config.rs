use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub shared_schema: String,
    pub migrations_dir: PathBuf,
    pub tenant_extensions: Vec<String>,
    /// Size of each scoped pool (one per master or tenant session).
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub fleet_concurrency: usize,
    pub tenant_step_timeout_secs: Option<u64>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| var(key).filter(|s| !s.trim().is_empty());

        Ok(Self {
            database_url: var("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("Missing required env var: DATABASE_URL"))?,
            shared_schema: var("SHARED_SCHEMA").unwrap_or_else(|| "public".into()),
            migrations_dir: var("MIGRATIONS_DIR")
                .unwrap_or_else(|| "./migrations".into())
                .into(),
            tenant_extensions: parse_list(&var("TENANT_EXTENSIONS").unwrap_or_else(|| "vector".into())),
            max_connections: var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|| "2".into())
                .parse()?,
            acquire_timeout_secs: var("DB_ACQUIRE_TIMEOUT_SECS")
                .unwrap_or_else(|| "10".into())
                .parse()?,
            fleet_concurrency: match var("FLEET_CONCURRENCY") {
                Some(v) => v.parse::<usize>()?.max(1),
                None => 1,
            },
            tenant_step_timeout_secs: var("TENANT_STEP_TIMEOUT_SECS")
                .map(|v| v.parse())
                .transpose()?,
        })
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
