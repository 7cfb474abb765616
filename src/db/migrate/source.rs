use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One versioned migration, loaded from `<version>_<name>.up.sql` and an optional
/// `<version>_<name>.down.sql`.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
    /// Hex SHA-256 of the up script.
    pub checksum: String,
}

impl Migration {
    pub fn new(version: i64, name: &str, up: &str, down: Option<&str>) -> Self {
        Self {
            version,
            name: name.to_string(),
            up: up.to_string(),
            down: down.map(str::to_string),
            checksum: checksum(up),
        }
    }

    /// `<version>_<name>`, the label reported for applied and rolled back files.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Splits a migration file name into version, name and direction.
/// Returns `Ok(None)` for files that are not SQL.
pub fn parse_file_name(file: &str) -> Result<Option<(i64, &str, Direction)>, String> {
    if !file.ends_with(".sql") {
        return Ok(None);
    }

    let (stem, direction) = if let Some(stem) = file.strip_suffix(".up.sql") {
        (stem, Direction::Up)
    } else if let Some(stem) = file.strip_suffix(".down.sql") {
        (stem, Direction::Down)
    } else {
        return Err(format!("{file}: expected a .up.sql or .down.sql suffix"));
    };

    let (version, name) = stem
        .split_once('_')
        .ok_or_else(|| format!("{file}: expected <version>_<name>"))?;
    let version: i64 = version
        .parse()
        .map_err(|_| format!("{file}: version {version:?} is not a number"))?;
    if version <= 0 {
        return Err(format!("{file}: version must be positive"));
    }
    if name.is_empty() {
        return Err(format!("{file}: migration name is empty"));
    }

    Ok(Some((version, name, direction)))
}

#[derive(Default)]
struct Scripts {
    name: String,
    up: Option<String>,
    down: Option<String>,
}

/// Ordered set of migrations for one scope.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    dir: PathBuf,
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(dir: impl Into<PathBuf>, mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self {
            dir: dir.into(),
            migrations,
        }
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref();
        let load_err = |reason: String| MigrationError::Load {
            path: dir.display().to_string(),
            reason,
        };

        let entries = std::fs::read_dir(dir).map_err(|e| load_err(e.to_string()))?;
        let mut scripts: BTreeMap<i64, Scripts> = BTreeMap::new();

        for entry in entries {
            let entry = entry.map_err(|e| load_err(e.to_string()))?;
            if !entry.file_type().map_err(|e| load_err(e.to_string()))?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((version, name, direction)) = parse_file_name(file_name).map_err(load_err)?
            else {
                continue;
            };

            let sql = std::fs::read_to_string(entry.path()).map_err(|e| load_err(e.to_string()))?;
            let slot = scripts.entry(version).or_default();
            if slot.name.is_empty() {
                slot.name = name.to_string();
            } else if slot.name != name {
                return Err(load_err(format!(
                    "version {version} is used by both {} and {name}",
                    slot.name
                )));
            }

            let target = match direction {
                Direction::Up => &mut slot.up,
                Direction::Down => &mut slot.down,
            };
            if target.is_some() {
                return Err(load_err(format!("duplicate script for {file_name}")));
            }
            *target = Some(sql);
        }

        let mut migrations = Vec::with_capacity(scripts.len());
        for (version, scripts) in scripts {
            let up = scripts.up.ok_or_else(|| {
                load_err(format!("{version}_{} has no up script", scripts.name))
            })?;
            migrations.push(Migration::new(version, &scripts.name, &up, scripts.down.as_deref()));
        }

        Ok(Self::new(dir, migrations))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.migrations[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }
}
