use crate::errors::{AppError, AppResult};
use crate::models::{ConfigDocument, DatabaseDeclaration, MonitorConfig, WatchSpec};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;
pub const MIN_ACTIVITY_TIMEOUT_MINUTES: u64 = 1;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_ACTIVITY_TIMEOUT_MINUTES: u64 = 60;

const CONFIG_FILE_NAME: &str = "config.json";
const BACKUP_DIR_NAME: &str = "backups";
const BACKUP_PREFIX: &str = "config-";
const MAX_BACKUPS: usize = 10;
const HOME_ENV: &str = "SQLITE_MONITOR_HOME";

pub trait ConfigSource: Send + Sync {
    fn config_dir(&self) -> PathBuf;
    /// Never fails; anything unreadable degrades to defaults.
    fn load(&self) -> MonitorConfig;
    fn load_document(&self) -> ConfigDocument;
    fn save(&self, document: &ConfigDocument) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> AppResult<Self> {
        if let Ok(explicit) = std::env::var(HOME_ENV) {
            if !explicit.trim().is_empty() {
                return Ok(Self::new(explicit));
            }
        }
        match home_dir() {
            Some(home) => Ok(Self::new(home.join(".sqlite-monitor"))),
            None => Err(AppError::Config(
                "Unable to determine a configuration directory".to_string(),
            )),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR_NAME)
    }

    fn write_backup(&self) -> AppResult<()> {
        let current = self.config_path();
        if !current.is_file() {
            return Ok(());
        }
        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let target = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}.json"));
        fs::copy(&current, &target)?;
        self.prune_backups()
    }

    fn prune_backups(&self) -> AppResult<()> {
        let mut backups = fs::read_dir(self.backup_dir())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        if backups.len() <= MAX_BACKUPS {
            return Ok(());
        }
        // Timestamped names sort chronologically.
        backups.sort();
        let excess = backups.len() - MAX_BACKUPS;
        for stale in backups.into_iter().take(excess) {
            if let Err(error) = fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %error, "failed to prune config backup");
            }
        }
        Ok(())
    }
}

impl ConfigSource for ConfigStore {
    fn config_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn load(&self) -> MonitorConfig {
        normalize(&self.load_document(), home_dir().as_deref())
    }

    fn load_document(&self) -> ConfigDocument {
        let path = self.config_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return ConfigDocument::default(),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read config; using defaults");
                return ConfigDocument::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "malformed config; using defaults");
                ConfigDocument::default()
            }
        }
    }

    fn save(&self, document: &ConfigDocument) -> AppResult<()> {
        fs::create_dir_all(&self.root)?;
        self.write_backup()?;
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|error| AppError::Internal(error.to_string()))?;
        let temp = self.root.join(format!(".{CONFIG_FILE_NAME}.tmp"));
        fs::write(&temp, bytes)?;
        fs::rename(&temp, self.config_path())?;
        Ok(())
    }
}

/// Applies floors, path filtering and duplicate merging to a raw document.
pub fn normalize(document: &ConfigDocument, home: Option<&Path>) -> MonitorConfig {
    let refresh_interval_secs = document
        .refresh_interval
        .map(|value| clamp_floor(value, MIN_REFRESH_INTERVAL_SECS))
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    let activity_timeout_minutes = document
        .activity_timeout
        .map(|value| clamp_floor(value, MIN_ACTIVITY_TIMEOUT_MINUTES))
        .unwrap_or(DEFAULT_ACTIVITY_TIMEOUT_MINUTES);

    let mut databases: Vec<DatabaseDeclaration> = Vec::new();
    let mut index_by_path: HashMap<PathBuf, usize> = HashMap::new();

    for raw in &document.databases {
        let expanded = expand_tilde(raw.path.trim(), home);
        if !expanded.is_absolute() {
            tracing::debug!(path = %raw.path, "skipping non-absolute database path");
            continue;
        }
        let path = canonical_identity(&expanded);
        let name = resolve_name(raw.name.as_deref(), &path);
        let group = raw
            .group
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        let watches = raw.watches.as_deref().map(|specs| sanitize_watches(specs, &name));

        match index_by_path.get(&path) {
            Some(&index) => {
                let existing = &mut databases[index];
                existing.name = name;
                existing.group = group;
                if let Some(watches) = watches {
                    existing.watches = watches;
                }
            }
            None => {
                index_by_path.insert(path.clone(), databases.len());
                databases.push(DatabaseDeclaration {
                    path,
                    name,
                    group,
                    watches: watches.unwrap_or_default(),
                });
            }
        }
    }

    MonitorConfig {
        refresh_interval_secs,
        activity_timeout_minutes,
        databases,
    }
}

fn clamp_floor(value: i64, floor: u64) -> u64 {
    u64::try_from(value).unwrap_or(0).max(floor)
}

fn resolve_name(raw: Option<&str>, path: &Path) -> String {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| path.display().to_string())
}

fn sanitize_watches(specs: &[WatchSpec], database: &str) -> Vec<WatchSpec> {
    let mut kept: Vec<WatchSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = spec.name.trim();
        let query = spec.query.trim();
        if name.is_empty() || query.is_empty() {
            tracing::warn!(database = %database, watch = %spec.name, "dropping watch with empty name or query");
            continue;
        }
        let mut cleaned = spec.clone();
        cleaned.name = name.to_string();
        cleaned.query = query.to_string();
        match kept.iter_mut().find(|existing| existing.name == cleaned.name) {
            Some(existing) => *existing = cleaned,
            None => kept.push(cleaned),
        }
    }
    kept
}

pub fn expand_tilde(raw: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(raw);
    };
    if raw == "~" {
        return home.to_path_buf();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(raw),
    }
}

/// Canonical identity for a database file. Missing files still get a stable
/// identity through their (usually existing) parent directory.
pub fn canonical_identity(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

pub fn home_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        if let Ok(home) = std::env::var("HOME") {
            return Some(PathBuf::from(home));
        }
    }

    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            return Some(PathBuf::from(home));
        }
    }

    None
}
