use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub issues: Vec<String>,
}

impl HealthVerdict {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            issues: vec![message.into()],
        }
    }

    /// First issue, which is what the menu shows next to the status dot.
    pub fn message(&self) -> Option<&str> {
        self.issues.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub row_count: Option<i64>,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralSnapshot {
    pub tables: Vec<TableInfo>,
    pub file_size: u64,
    pub wal_size: u64,
    pub shm_size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub journal_mode: String,
    pub page_size: i64,
    pub page_count: i64,
    pub freelist_count: i64,
    pub encoding: String,
    pub user_version: i64,
    pub sqlite_version: String,
    pub integrity: String,
}

impl StructuralSnapshot {
    pub fn row_counts(&self) -> BTreeMap<String, i64> {
        self.tables
            .iter()
            .filter_map(|table| table.row_count.map(|count| (table.name.clone(), count)))
            .collect()
    }

    pub fn total_rows(&self) -> i64 {
        self.tables.iter().filter_map(|table| table.row_count).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchFormat {
    #[default]
    Number,
    Bytes,
    Percent,
    Raw,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_above: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_below: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_above: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_below: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<WatchFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertState {
    Normal,
    Warning,
    Critical,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResult {
    pub name: String,
    pub query: String,
    pub value: Option<String>,
    pub numeric_value: Option<f64>,
    pub formatted_value: String,
    pub state: AlertState,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDelta {
    pub table: String,
    pub previous: i64,
    pub current: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEntry {
    pub path: PathBuf,
    pub name: String,
    pub group: Option<String>,
    /// Always true in published snapshots: only configured databases become entries.
    /// Discovered files are offered through `Engine::discover_databases` until added.
    pub registered: bool,
    pub order: usize,
    pub snapshot: Option<StructuralSnapshot>,
    pub health: Option<HealthVerdict>,
    pub last_checked: Option<DateTime<Utc>>,
    pub previous_row_counts: BTreeMap<String, i64>,
    pub recent_changes: Vec<TableDelta>,
    pub watch_results: Vec<WatchResult>,
    pub quiet: bool,
}

impl DatabaseEntry {
    pub fn new(path: PathBuf, name: String) -> Self {
        Self {
            path,
            name,
            group: None,
            registered: true,
            order: 0,
            snapshot: None,
            health: None,
            last_checked: None,
            previous_row_counts: BTreeMap::new(),
            recent_changes: Vec::new(),
            watch_results: Vec::new(),
            quiet: false,
        }
    }

    pub fn watch_result(&self, name: &str) -> Option<&WatchResult> {
        self.watch_results.iter().find(|result| result.name == name)
    }
}

/// A database declaration after normalisation: absolute canonical path, resolved name.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseDeclaration {
    pub path: PathBuf,
    pub name: String,
    pub group: Option<String>,
    pub watches: Vec<WatchSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub refresh_interval_secs: u64,
    pub activity_timeout_minutes: u64,
    pub databases: Vec<DatabaseDeclaration>,
}

/// On-disk shape of `config.json`, kept loose so hand edits survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_timeout: Option<i64>,
    #[serde(default)]
    pub databases: Vec<DatabaseDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDocument {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watches: Option<Vec<WatchSpec>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entries_checked: usize,
    pub entries_failed: usize,
    pub alerts_raised: usize,
    pub refresh_interval_secs: u64,
    pub row_deltas: Vec<(PathBuf, TableDelta)>,
    pub watch_directories: Vec<PathBuf>,
}
