use crate::models::DatabaseEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Read-only view handed to the presentation layer after each cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub entries: Vec<DatabaseEntry>,
    pub cycle: u64,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct EntryGroup<'a> {
    pub label: Option<&'a str>,
    pub entries: Vec<&'a DatabaseEntry>,
}

impl RegistrySnapshot {
    pub fn get(&self, path: &Path) -> Option<&DatabaseEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&DatabaseEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Groups in order of first appearance; entries keep configuration order.
    pub fn grouped(&self) -> Vec<EntryGroup<'_>> {
        let mut groups: Vec<EntryGroup<'_>> = Vec::new();
        for entry in &self.entries {
            let label = entry.group.as_deref();
            match groups.iter_mut().find(|group| group.label == label) {
                Some(group) => group.entries.push(entry),
                None => groups.push(EntryGroup {
                    label,
                    entries: vec![entry],
                }),
            }
        }
        groups
    }
}

/// Publication point for registry snapshots. Readers never see a cycle half applied.
#[derive(Debug, Clone)]
pub struct Registry {
    published: watch::Sender<Arc<RegistrySnapshot>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        Self { published }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.published.subscribe()
    }

    pub(crate) fn publish(&self, snapshot: RegistrySnapshot) {
        self.published.send_replace(Arc::new(snapshot));
    }
}

/// Working copy of the registry, mutated only by the cycle runner.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: HashMap<PathBuf, DatabaseEntry>,
}

impl EntryTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&DatabaseEntry> {
        self.entries.get(path)
    }

    /// Returns a detached copy of the entry for `path`, or a fresh one.
    pub fn checkout(&self, path: &Path, name: &str) -> DatabaseEntry {
        self.entries
            .get(path)
            .cloned()
            .unwrap_or_else(|| DatabaseEntry::new(path.to_path_buf(), name.to_string()))
    }

    pub fn commit(&mut self, entry: DatabaseEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Drops entries whose path is not in `keep`, returning the evicted paths.
    pub fn retain_paths(&mut self, keep: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let evicted = self
            .entries
            .keys()
            .filter(|path| !keep.contains(*path))
            .cloned()
            .collect::<Vec<_>>();
        for path in &evicted {
            self.entries.remove(path);
        }
        evicted
    }

    pub fn to_snapshot(&self, cycle: u64, published_at: DateTime<Utc>) -> RegistrySnapshot {
        let mut entries = self.entries.values().cloned().collect::<Vec<_>>();
        entries.sort_by(|left, right| left.order.cmp(&right.order).then_with(|| left.path.cmp(&right.path)));
        RegistrySnapshot {
            entries,
            cycle,
            published_at: Some(published_at),
        }
    }
}
