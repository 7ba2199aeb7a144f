use crate::alerts::{collect_transitions, AlertKey, Notifier, TracingNotifier};
use crate::config::{ConfigSource, ConfigStore};
use crate::db::{Inspector, SqliteInspector};
use crate::health::{HealthChecker, HealthEvaluator};
use crate::models::{
    CycleReport, DatabaseDeclaration, DatabaseEntry, HealthVerdict, MonitorConfig, TableDelta,
};
use crate::registry::{EntryTable, Registry};
use crate::watch::{SqlWatchEvaluator, WatchEvaluator};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// The external services one cycle consults.
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn ConfigSource>,
    pub inspector: Arc<dyn Inspector>,
    pub health: Arc<dyn HealthChecker>,
    pub watches: Arc<dyn WatchEvaluator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn production(config: ConfigStore) -> Self {
        Self {
            config: Arc::new(config),
            inspector: Arc::new(SqliteInspector),
            health: Arc::new(HealthEvaluator),
            watches: Arc::new(SqlWatchEvaluator),
            notifier: Arc::new(TracingNotifier),
        }
    }
}

#[derive(Default)]
struct CycleState {
    entries: EntryTable,
    previous_alerts: HashSet<AlertKey>,
    cycle: u64,
}

/// Runs one full pass over the configured databases. Callers must not run two
/// cycles at once; the coalescer guarantees that, so the state lock is never contended.
pub struct CycleRunner {
    collaborators: Collaborators,
    registry: Registry,
    state: Mutex<CycleState>,
}

impl CycleRunner {
    pub fn new(collaborators: Collaborators, registry: Registry) -> Self {
        Self {
            collaborators,
            registry,
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn run_one_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let config = self.collaborators.config.load();

        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.cycle += 1;

        let mut report = CycleReport {
            started_at: Some(started_at),
            refresh_interval_secs: config.refresh_interval_secs,
            ..Default::default()
        };
        let mut current_alerts = HashSet::new();
        let mut configured = HashSet::new();

        for (order, declaration) in config.databases.iter().enumerate() {
            configured.insert(declaration.path.clone());

            let mut entry = state.entries.checkout(&declaration.path, &declaration.name);
            entry.name = declaration.name.clone();
            entry.group = declaration.group.clone();
            entry.registered = true;
            entry.order = order;

            let healthy = self.refresh_entry(&mut entry, declaration, config.activity_timeout_minutes);
            report.entries_checked += 1;
            if !healthy {
                report.entries_failed += 1;
            }
            report.row_deltas.extend(
                entry
                    .recent_changes
                    .iter()
                    .map(|change| (entry.path.clone(), change.clone())),
            );

            let transitions = collect_transitions(
                &state.previous_alerts,
                &mut current_alerts,
                &entry.path,
                &entry.name,
                &entry.watch_results,
            );
            for transition in transitions {
                self.collaborators.notifier.notify(
                    &transition.database_name,
                    &transition.watch_name,
                    &transition.formatted_value,
                );
                report.alerts_raised += 1;
            }

            state.entries.commit(entry);
        }

        for evicted in state.entries.retain_paths(&configured) {
            tracing::info!(path = %evicted.display(), "database removed from monitoring");
        }
        state.previous_alerts = current_alerts;

        report.watch_directories = watch_directories(&config).into_iter().collect();
        let finished_at = Utc::now();
        report.finished_at = Some(finished_at);
        self.registry.publish(state.entries.to_snapshot(state.cycle, finished_at));

        tracing::info!(
            cycle = state.cycle,
            checked = report.entries_checked,
            failed = report.entries_failed,
            alerts = report.alerts_raised,
            changes = report.row_deltas.len(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "refresh cycle complete"
        );
        report
    }

    /// Returns false when the entry ended the cycle in a failed state.
    fn refresh_entry(&self, entry: &mut DatabaseEntry, declaration: &DatabaseDeclaration, activity_timeout_minutes: u64) -> bool {
        let now = Utc::now();
        if !declaration.path.exists() {
            tracing::warn!(path = %declaration.path.display(), "monitored database file not found");
            entry.health = Some(HealthVerdict::error("File not found"));
            entry.quiet = false;
            entry.watch_results.clear();
            entry.recent_changes.clear();
            entry.last_checked = Some(now);
            return false;
        }

        entry.previous_row_counts = entry
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.row_counts())
            .unwrap_or_default();

        let snapshot = match self.collaborators.inspector.inspect(&declaration.path) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(path = %declaration.path.display(), error = %error, "database inspection failed");
                entry.health = Some(HealthVerdict::error("Inspection failed"));
                entry.watch_results.clear();
                entry.recent_changes.clear();
                return false;
            }
        };

        entry.recent_changes = row_deltas(&entry.previous_row_counts, &snapshot.row_counts());
        entry.quiet = is_quiet(snapshot.last_modified, now, activity_timeout_minutes);
        entry.health = Some(self.collaborators.health.check(&snapshot));
        entry.snapshot = Some(snapshot);
        entry.last_checked = Some(now);

        entry.watch_results = if declaration.watches.is_empty() {
            Vec::new()
        } else {
            self.collaborators
                .watches
                .evaluate(&declaration.watches, &declaration.path)
        };
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, CycleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("cycle state lock poisoned; continuing with last state");
                poisoned.into_inner()
            }
        }
    }
}

/// New minus old per table. First sightings and unchanged tables are omitted.
pub fn row_deltas(previous: &BTreeMap<String, i64>, current: &BTreeMap<String, i64>) -> Vec<TableDelta> {
    current
        .iter()
        .filter_map(|(table, &now)| {
            let &before = previous.get(table)?;
            (now != before).then(|| TableDelta {
                table: table.clone(),
                previous: before,
                current: now,
                delta: now - before,
            })
        })
        .collect()
}

pub fn is_quiet(last_modified: Option<DateTime<Utc>>, now: DateTime<Utc>, activity_timeout_minutes: u64) -> bool {
    let Some(modified) = last_modified else {
        return false;
    };
    let idle_minutes = (now - modified).num_milliseconds() as f64 / 60_000.0;
    idle_minutes > activity_timeout_minutes as f64
}

/// Containing directories of every configured database, deduplicated.
pub fn watch_directories(config: &MonitorConfig) -> BTreeSet<PathBuf> {
    config
        .databases
        .iter()
        .filter_map(|declaration| declaration.path.parent().map(PathBuf::from))
        .collect()
}
