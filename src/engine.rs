use crate::coalescer::RefreshCoalescer;
use crate::config::{canonical_identity, expand_tilde, home_dir, ConfigSource, DEFAULT_REFRESH_INTERVAL_SECS};
use crate::db;
use crate::errors::{AppError, AppResult};
use crate::models::{CycleReport, DatabaseDocument};
use crate::registry::{Registry, RegistrySnapshot};
use crate::runner::{Collaborators, CycleRunner};
use crate::watcher::{DirectoryWatcher, SettledCallback, WatchSet, CONFIG_DEBOUNCE, DATABASE_DEBOUNCE};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Owns the refresh pipeline and every trigger source that feeds it.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    runner: Arc<CycleRunner>,
    coalescer: RefreshCoalescer,
    registry: Registry,
    config: Arc<dyn ConfigSource>,
    cancel: CancellationToken,
    interval: watch::Sender<Duration>,
    config_watcher: Mutex<Option<DirectoryWatcher>>,
    database_watchers: Mutex<WatchSet>,
    last_report: Mutex<Option<CycleReport>>,
}

impl Engine {
    /// Must be called from within a tokio runtime. Requests the first cycle immediately.
    pub fn start(collaborators: Collaborators) -> AppResult<Self> {
        let runtime = Handle::try_current().map_err(|error| AppError::Internal(error.to_string()))?;
        let registry = Registry::new();
        let config = collaborators.config.clone();
        let runner = Arc::new(CycleRunner::new(collaborators, registry.clone()));
        let coalescer = RefreshCoalescer::new(runtime.clone());
        let (interval, _) = watch::channel(Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS));

        let on_settled: SettledCallback = {
            let coalescer = coalescer.clone();
            Arc::new(move || {
                coalescer.request_refresh();
            })
        };

        let config_dir = config.config_dir();
        let config_watcher = match std::fs::create_dir_all(&config_dir)
            .map_err(AppError::from)
            .and_then(|_| DirectoryWatcher::spawn(&runtime, &config_dir, CONFIG_DEBOUNCE, on_settled.clone()))
        {
            Ok(watcher) => Some(watcher),
            Err(error) => {
                tracing::warn!(directory = %config_dir.display(), error = %error, "config directory is not watched");
                None
            }
        };

        let inner = Arc::new(EngineInner {
            runner,
            coalescer: coalescer.clone(),
            registry,
            config,
            cancel: CancellationToken::new(),
            interval,
            config_watcher: Mutex::new(config_watcher),
            database_watchers: Mutex::new(WatchSet::new(runtime.clone(), DATABASE_DEBOUNCE, on_settled)),
            last_report: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        coalescer.set_executor(Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                let runner = engine.runner.clone();
                match tokio::task::spawn_blocking(move || runner.run_one_cycle()).await {
                    Ok(report) => engine.after_cycle(report),
                    Err(error) => tracing::error!(error = %error, "refresh cycle panicked"),
                }
            })
        }));

        runtime.spawn(periodic_refresh(
            coalescer.clone(),
            inner.interval.subscribe(),
            inner.cancel.clone(),
        ));

        let engine = Self { inner };
        engine.request_refresh();
        tracing::info!(config_dir = %config_dir.display(), "monitor engine started");
        Ok(engine)
    }

    /// Non-blocking; duplicate requests while a cycle runs collapse into one follow-up.
    pub fn request_refresh(&self) -> u64 {
        self.inner.coalescer.request_refresh()
    }

    /// Resolves once a cycle that began after `ticket` was issued has completed.
    pub async fn wait_for(&self, ticket: u64) {
        self.inner.coalescer.wait_for(ticket).await;
    }

    pub async fn refresh_and_wait(&self) {
        self.inner.coalescer.refresh_and_wait().await;
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.registry.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.inner.registry.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.coalescer.is_running()
    }

    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.coalescer.status().last_completed_at
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.coalescer.status().cycles_completed
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        lock(&self.inner.last_report).clone()
    }

    pub fn refresh_interval(&self) -> Duration {
        *self.inner.interval.borrow()
    }

    pub fn watched_directories(&self) -> BTreeSet<PathBuf> {
        lock(&self.inner.database_watchers).directories()
    }

    /// Declares a database (or renames/regroups an existing declaration) and refreshes.
    pub fn add_database(&self, path: &str, name: Option<&str>, group: Option<&str>) -> AppResult<()> {
        let target = resolve_user_path(path)?;
        let mut document = self.inner.config.load_document();
        let existing = document
            .databases
            .iter_mut()
            .find(|declared| declared_identity(&declared.path).as_deref() == Some(target.as_path()));
        match existing {
            Some(declared) => {
                if name.is_some() {
                    declared.name = name.map(ToString::to_string);
                }
                if group.is_some() {
                    declared.group = group.map(ToString::to_string);
                }
            }
            None => document.databases.push(DatabaseDocument {
                path: target.to_string_lossy().to_string(),
                name: name.map(ToString::to_string),
                group: group.map(ToString::to_string),
                watches: None,
            }),
        }
        self.inner.config.save(&document)?;
        tracing::info!(path = %target.display(), "database added to configuration");
        self.request_refresh();
        Ok(())
    }

    /// Removes every declaration of `path`. Returns false when nothing matched.
    pub fn remove_database(&self, path: &str) -> AppResult<bool> {
        let target = resolve_user_path(path)?;
        let mut document = self.inner.config.load_document();
        let before = document.databases.len();
        document
            .databases
            .retain(|declared| declared_identity(&declared.path).as_deref() != Some(target.as_path()));
        if document.databases.len() == before {
            return Ok(false);
        }
        self.inner.config.save(&document)?;
        tracing::info!(path = %target.display(), "database removed from configuration");
        self.request_refresh();
        Ok(true)
    }

    /// SQLite files in `dir` that are not monitored yet.
    pub fn discover_databases(&self, dir: &Path) -> AppResult<Vec<PathBuf>> {
        let snapshot = self.snapshot();
        Ok(db::discover_databases(dir)?
            .into_iter()
            .filter(|candidate| snapshot.get(&canonical_identity(candidate)).is_none())
            .collect())
    }

    /// Cancels the timer and both watcher sets, then waits for an in-flight cycle.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(watcher) = lock(&self.inner.config_watcher).take() {
            watcher.cancel();
        }
        lock(&self.inner.database_watchers).clear();
        self.inner.coalescer.stop().await;
        tracing::info!("monitor engine stopped");
    }
}

impl EngineInner {
    fn after_cycle(&self, report: CycleReport) {
        let period = Duration::from_secs(report.refresh_interval_secs);
        self.interval.send_if_modified(|current| {
            if *current == period {
                return false;
            }
            *current = period;
            true
        });

        if !self.cancel.is_cancelled() {
            let wanted = report.watch_directories.iter().cloned().collect::<BTreeSet<_>>();
            let change = lock(&self.database_watchers).update(&wanted);
            if !change.added.is_empty() || !change.removed.is_empty() {
                tracing::debug!(added = change.added.len(), removed = change.removed.len(), "database watch set updated");
            }
        }

        *lock(&self.last_report) = Some(report);
    }
}

async fn periodic_refresh(
    coalescer: RefreshCoalescer,
    mut interval: watch::Receiver<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let period = *interval.borrow_and_update();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {
                coalescer.request_refresh();
            }
            changed = interval.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

fn resolve_user_path(raw: &str) -> AppResult<PathBuf> {
    let expanded = expand_tilde(raw.trim(), home_dir().as_deref());
    if !expanded.is_absolute() {
        return Err(AppError::Config(format!("Database paths must be absolute: {}", raw)));
    }
    Ok(canonical_identity(&expanded))
}

fn declared_identity(raw: &str) -> Option<PathBuf> {
    let expanded = expand_tilde(raw.trim(), home_dir().as_deref());
    expanded.is_absolute().then(|| canonical_identity(&expanded))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
