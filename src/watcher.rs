use crate::errors::{AppError, AppResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DATABASE_DEBOUNCE: Duration = Duration::from_millis(500);

pub type SettledCallback = Arc<dyn Fn() + Send + Sync>;

/// Watches one directory and calls `on_settled` once a burst of mutations
/// has been quiet for the debounce window.
pub struct DirectoryWatcher {
    directory: PathBuf,
    cancel: CancellationToken,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    pub fn spawn(
        runtime: &Handle,
        directory: &Path,
        debounce: Duration,
        on_settled: SettledCallback,
    ) -> AppResult<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) if is_mutation(&event.kind) => {
                let _ = events_tx.send(());
            }
            Ok(_) => {}
            Err(error) => tracing::debug!(error = %error, "filesystem watch error"),
        })
        .map_err(|error| AppError::Io(error.to_string()))?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .map_err(|error| AppError::Io(format!("{}: {}", directory.display(), error)))?;

        let cancel = CancellationToken::new();
        runtime.spawn(debounce_loop(events_rx, debounce, cancel.clone(), on_settled));
        tracing::debug!(directory = %directory.display(), debounce_ms = debounce.as_millis() as u64, "watching directory");

        Ok(Self {
            directory: directory.to_path_buf(),
            cancel,
            _watcher: watcher,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn is_mutation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Restarts the timer on every event; fires once it elapses uninterrupted.
pub async fn debounce_loop(
    mut events: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    cancel: CancellationToken,
    on_settled: SettledCallback,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(()) => deadline = Some(Instant::now() + debounce),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                on_settled();
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct WatchSetChange {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// One debounced watcher per monitored database directory.
pub struct WatchSet {
    runtime: Handle,
    debounce: Duration,
    on_settled: SettledCallback,
    watchers: HashMap<PathBuf, DirectoryWatcher>,
}

impl WatchSet {
    pub fn new(runtime: Handle, debounce: Duration, on_settled: SettledCallback) -> Self {
        Self {
            runtime,
            debounce,
            on_settled,
            watchers: HashMap::new(),
        }
    }

    pub fn directories(&self) -> BTreeSet<PathBuf> {
        self.watchers.keys().cloned().collect()
    }

    /// Unwatches stale directories (cancelling their pending debounce) and watches new ones.
    /// Directories that cannot be watched yet are retried on the next update.
    pub fn update(&mut self, wanted: &BTreeSet<PathBuf>) -> WatchSetChange {
        let mut change = WatchSetChange::default();

        let stale = self
            .watchers
            .keys()
            .filter(|directory| !wanted.contains(*directory))
            .cloned()
            .collect::<Vec<_>>();
        for directory in stale {
            if let Some(watcher) = self.watchers.remove(&directory) {
                watcher.cancel();
            }
            change.removed.push(directory);
        }

        for directory in wanted {
            if self.watchers.contains_key(directory) {
                continue;
            }
            match DirectoryWatcher::spawn(&self.runtime, directory, self.debounce, self.on_settled.clone()) {
                Ok(watcher) => {
                    self.watchers.insert(directory.clone(), watcher);
                    change.added.push(directory.clone());
                }
                Err(error) => {
                    tracing::warn!(directory = %directory.display(), error = %error, "failed to watch database directory");
                }
            }
        }

        change.removed.sort();
        change
    }

    pub fn clear(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.cancel();
        }
    }
}
