use rusqlite::Connection;
use sqlite_monitor_lib::alerts::Notifier;
use sqlite_monitor_lib::models::{
    AlertState, ConfigDocument, DatabaseDocument, HealthStatus, MonitorConfig, WatchSpec,
};
use sqlite_monitor_lib::{AppResult, Collaborators, ConfigSource, ConfigStore, Engine};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl RecordingNotifier {
    fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, database: &str, watch: &str, formatted_value: &str) {
        self.calls.lock().expect("calls lock").push((
            database.to_string(),
            watch.to_string(),
            formatted_value.to_string(),
        ));
    }
}

fn seed_database(path: &Path, rows: usize) {
    let conn = Connection::open(path).expect("open db");
    conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, status TEXT NOT NULL);")
        .expect("create table");
    for _ in 0..rows {
        conn.execute("INSERT INTO t (status) VALUES ('x')", []).expect("insert row");
    }
}

fn pending_watch() -> WatchSpec {
    WatchSpec {
        name: "Pending".to_string(),
        query: "SELECT COUNT(*) FROM t WHERE status = 'x'".to_string(),
        warn_above: Some(37.0),
        ..Default::default()
    }
}

fn write_config(store: &ConfigStore, db_path: &Path) {
    store
        .save(&ConfigDocument {
            refresh_interval: Some(3600),
            activity_timeout: None,
            databases: vec![DatabaseDocument {
                path: db_path.to_string_lossy().to_string(),
                name: Some("Jobs".to_string()),
                group: Some("Local".to_string()),
                watches: Some(vec![pending_watch()]),
            }],
        })
        .expect("save config");
}

fn start(store: ConfigStore, notifier: Arc<RecordingNotifier>) -> Engine {
    let mut collaborators = Collaborators::production(store);
    collaborators.notifier = notifier;
    Engine::start(collaborators).expect("start engine")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inserted_row_shows_up_as_delta_and_raises_one_alert() {
    let home = tempfile::tempdir().expect("config dir");
    let data = tempfile::tempdir().expect("data dir");
    let db_path = data.path().join("jobs.db");
    seed_database(&db_path, 37);

    let store = ConfigStore::new(home.path());
    write_config(&store, &db_path);
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = start(store, notifier.clone());

    engine.refresh_and_wait().await;
    let snapshot = engine.snapshot();
    let entry = snapshot.find_by_name("Jobs").expect("jobs entry");
    assert_eq!(entry.group.as_deref(), Some("Local"));
    assert_eq!(entry.health.as_ref().map(|verdict| verdict.status), Some(HealthStatus::Healthy));
    assert!(!entry.quiet);
    let pending = entry.watch_result("Pending").expect("pending watch");
    assert_eq!(pending.value.as_deref(), Some("37"));
    assert_eq!(pending.numeric_value, Some(37.0));
    assert_eq!(pending.state, AlertState::Normal);
    assert!(notifier.calls().is_empty());

    let conn = Connection::open(&db_path).expect("reopen db");
    conn.execute("INSERT INTO t (status) VALUES ('x')", []).expect("insert row");
    drop(conn);

    engine.refresh_and_wait().await;
    let snapshot = engine.snapshot();
    let entry = snapshot.find_by_name("Jobs").expect("jobs entry");
    assert_eq!(entry.previous_row_counts.get("t"), Some(&37));
    assert_eq!(entry.recent_changes.len(), 1);
    assert_eq!(entry.recent_changes[0].delta, 1);
    let pending = entry.watch_result("Pending").expect("pending watch");
    assert_eq!(pending.value.as_deref(), Some("38"));
    assert_eq!(pending.formatted_value, "38");
    assert_eq!(pending.state, AlertState::Warning);

    engine.refresh_and_wait().await;
    let calls = notifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], ("Jobs".to_string(), "Pending".to_string(), "38".to_string()));

    engine.stop().await;
}

/// Holds the first cycle that loads configuration after `hold` until released.
struct GatedConfig {
    store: ConfigStore,
    config_dir: PathBuf,
    hold: AtomicBool,
    entered: tokio::sync::mpsc::UnboundedSender<()>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl ConfigSource for GatedConfig {
    fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    fn load(&self) -> MonitorConfig {
        if self.hold.swap(false, Ordering::SeqCst) {
            let _ = self.entered.send(());
            if let Ok(release) = self.release.lock() {
                let _ = release.recv();
            }
        }
        self.store.load()
    }

    fn load_document(&self) -> ConfigDocument {
        self.store.load_document()
    }

    fn save(&self, document: &ConfigDocument) -> AppResult<()> {
        self.store.save(document)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rapid_manual_refreshes_after_a_change_run_one_follow_up() {
    let home = tempfile::tempdir().expect("config dir");
    let quiet_dir = tempfile::tempdir().expect("unwatched config dir");
    let data = tempfile::tempdir().expect("data dir");
    let db_path = data.path().join("jobs.db");
    seed_database(&db_path, 37);
    let store = ConfigStore::new(home.path());
    write_config(&store, &db_path);

    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let config = Arc::new(GatedConfig {
        store: store.clone(),
        config_dir: quiet_dir.path().to_path_buf(),
        hold: AtomicBool::new(false),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    });
    let mut collaborators = Collaborators::production(store);
    collaborators.config = config.clone();
    let engine = Engine::start(collaborators).expect("start engine");

    engine.refresh_and_wait().await;
    let value = |engine: &Engine| {
        engine
            .snapshot()
            .find_by_name("Jobs")
            .and_then(|entry| entry.watch_result("Pending").and_then(|result| result.value.clone()))
    };
    assert_eq!(value(&engine).as_deref(), Some("37"));

    config.hold.store(true, Ordering::SeqCst);
    let conn = Connection::open(&db_path).expect("reopen db");
    conn.execute("INSERT INTO t (status) VALUES ('x')", []).expect("insert row");
    drop(conn);

    engine.request_refresh();
    entered_rx.recv().await.expect("cycle entered");
    let before = engine.cycles_completed();

    let mut last_ticket = 0;
    for _ in 0..8 {
        last_ticket = engine.request_refresh();
    }
    // The directory watcher's debounced request also lands while the cycle is held.
    sleep(Duration::from_millis(1500)).await;
    release_tx.send(()).expect("release cycle");
    engine.wait_for(last_ticket).await;

    assert_eq!(engine.cycles_completed() - before, 2);
    assert_eq!(value(&engine).as_deref(), Some("38"));

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(engine.cycles_completed() - before, 2);
    assert!(!engine.is_refreshing());

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_edits_are_picked_up_without_restart() {
    let home = tempfile::tempdir().expect("config dir");
    let data = tempfile::tempdir().expect("data dir");
    let first = data.path().join("first.db");
    let second = data.path().join("second.db");
    seed_database(&first, 1);
    seed_database(&second, 2);

    let store = ConfigStore::new(home.path());
    write_config(&store, &first);
    let engine = start(store.clone(), Arc::new(RecordingNotifier::default()));
    engine.refresh_and_wait().await;
    assert_eq!(engine.snapshot().entries.len(), 1);

    let mut document = store.load_document();
    document.databases.push(DatabaseDocument {
        path: second.to_string_lossy().to_string(),
        ..Default::default()
    });
    store.save(&document).expect("save config");
    engine.refresh_and_wait().await;

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.entries.len(), 2);
    let names = snapshot.entries.iter().map(|entry| entry.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Jobs", "second"]);

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_database_is_reported_without_affecting_others() {
    let home = tempfile::tempdir().expect("config dir");
    let data = tempfile::tempdir().expect("data dir");
    let present = data.path().join("present.db");
    seed_database(&present, 3);
    let absent = data.path().join("absent.db");

    let store = ConfigStore::new(home.path());
    store
        .save(&ConfigDocument {
            databases: vec![
                DatabaseDocument {
                    path: absent.to_string_lossy().to_string(),
                    ..Default::default()
                },
                DatabaseDocument {
                    path: present.to_string_lossy().to_string(),
                    watches: Some(vec![pending_watch()]),
                    ..Default::default()
                },
            ],
            ..Default::default()
        })
        .expect("save config");
    let engine = start(store, Arc::new(RecordingNotifier::default()));
    engine.refresh_and_wait().await;

    let snapshot = engine.snapshot();
    let missing = snapshot.find_by_name("absent").expect("absent entry");
    assert_eq!(missing.health.as_ref().map(|verdict| verdict.status), Some(HealthStatus::Error));
    assert_eq!(missing.health.as_ref().and_then(|verdict| verdict.message()), Some("File not found"));
    assert!(missing.snapshot.is_none());

    let healthy = snapshot.find_by_name("present").expect("present entry");
    assert_eq!(healthy.health.as_ref().map(|verdict| verdict.status), Some(HealthStatus::Healthy));
    assert_eq!(
        healthy.watch_result("Pending").and_then(|result| result.numeric_value),
        Some(3.0)
    );

    engine.stop().await;
}
