use anyhow::Context;
use sqlite_monitor_lib::models::DatabaseEntry;
use sqlite_monitor_lib::{init_tracing, Collaborators, ConfigSource, ConfigStore, Engine, RegistrySnapshot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = match std::env::args().nth(1) {
        Some(dir) => ConfigStore::new(dir),
        None => ConfigStore::from_env()?,
    };
    let config_dir = store.config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating {}", config_dir.display()))?;
    init_tracing(&config_dir)?;

    let engine = Engine::start(Collaborators::production(store))?;
    let mut updates = engine.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::warn!(error = %error, "failed to listen for ctrl-c");
                }
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
        }
    }

    engine.stop().await;
    Ok(())
}

fn print_snapshot(snapshot: &RegistrySnapshot) {
    let published = snapshot
        .published_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_default();
    println!("cycle {} at {}", snapshot.cycle, published);
    for group in snapshot.grouped() {
        if let Some(label) = group.label {
            println!("[{}]", label);
        }
        for entry in group.entries {
            print_entry(entry);
        }
    }
}

fn print_entry(entry: &DatabaseEntry) {
    let status = entry
        .health
        .as_ref()
        .map(|verdict| verdict.status.as_str())
        .unwrap_or("unknown");
    let detail = entry
        .health
        .as_ref()
        .and_then(|verdict| verdict.message())
        .map(|message| format!(" ({})", message))
        .unwrap_or_default();
    let activity = if entry.quiet { "quiet" } else { "active" };
    let rows = entry
        .snapshot
        .as_ref()
        .map(|snapshot| snapshot.total_rows())
        .unwrap_or(0);
    println!("  {} [{}{}] {} rows, {}", entry.name, status, detail, rows, activity);
    for change in &entry.recent_changes {
        println!("    {}: {:+}", change.table, change.delta);
    }
    for result in &entry.watch_results {
        println!("    {} = {} ({})", result.name, result.formatted_value, result.state.as_str());
    }
}
