use crate::models::{AlertState, WatchResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Identity of an active alert. Editing a watch's query produces a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub database: PathBuf,
    pub watch: String,
    pub query: String,
}

impl AlertKey {
    pub fn new(database: &Path, result: &WatchResult) -> Self {
        Self {
            database: database.to_path_buf(),
            watch: result.name.clone(),
            query: result.query.clone(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, database: &str, watch: &str, formatted_value: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, database: &str, watch: &str, formatted_value: &str) {
        tracing::warn!(database = %database, watch = %watch, value = %formatted_value, "watch alert raised");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertTransition {
    pub database_name: String,
    pub watch_name: String,
    pub formatted_value: String,
}

/// Adds every non-normal result to `current` and returns the ones that were not
/// active in `previous`.
pub fn collect_transitions(
    previous: &HashSet<AlertKey>,
    current: &mut HashSet<AlertKey>,
    database: &Path,
    database_name: &str,
    results: &[WatchResult],
) -> Vec<AlertTransition> {
    let mut transitions = Vec::new();
    for result in results.iter().filter(|result| result.state != AlertState::Normal) {
        let key = AlertKey::new(database, result);
        if !previous.contains(&key) && !current.contains(&key) {
            transitions.push(AlertTransition {
                database_name: database_name.to_string(),
                watch_name: result.name.clone(),
                formatted_value: result.formatted_value.clone(),
            });
        }
        current.insert(key);
    }
    transitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(name: &str, state: AlertState) -> WatchResult {
        WatchResult {
            name: name.to_string(),
            query: format!("SELECT {name}"),
            value: Some("12".to_string()),
            numeric_value: Some(12.0),
            formatted_value: "12".to_string(),
            state,
            updated_at: Utc::now(),
            error: None,
        }
    }

    fn run_cycle(previous: &HashSet<AlertKey>, results: &[WatchResult]) -> (HashSet<AlertKey>, usize) {
        let mut current = HashSet::new();
        let transitions = collect_transitions(previous, &mut current, Path::new("/data/app.db"), "App", results);
        (current, transitions.len())
    }

    #[test]
    fn repeated_warning_notifies_once_until_it_clears() {
        let warning = [result("backlog", AlertState::Warning)];
        let normal = [result("backlog", AlertState::Normal)];

        let (active, fired) = run_cycle(&HashSet::new(), &warning);
        assert_eq!(fired, 1);
        let (active, fired) = run_cycle(&active, &warning);
        assert_eq!(fired, 0);
        let (active, fired) = run_cycle(&active, &normal);
        assert_eq!(fired, 0);
        assert!(active.is_empty());
        let (_, fired) = run_cycle(&active, &warning);
        assert_eq!(fired, 1);
    }

    #[test]
    fn escalation_within_active_alert_does_not_renotify() {
        let (active, _) = run_cycle(&HashSet::new(), &[result("backlog", AlertState::Warning)]);
        let (_, fired) = run_cycle(&active, &[result("backlog", AlertState::Critical)]);
        assert_eq!(fired, 0);
    }

    #[test]
    fn changed_query_is_a_new_alert() {
        let (active, _) = run_cycle(&HashSet::new(), &[result("backlog", AlertState::Warning)]);
        let mut edited = result("backlog", AlertState::Warning);
        edited.query = "SELECT COUNT(*) FROM jobs".to_string();
        let (_, fired) = run_cycle(&active, &[edited]);
        assert_eq!(fired, 1);
    }
}
