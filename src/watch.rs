use crate::db;
use crate::errors::{AppError, AppResult};
use crate::models::{AlertState, WatchFormat, WatchResult, WatchSpec};
use chrono::{DateTime, Utc};
use std::path::Path;

pub trait WatchEvaluator: Send + Sync {
    fn evaluate(&self, specs: &[WatchSpec], path: &Path) -> Vec<WatchResult>;
}

/// Evaluates watches with one read-only connection per database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlWatchEvaluator;

impl WatchEvaluator for SqlWatchEvaluator {
    fn evaluate(&self, specs: &[WatchSpec], path: &Path) -> Vec<WatchResult> {
        if specs.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        match db::open_read_only(path) {
            Ok(conn) => specs
                .iter()
                .map(|spec| build_result(spec, db::scalar(&conn, &spec.query), now))
                .collect(),
            Err(error) => {
                let message = error.to_string();
                specs
                    .iter()
                    .map(|spec| build_result(spec, Err(AppError::Query(message.clone())), now))
                    .collect()
            }
        }
    }
}

pub fn build_result(spec: &WatchSpec, outcome: AppResult<Option<String>>, now: DateTime<Utc>) -> WatchResult {
    match outcome {
        Ok(value) => {
            let numeric_value = value.as_deref().and_then(parse_numeric);
            WatchResult {
                name: spec.name.clone(),
                query: spec.query.clone(),
                formatted_value: format_value(value.as_deref(), numeric_value, spec.format.unwrap_or_default()),
                state: classify(spec, numeric_value),
                value,
                numeric_value,
                updated_at: now,
                error: None,
            }
        }
        Err(error) => {
            tracing::debug!(watch = %spec.name, error = %error, "watch query failed");
            let message = error.to_string();
            WatchResult {
                name: spec.name.clone(),
                query: spec.query.clone(),
                value: None,
                numeric_value: None,
                formatted_value: format!("error: {message}"),
                state: AlertState::Critical,
                updated_at: now,
                error: Some(message),
            }
        }
    }
}

pub fn parse_numeric(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Non-numeric values never trip a threshold. Critical bounds win over warning bounds.
pub fn classify(spec: &WatchSpec, numeric: Option<f64>) -> AlertState {
    let Some(value) = numeric else {
        return AlertState::Normal;
    };
    let above = |threshold: Option<f64>| threshold.is_some_and(|limit| value > limit);
    let below = |threshold: Option<f64>| threshold.is_some_and(|limit| value < limit);

    if above(spec.critical_above) || below(spec.critical_below) {
        AlertState::Critical
    } else if above(spec.warn_above) || below(spec.warn_below) {
        AlertState::Warning
    } else {
        AlertState::Normal
    }
}

pub fn format_value(raw: Option<&str>, numeric: Option<f64>, format: WatchFormat) -> String {
    let Some(raw) = raw else {
        return "null".to_string();
    };
    let Some(value) = numeric else {
        return raw.to_string();
    };
    match format {
        WatchFormat::Raw => raw.to_string(),
        WatchFormat::Number => format_number(value),
        WatchFormat::Percent => format!("{}%", format_number(value)),
        WatchFormat::Bytes => format_bytes(value),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

fn format_bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value.abs() < 1024.0 {
        return format!("{} B", format_number(value));
    }
    let mut scaled = value;
    let mut unit = 0;
    while scaled.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", scaled, UNITS[unit])
}
