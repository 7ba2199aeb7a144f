use crate::models::{HealthStatus, HealthVerdict, StructuralSnapshot};

const WAL_WARNING_FLOOR_BYTES: u64 = 4 * 1024 * 1024;
const FREELIST_WARNING_RATIO: f64 = 0.25;
const FREELIST_MIN_PAGES: i64 = 100;

pub trait HealthChecker: Send + Sync {
    fn check(&self, snapshot: &StructuralSnapshot) -> HealthVerdict;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthEvaluator;

impl HealthChecker for HealthEvaluator {
    fn check(&self, snapshot: &StructuralSnapshot) -> HealthVerdict {
        if !snapshot.integrity.eq_ignore_ascii_case("ok") {
            return HealthVerdict::error(format!("Integrity check failed: {}", snapshot.integrity));
        }

        let mut issues = Vec::new();
        if snapshot.tables.is_empty() {
            issues.push("No tables".to_string());
        }
        if snapshot.wal_size > snapshot.file_size && snapshot.wal_size > WAL_WARNING_FLOOR_BYTES {
            issues.push(format!(
                "WAL file ({} bytes) is larger than the database; checkpoints may be stalled",
                snapshot.wal_size
            ));
        }
        if snapshot.page_count >= FREELIST_MIN_PAGES {
            let ratio = snapshot.freelist_count as f64 / snapshot.page_count as f64;
            if ratio > FREELIST_WARNING_RATIO {
                issues.push(format!("{:.0}% of pages are free; consider VACUUM", ratio * 100.0));
            }
        }

        if issues.is_empty() {
            HealthVerdict::healthy()
        } else {
            HealthVerdict {
                status: HealthStatus::Warning,
                issues,
            }
        }
    }
}
