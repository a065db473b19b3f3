//! HealthChecker — named probes aggregated into an overall status.
//!
//! Grounded on `core_runtime/health.py`'s module docstring (the probe
//! body was not available in the retrieved source, so the aggregation
//! rules below are this port's own, chosen to match the documented
//! UP/DOWN/DEGRADED/UNKNOWN vocabulary): probes run with a timeout and a
//! probe that overruns or panics counts as `Unknown` rather than aborting
//! the whole check. `probe_disk_space`/`probe_memory`/`probe_file_writable`
//! are the three probes the source names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
    Unknown,
}

impl HealthStatus {
    /// Worse-is-lower ranking used to fold individual probes into an
    /// overall status: Down < Degraded < Unknown < Up.
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Down => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unknown => 2,
            HealthStatus::Up => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub probes: Vec<ProbeResult>,
}

type ProbeFn = Arc<dyn Fn() -> (HealthStatus, String) + Send + Sync>;

struct Probe {
    name: String,
    run: ProbeFn,
}

/// Registers named probes and aggregates them into an overall
/// [`HealthStatus`], with a per-probe timeout.
pub struct HealthChecker {
    probes: RwLock<Vec<Probe>>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { probes: RwLock::new(Vec::new()), timeout }
    }

    pub fn register(&self, name: impl Into<String>, probe: ProbeFn) {
        self.probes.write().push(Probe { name: name.into(), run: probe });
    }

    /// Run every registered probe (on a blocking thread, under the
    /// configured timeout) and fold the results into an overall status.
    /// `Unknown` is returned when no probes are registered.
    pub async fn check_all(&self) -> HealthReport {
        let probes: Vec<(String, ProbeFn)> = self
            .probes
            .read()
            .iter()
            .map(|p| (p.name.clone(), p.run.clone()))
            .collect();

        let mut results = Vec::with_capacity(probes.len());
        for (name, run) in probes {
            results.push(self.run_one(name, run).await);
        }

        let status = results
            .iter()
            .map(|r| r.status)
            .min_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Unknown);

        HealthReport { status, probes: results }
    }

    async fn run_one(&self, name: String, run: ProbeFn) -> ProbeResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(move || run())).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok((status, message))) => ProbeResult { name, status, message, duration_ms },
            Ok(Err(_join_err)) => ProbeResult {
                name,
                status: HealthStatus::Unknown,
                message: "probe panicked".to_string(),
                duration_ms,
            },
            Err(_elapsed) => ProbeResult {
                name,
                status: HealthStatus::Unknown,
                message: format!("probe exceeded {:?} timeout", self.timeout),
                duration_ms,
            },
        }
    }
}

/// Free disk space at `path` must be at least `min_free_bytes`.
/// Degraded below 2x the minimum, down below the minimum, unknown if disk
/// usage can't be determined on this platform.
pub fn probe_disk_space(path: impl Into<PathBuf>, min_free_bytes: u64) -> ProbeFn {
    let path = path.into();
    Arc::new(move || match available_bytes(&path) {
        Some(free) if free < min_free_bytes => {
            (HealthStatus::Down, format!("{free} bytes free, below minimum {min_free_bytes}"))
        }
        Some(free) if free < min_free_bytes.saturating_mul(2) => {
            (HealthStatus::Degraded, format!("{free} bytes free, approaching minimum {min_free_bytes}"))
        }
        Some(free) => (HealthStatus::Up, format!("{free} bytes free")),
        None => (HealthStatus::Unknown, "could not determine free disk space".to_string()),
    })
}

#[cfg(target_os = "linux")]
fn available_bytes(path: &Path) -> Option<u64> {
    // statvfs isn't in std; shell out to `df` rather than add a libc
    // dependency the rest of the crate has no other use for.
    let output = std::process::Command::new("df").arg("-kP").arg(path).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let available_kb: u64 = fields.get(3)?.parse().ok()?;
    Some(available_kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn available_bytes(_path: &Path) -> Option<u64> {
    None
}

/// System memory usage must stay under `max_used_pct` (0-100). Degraded
/// within 5 points of the limit, down over it.
pub fn probe_memory(max_used_pct: f64) -> ProbeFn {
    Arc::new(move || match used_memory_pct() {
        Some(pct) if pct >= max_used_pct => {
            (HealthStatus::Down, format!("memory usage {pct:.1}% exceeds limit {max_used_pct:.1}%"))
        }
        Some(pct) if pct >= (max_used_pct - 5.0).max(0.0) => {
            (HealthStatus::Degraded, format!("memory usage {pct:.1}% approaching limit {max_used_pct:.1}%"))
        }
        Some(pct) => (HealthStatus::Up, format!("memory usage {pct:.1}%")),
        None => (HealthStatus::Unknown, "could not read /proc/meminfo".to_string()),
    })
}

#[cfg(target_os = "linux")]
fn used_memory_pct() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().trim_end_matches(" kB").trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().trim_end_matches(" kB").trim().parse::<f64>().ok();
        }
    }
    let (total, available) = (total_kb?, available_kb?);
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total) * 100.0)
}

#[cfg(not(target_os = "linux"))]
fn used_memory_pct() -> Option<f64> {
    None
}

/// `dir` must be writable: create-then-delete a throwaway file in it.
pub fn probe_file_writable(dir: impl Into<PathBuf>) -> ProbeFn {
    let dir = dir.into();
    Arc::new(move || {
        if std::fs::create_dir_all(&dir).is_err() {
            return (HealthStatus::Down, format!("cannot create directory {}", dir.display()));
        }
        match tempfile::NamedTempFile::new_in(&dir) {
            Ok(_) => (HealthStatus::Up, format!("{} is writable", dir.display())),
            Err(e) => (HealthStatus::Down, format!("{} is not writable: {e}", dir.display())),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregates_worst_status_across_probes() {
        let checker = HealthChecker::new(Duration::from_secs(1));
        checker.register("always_up", Arc::new(|| (HealthStatus::Up, "ok".to_string())));
        checker.register("always_down", Arc::new(|| (HealthStatus::Down, "bad".to_string())));

        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert_eq!(report.probes.len(), 2);
    }

    #[tokio::test]
    async fn empty_checker_reports_unknown() {
        let checker = HealthChecker::new(Duration::from_secs(1));
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn slow_probe_times_out_as_unknown() {
        let checker = HealthChecker::new(Duration::from_millis(20));
        checker.register(
            "slow",
            Arc::new(|| {
                std::thread::sleep(Duration::from_millis(200));
                (HealthStatus::Up, "late".to_string())
            }),
        );
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn file_writable_probe_detects_a_usable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let checker = HealthChecker::new(Duration::from_secs(1));
        checker.register("disk_writable", probe_file_writable(dir.path()));
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Up);
    }
}
