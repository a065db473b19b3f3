//! FlowScheduler — fires flows on a cron or fixed-interval schedule, one
//! tick (every [`TICK_INTERVAL`]) at a time.
//!
//! Grounded on `core_runtime/flow_scheduler.py`: a 5-field cron parser
//! (`*`, `*/N`, `N`, `N,M`, `N-M`, `N-M/S`) with the `0=Sunday` cron
//! weekday remapped to Rust's Monday-first week via `(v - 1).rem_euclid(7)`,
//! single-flight execution per `flow_id`, and at most two flows executing
//! concurrently. The source drives ticks with `threading.Timer` and a
//! `ThreadPoolExecutor`; this port uses a `tokio::time::interval` loop and
//! a two-permit `Semaphore` instead, and keeps the callback decoupled from
//! any kernel type the same way the source's `execute_callback` is.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

pub const TICK_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_INTERVAL: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_FLOWS: usize = 2;

/// Invoked once per due flow. Mirrors `execute_callback(flow_id, context)`;
/// an `Err` or a result object containing a truthy `_error` key both count
/// as a failed run for diagnostics purposes.
pub type ExecuteCallback = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One scheduler diagnostic event, forwarded verbatim to whatever sink the
/// kernel wires up (tracing, the interface registry's diagnostics feed, …).
#[derive(Debug, Clone)]
pub struct SchedulerDiagnostic {
    pub phase: &'static str,
    pub step_id: String,
    pub handler: &'static str,
    pub status: &'static str,
    pub error: Option<String>,
    pub meta: Option<Value>,
}

pub type DiagnosticsCallback = Arc<dyn Fn(SchedulerDiagnostic) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct CronField {
    values: [bool; 60],
}

impl CronField {
    fn parse(expr: &str, min_val: u32, max_val: u32) -> Result<Self> {
        let mut values = [false; 60];
        let mut set = |v: u32| -> Result<()> {
            if v < min_val || v > max_val {
                return Err(Error::Validation(format!("value {v} out of range [{min_val}, {max_val}]")));
            }
            values[v as usize] = true;
            Ok(())
        };

        for part in expr.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part == "*" {
                for v in min_val..=max_val {
                    set(v)?;
                }
            } else if let Some(step_str) = part.strip_prefix("*/") {
                let step: u32 = step_str.parse().map_err(|_| Error::Validation(format!("invalid step: {part}")))?;
                if step == 0 {
                    return Err(Error::Validation(format!("invalid step: {part}")));
                }
                let mut v = min_val;
                while v <= max_val {
                    set(v)?;
                    v += step;
                }
            } else if part.contains('-') && part.contains('/') {
                let (range_part, step_str) = part.split_once('/').ok_or_else(|| Error::Validation(format!("invalid range/step: {part}")))?;
                let (start_str, end_str) = range_part.split_once('-').ok_or_else(|| Error::Validation(format!("invalid range: {part}")))?;
                let start: u32 = start_str.parse().map_err(|_| Error::Validation(format!("invalid range start: {part}")))?;
                let end: u32 = end_str.parse().map_err(|_| Error::Validation(format!("invalid range end: {part}")))?;
                let step: u32 = step_str.parse().map_err(|_| Error::Validation(format!("invalid step: {part}")))?;
                if step == 0 {
                    return Err(Error::Validation(format!("invalid step: {part}")));
                }
                let mut v = start;
                while v <= end {
                    set(v)?;
                    v += step;
                }
            } else if let Some((start_str, end_str)) = part.split_once('-') {
                let start: u32 = start_str.parse().map_err(|_| Error::Validation(format!("invalid range start: {part}")))?;
                let end: u32 = end_str.parse().map_err(|_| Error::Validation(format!("invalid range end: {part}")))?;
                for v in start..=end {
                    set(v)?;
                }
            } else {
                let v: u32 = part.parse().map_err(|_| Error::Validation(format!("invalid value: {part}")))?;
                set(v)?;
            }
        }
        Ok(Self { values })
    }

    fn matches(&self, value: u32) -> bool {
        (value as usize) < self.values.len() && self.values[value as usize]
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
    raw: String,
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Validation(format!("cron expression must have 5 fields, got {}: '{expr}'", fields.len())));
        }
        let minute = CronField::parse(fields[0], 0, 59)?;
        let hour = CronField::parse(fields[1], 0, 23)?;
        let day = CronField::parse(fields[2], 1, 31)?;
        let month = CronField::parse(fields[3], 1, 12)?;

        // cron weekday: 0=Sunday..6=Saturday. Rust's `Weekday::num_days_from_monday`
        // is 0=Monday..6=Sunday, the same convention Python's `datetime.weekday()`
        // uses, so the conversion is the same as the source's `(v - 1) % 7`.
        let raw_weekday = CronField::parse(fields[4], 0, 6)?;
        let mut weekday = CronField { values: [false; 60] };
        for v in 0..=6u32 {
            if raw_weekday.matches(v) {
                let converted = (v as i64 - 1).rem_euclid(7) as u32;
                weekday.values[converted as usize] = true;
            }
        }

        Ok(Self { minute, hour, day, month, weekday, raw: expr.to_string() })
    }

    fn matches(&self, dt: DateTime<Tz>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day.matches(dt.day())
            && self.month.matches(dt.month())
            && self.weekday.matches(dt.weekday().num_days_from_monday())
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

struct ScheduleEntry {
    flow_id: String,
    cron: Option<CronExpression>,
    interval: Option<Duration>,
    tz: Tz,
    last_executed_at: Option<DateTime<Utc>>,
    next_run_utc: Option<DateTime<Utc>>,
    last_cron_bucket: Option<i64>,
}

impl ScheduleEntry {
    fn should_run(&mut self, now_utc: DateTime<Utc>) -> bool {
        if let Some(cron) = &self.cron {
            let now_local = now_utc.with_timezone(&self.tz);
            let bucket = now_local.year() as i64 * 525_960
                + now_local.month() as i64 * 43_800
                + now_local.day() as i64 * 1_440
                + now_local.hour() as i64 * 60
                + now_local.minute() as i64;
            if self.last_cron_bucket == Some(bucket) {
                return false;
            }
            if cron.matches(now_local) {
                self.last_cron_bucket = Some(bucket);
                return true;
            }
            return false;
        }
        if let Some(interval) = self.interval {
            return match self.next_run_utc {
                Some(next) => now_utc >= next,
                None => {
                    self.next_run_utc = Some(now_utc + chrono::Duration::from_std(interval).unwrap_or_default());
                    false
                }
            };
        }
        false
    }

    fn compute_next_interval(&mut self, now_utc: DateTime<Utc>) {
        let Some(interval) = self.interval else { return };
        let now_local = now_utc.with_timezone(&self.tz);
        let next_local = now_local + chrono::Duration::from_std(interval).unwrap_or_default();
        self.next_run_utc = Some(next_local.with_timezone(&Utc));
    }
}

/// Snapshot of one registered entry for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleStatus {
    pub flow_id: String,
    pub cron: Option<String>,
    pub interval_seconds: Option<u64>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_run_utc: Option<DateTime<Utc>>,
    pub is_running: bool,
}

fn resolve_tz(name: Option<&str>) -> Tz {
    match name {
        Some(n) if !n.is_empty() => n.parse().unwrap_or_else(|_| {
            tracing::warn!(timezone = %n, "invalid timezone, falling back to UTC");
            chrono_tz::UTC
        }),
        _ => chrono_tz::UTC,
    }
}

/// Tick-based flow scheduler. Holds no reference to the kernel; flow
/// execution happens entirely through the injected [`ExecuteCallback`].
pub struct FlowScheduler {
    entries: parking_lot::Mutex<HashMap<String, ScheduleEntry>>,
    running_flows: parking_lot::Mutex<HashSet<String>>,
    execute_callback: ExecuteCallback,
    diagnostics_callback: Option<DiagnosticsCallback>,
    semaphore: Arc<Semaphore>,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FlowScheduler {
    pub fn new(execute_callback: ExecuteCallback, diagnostics_callback: Option<DiagnosticsCallback>) -> Arc<Self> {
        Arc::new(Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
            running_flows: parking_lot::Mutex::new(HashSet::new()),
            execute_callback,
            diagnostics_callback,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_FLOWS)),
            stop: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(true),
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Register a schedule: `schedule_def` must contain either `cron`
    /// (a 5-field string) or `interval_seconds`/`interval` (seconds,
    /// floored to [`MIN_INTERVAL`]), plus an optional `timezone` IANA name.
    pub fn register(&self, flow_id: &str, schedule_def: &Value) -> bool {
        let cron_expr = schedule_def.get("cron").and_then(Value::as_str);
        let interval_raw = schedule_def
            .get("interval_seconds")
            .or_else(|| schedule_def.get("interval"))
            .and_then(Value::as_f64);
        let tz_name = schedule_def.get("timezone").and_then(Value::as_str);

        if cron_expr.is_none() && interval_raw.is_none() {
            return false;
        }

        let cron = match cron_expr.map(CronExpression::parse) {
            Some(Ok(c)) => Some(c),
            Some(Err(error)) => {
                self.diag("scheduler", &format!("scheduler.register.{flow_id}.failed"), "flow_scheduler:register", "failed", Some(error.sanitize()), None);
                return false;
            }
            None => None,
        };

        let interval = interval_raw.map(|secs| Duration::from_secs_f64(secs.max(MIN_INTERVAL.as_secs_f64())));
        let tz = resolve_tz(tz_name);

        let mut entry = ScheduleEntry {
            flow_id: flow_id.to_string(),
            cron,
            interval,
            tz,
            last_executed_at: None,
            next_run_utc: None,
            last_cron_bucket: None,
        };
        if entry.interval.is_some() {
            entry.compute_next_interval(Utc::now());
        }

        let raw_cron = entry.cron.as_ref().map(|c| c.raw().to_string());
        self.entries.lock().insert(flow_id.to_string(), entry);

        self.diag(
            "scheduler",
            &format!("scheduler.register.{flow_id}"),
            "flow_scheduler:register",
            "success",
            None,
            Some(serde_json::json!({"flow_id": flow_id, "cron": raw_cron, "interval_seconds": interval.map(|d| d.as_secs())})),
        );
        true
    }

    pub fn unregister(&self, flow_id: &str) -> bool {
        self.entries.lock().remove(flow_id).is_some()
    }

    /// Spawn the tick loop. A no-op if already running.
    pub fn start(self: &Arc<Self>) {
        if !self.stopped.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if scheduler.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                            break;
                        }
                        scheduler.tick().await;
                    }
                    _ = scheduler.stop.notified() => break,
                }
            }
        });
        *self.task.lock() = Some(handle);
        self.diag("scheduler", "scheduler.start", "flow_scheduler:start", "success", None, Some(serde_json::json!({"entry_count": self.entries.lock().len()})));
    }

    /// Signal the tick loop to stop and wait for in-flight ticks to settle.
    pub async fn stop(self: &Arc<Self>) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stop.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.diag("scheduler", "scheduler.stop", "flow_scheduler:stop", "success", None, None);
    }

    pub fn status(&self) -> Vec<ScheduleStatus> {
        let running = self.running_flows.lock();
        self.entries
            .lock()
            .values()
            .map(|e| ScheduleStatus {
                flow_id: e.flow_id.clone(),
                cron: e.cron.as_ref().map(|c| c.raw().to_string()),
                interval_seconds: e.interval.map(|d| d.as_secs()),
                last_executed_at: e.last_executed_at,
                next_run_utc: e.next_run_utc,
                is_running: running.contains(&e.flow_id),
            })
            .collect()
    }

    async fn tick(self: &Arc<Self>) {
        let now_utc = Utc::now();
        let due: Vec<String> = {
            let mut entries = self.entries.lock();
            let running = self.running_flows.lock();
            entries
                .values_mut()
                .filter(|e| !running.contains(&e.flow_id))
                .filter(|e| e.should_run(now_utc))
                .map(|e| {
                    e.last_executed_at = Some(now_utc);
                    if e.interval.is_some() {
                        e.compute_next_interval(now_utc);
                    }
                    e.flow_id.clone()
                })
                .collect()
        };

        for flow_id in due {
            if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            {
                let mut running = self.running_flows.lock();
                if !running.insert(flow_id.clone()) {
                    continue;
                }
            }
            let scheduler = Arc::clone(self);
            let semaphore = Arc::clone(&self.semaphore);
            tokio::spawn(async move {
                let permit = semaphore.acquire_owned().await;
                if permit.is_ok() {
                    scheduler.execute_flow(&flow_id).await;
                }
                drop(permit);
                scheduler.running_flows.lock().remove(&flow_id);
            });
        }
    }

    async fn execute_flow(&self, flow_id: &str) {
        self.diag("scheduler", &format!("scheduler.execute.{flow_id}.start"), "flow_scheduler:execute", "success", None, Some(serde_json::json!({"flow_id": flow_id})));

        let context = serde_json::json!({"_triggered_by": "scheduler"});
        let outcome = (self.execute_callback)(flow_id.to_string(), context).await;

        match outcome {
            Ok(value) => {
                let failed = value.get("_error").map(|v| !v.is_null() && v != &Value::Bool(false)).unwrap_or(false);
                let status = if failed { "failed" } else { "success" };
                self.diag(
                    "scheduler",
                    &format!("scheduler.execute.{flow_id}.done"),
                    "flow_scheduler:execute",
                    status,
                    None,
                    Some(serde_json::json!({"flow_id": flow_id, "has_error": failed})),
                );
            }
            Err(error) => {
                self.diag(
                    "scheduler",
                    &format!("scheduler.execute.{flow_id}.error"),
                    "flow_scheduler:execute",
                    "failed",
                    Some(error.sanitize()),
                    None,
                );
            }
        }
    }

    fn diag(&self, phase: &'static str, step_id: &str, handler: &'static str, status: &'static str, error: Option<String>, meta: Option<Value>) {
        if let Some(callback) = &self.diagnostics_callback {
            callback(SchedulerDiagnostic { phase, step_id: step_id.to_string(), handler, status, error, meta });
        }
    }
}
