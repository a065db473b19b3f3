//! DockerCapabilityHandler — the only path through which a pack reaches
//! `docker run`. Every invocation is quota-checked against
//! [`CapabilityUsageStore`], capped at the absolute resource ceilings below
//! regardless of what a grant's config requests, and tracked against a
//! per-principal concurrency limit so one pack cannot starve the host by
//! launching containers faster than they exit.
//!
//! Grounded on `core_runtime/docker_capability.py`. The absolute ceilings
//! (memory, cpus, pids) are this port's hard backstop: a grant's `config`
//! blob may request less than the ceiling but never more.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::grants::capability::CapabilityGrantManager;
use crate::sandbox::docker_builder::DockerRunBuilder;
use crate::sandbox::secure_executor::{ExecutionOutput, SecureExecutor};
use crate::usage::CapabilityUsageStore;

/// Absolute ceilings no grant config may exceed.
pub const MAX_MEMORY_MB: u64 = 1024;
pub const MAX_CPUS: f64 = 2.0;
pub const MAX_PIDS: u32 = 200;
pub const DEFAULT_MAX_CONCURRENT_PER_PRINCIPAL: u32 = 2;

pub const PERMISSION_ID: &str = "docker.run";

/// The subset of a `docker.run` capability grant's `config` blob this
/// handler honors. Anything absent falls back to the builder's own
/// defaults, clamped to the absolute ceilings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerRunGrantConfig {
    pub memory_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub pids_limit: Option<u32>,
    #[serde(default)]
    pub allowed_images: Vec<String>,
    pub max_concurrent: Option<u32>,
    pub max_count: Option<u64>,
    pub max_daily: Option<u64>,
}

/// A single `docker.run` request from a pack.
pub struct DockerRunRequest {
    pub principal_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub scope_key: String,
    pub timeout: Duration,
}

fn clamp_memory_mb(requested: Option<u64>) -> u64 {
    requested.unwrap_or(256).min(MAX_MEMORY_MB)
}

fn clamp_cpus(requested: Option<f64>) -> f64 {
    requested.unwrap_or(0.5).clamp(0.0, MAX_CPUS)
}

fn clamp_pids(requested: Option<u32>) -> u32 {
    requested.unwrap_or(50).min(MAX_PIDS)
}

/// Gates pack-requested `docker run` invocations behind quota accounting,
/// per-principal concurrency limits, and the absolute resource ceilings.
pub struct DockerCapabilityHandler {
    capability_grants: Arc<CapabilityGrantManager>,
    usage: Arc<CapabilityUsageStore>,
    executor: Arc<SecureExecutor>,
    in_flight: Mutex<HashMap<String, Arc<AtomicU32>>>,
}

impl DockerCapabilityHandler {
    pub fn new(capability_grants: Arc<CapabilityGrantManager>, usage: Arc<CapabilityUsageStore>, executor: Arc<SecureExecutor>) -> Self {
        Self { capability_grants, usage, executor, in_flight: Mutex::new(HashMap::new()) }
    }

    fn counter_for(&self, principal_id: &str) -> Arc<AtomicU32> {
        self.in_flight.lock().entry(principal_id.to_string()).or_insert_with(|| Arc::new(AtomicU32::new(0))).clone()
    }

    /// Run `request.image`/`request.command` under the security baseline,
    /// after checking the capability grant, quota, concurrency limit, and
    /// the allowed-images allowlist if the grant's config names one.
    pub async fn run(&self, request: DockerRunRequest) -> Result<ExecutionOutput> {
        let config_value = self
            .capability_grants
            .check_access(&request.principal_id, PERMISSION_ID)
            .ok_or_else(|| Error::Authorization(format!("{} has no {PERMISSION_ID} grant", request.principal_id)))?;
        let config: DockerRunGrantConfig = serde_json::from_value(config_value).unwrap_or_default();

        if !config.allowed_images.is_empty() && !config.allowed_images.iter().any(|i| i == &request.image) {
            return Err(Error::Authorization(format!("image '{}' not in grant's allowed_images", request.image)));
        }

        let consume = self.usage.check_and_consume(
            &request.principal_id,
            PERMISSION_ID,
            &request.scope_key,
            config.max_count.unwrap_or(0),
            config.max_daily.unwrap_or(0),
            None,
        );
        if !consume.allowed {
            let reason = consume.reason.map(|r| r.as_str()).unwrap_or("denied");
            return Err(Error::Authorization(format!("docker.run quota exceeded: {reason}")));
        }

        let max_concurrent = config.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT_PER_PRINCIPAL);
        let counter = self.counter_for(&request.principal_id);
        let running = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if running > max_concurrent {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Resource(format!(
                "{} already has {max_concurrent} concurrent docker.run containers",
                request.principal_id
            )));
        }

        let result = self.run_container(&request, &config).await;
        counter.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_container(&self, request: &DockerRunRequest, config: &DockerRunGrantConfig) -> Result<ExecutionOutput> {
        let name = format!("rumi-{}-{}", sanitize_name(&request.principal_id), uuid::Uuid::new_v4().simple());
        let memory_mb = clamp_memory_mb(config.memory_mb);
        let cpus = clamp_cpus(config.cpus);
        let pids = clamp_pids(config.pids_limit);

        let builder = DockerRunBuilder::new(name)
            .memory(format!("{memory_mb}m"))
            .cpus(format!("{cpus}"))
            .pids_limit(pids)
            .label("rumi.principal", &request.principal_id)
            .image(&request.image)
            .command(request.command.clone());

        self.executor.run(&builder, request.timeout).await
    }
}

fn sanitize_name(principal_id: &str) -> String {
    principal_id.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}
