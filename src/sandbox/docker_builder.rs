//! DockerRunBuilder — immutable security-baseline `docker run` argv builder.
//!
//! Grounded on `core_runtime/docker_run_builder.py`. Every container this
//! kernel launches goes through this builder so the hardening flags below
//! are never forgotten: no capabilities, no new privileges, a read-only
//! root filesystem, a tiny noexec/nosuid tmpfs for scratch space, and (for
//! the common `--network=none` case) a loopback DNS resolver as
//! defense-in-depth against DNS-based egress even though there is no
//! network to resolve over.
//!
//! The Python source hardcodes memory/cpus to fixed defaults with no
//! setters; this port adds [`DockerRunBuilder::memory`] and
//! [`DockerRunBuilder::cpus`] because `DockerCapabilityHandler` computes an
//! effective, grant-bounded value per request and must be able to inject it
//! into the built argv (see `docker_capability.rs`).

use crate::error::{Error, Result};

pub const DEFAULT_MEMORY: &str = "256m";
pub const DEFAULT_MEMORY_SWAP: &str = "256m";
pub const DEFAULT_CPUS: &str = "0.5";
pub const DEFAULT_PIDS_LIMIT: u32 = 50;
pub const DEFAULT_USER: &str = "65534:65534";
pub const DEFAULT_NETWORK: &str = "none";
pub const DEFAULT_TMPFS: &str = "/tmp:size=64m,noexec,nosuid";

/// Builds the argv for a single `docker run` invocation, applying the
/// security baseline unconditionally.
pub struct DockerRunBuilder {
    name: String,
    memory: String,
    memory_swap: String,
    cpus: String,
    network: String,
    pids_limit: u32,
    user: String,
    ulimits: Vec<String>,
    volumes: Vec<String>,
    envs: Vec<(String, String)>,
    group_adds: Vec<String>,
    workdir: Option<String>,
    labels: Vec<(String, String)>,
    image: Option<String>,
    command: Vec<String>,
}

impl DockerRunBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory: DEFAULT_MEMORY.to_string(),
            memory_swap: DEFAULT_MEMORY_SWAP.to_string(),
            cpus: DEFAULT_CPUS.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            pids_limit: DEFAULT_PIDS_LIMIT,
            user: DEFAULT_USER.to_string(),
            ulimits: Vec::new(),
            volumes: Vec::new(),
            envs: Vec::new(),
            group_adds: Vec::new(),
            workdir: None,
            labels: Vec::new(),
            image: None,
            command: Vec::new(),
        }
    }

    #[must_use]
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    #[must_use]
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self.memory_swap = self.memory.clone();
        self
    }

    #[must_use]
    pub fn cpus(mut self, cpus: impl Into<String>) -> Self {
        self.cpus = cpus.into();
        self
    }

    #[must_use]
    pub fn pids_limit(mut self, pids_limit: u32) -> Self {
        self.pids_limit = pids_limit;
        self
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub fn ulimit(mut self, spec: impl Into<String>) -> Self {
        self.ulimits.push(spec.into());
        self
    }

    #[must_use]
    pub fn volume(mut self, host_path: impl AsRef<str>, container_path: impl AsRef<str>, mode: &str) -> Self {
        self.volumes.push(format!("{}:{}:{}", host_path.as_ref(), container_path.as_ref(), mode));
        self
    }

    /// Mount a host file read-only. The Python source prefers a file mount
    /// over an environment variable for secret material to avoid leaking it
    /// through `docker inspect` or `/proc/<pid>/environ`.
    #[must_use]
    pub fn secret_file(self, host_path: impl AsRef<str>, container_path: impl AsRef<str>) -> Self {
        self.volume(host_path, container_path, "ro")
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn group_add(mut self, group: impl Into<String>) -> Self {
        self.group_adds.push(group.into());
        self
    }

    #[must_use]
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Assemble the final `docker run ...` argv. Errors if no image was
    /// set.
    pub fn build(&self) -> Result<Vec<String>> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| Error::Validation("DockerRunBuilder requires an image".to_string()))?;

        let mut cmd = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", self.name),
            format!("--network={}", self.network),
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges:true".to_string(),
            "--read-only".to_string(),
        ];
        if self.network == "none" {
            cmd.push("--dns=127.0.0.1".to_string());
        }
        cmd.push(format!("--tmpfs={DEFAULT_TMPFS}"));
        cmd.push(format!("--memory={}", self.memory));
        cmd.push(format!("--memory-swap={}", self.memory_swap));
        cmd.push(format!("--cpus={}", self.cpus));
        cmd.push(format!("--pids-limit={}", self.pids_limit));
        cmd.push(format!("--user={}", self.user));

        for u in &self.ulimits {
            cmd.push(format!("--ulimit={u}"));
        }
        for v in &self.volumes {
            cmd.push("-v".to_string());
            cmd.push(v.clone());
        }
        for (k, v) in &self.envs {
            cmd.push("-e".to_string());
            cmd.push(format!("{k}={v}"));
        }
        for g in &self.group_adds {
            cmd.push(format!("--group-add={g}"));
        }
        if let Some(w) = &self.workdir {
            cmd.push("-w".to_string());
            cmd.push(w.clone());
        }
        for (k, v) in &self.labels {
            cmd.push("--label".to_string());
            cmd.push(format!("{k}={v}"));
        }
        cmd.push(image.clone());
        cmd.extend(self.command.iter().cloned());

        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_image() {
        let builder = DockerRunBuilder::new("c1");
        assert!(builder.build().is_err());
    }

    #[test]
    fn default_baseline_hardens_by_default() {
        let cmd = DockerRunBuilder::new("c1")
            .image("python:3.11-slim")
            .command(vec!["true".to_string()])
            .build()
            .unwrap();

        assert!(cmd.contains(&"--cap-drop=ALL".to_string()));
        assert!(cmd.contains(&"--security-opt=no-new-privileges:true".to_string()));
        assert!(cmd.contains(&"--read-only".to_string()));
        assert!(cmd.contains(&"--network=none".to_string()));
        assert!(cmd.contains(&"--dns=127.0.0.1".to_string()));
        assert!(cmd.iter().any(|a| a == &format!("--memory={DEFAULT_MEMORY}")));
    }

    #[test]
    fn bridge_network_omits_dns_override() {
        let cmd = DockerRunBuilder::new("c1")
            .network("bridge")
            .image("alpine")
            .command(vec!["true".to_string()])
            .build()
            .unwrap();
        assert!(!cmd.iter().any(|a| a.contains("--dns=")));
    }

    #[test]
    fn memory_and_cpus_setters_override_defaults() {
        let cmd = DockerRunBuilder::new("c1")
            .memory("512m")
            .cpus("1.0")
            .image("alpine")
            .command(vec!["true".to_string()])
            .build()
            .unwrap();
        assert!(cmd.contains(&"--memory=512m".to_string()));
        assert!(cmd.contains(&"--memory-swap=512m".to_string()));
        assert!(cmd.contains(&"--cpus=1.0".to_string()));
    }

    #[test]
    fn argv_order_is_deterministic() {
        let cmd = DockerRunBuilder::new("c1")
            .volume("/host/a", "/a", "ro")
            .env("FOO", "bar")
            .workdir("/work")
            .label("rumi.managed", "true")
            .image("alpine")
            .command(vec!["echo".to_string(), "hi".to_string()])
            .build()
            .unwrap();

        let image_idx = cmd.iter().position(|a| a == "alpine").unwrap();
        assert_eq!(cmd[image_idx + 1], "echo");
        assert_eq!(cmd[image_idx + 2], "hi");
        assert!(cmd.iter().position(|a| a == "-v").unwrap() < image_idx);
    }
}
