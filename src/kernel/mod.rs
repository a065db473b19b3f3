//! KernelCore — assembles every governance and execution manager this crate
//! defines into one runtime object.
//!
//! Grounded on `core_runtime/kernel.py`'s `Kernel` class: one object owns
//! every manager, wires the built-in `kernel:*` handlers into the flow
//! executor, and exposes the operations an embedder actually needs — scan
//! and approve packs, run a flow, start the scheduler and the per-pack/
//! per-principal Unix-domain-socket listeners. `FlowModifierLoader`/
//! `FlowModifierApplier` borrow the managers they need rather than owning
//! them, so neither is kept as a field here; both are built on the stack
//! inside [`KernelCore::reload_modifiers`]/[`KernelCore::compose_flow`] and
//! dropped before the call returns.

pub mod context;
pub mod executor;
pub mod handlers;
pub mod variables;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::approval::ApprovalManager;
use crate::audit::AuditLog;
use crate::composer::FlowComposer;
use crate::config::KernelConfig;
use crate::di::DiContainer;
use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use crate::flow::{FlowDefinition, FlowLoader};
use crate::grants::capability::CapabilityGrantManager;
use crate::grants::host_privilege::HostPrivilegeGrantManager;
use crate::grants::network::NetworkGrantManager;
use crate::grants::secrets::SecretsGrantManager;
use crate::health::HealthChecker;
use crate::install_journal::InstallJournal;
use crate::installers::{CapabilityInstaller, LibExecutor, PipInstaller};
use crate::interface_registry::{HandlerFn, InterfaceRegistry, RegisteredValue};
use crate::lifecycle::ComponentLifecycleExecutor;
use crate::modifier::{AvailabilityChecker, FlowModifierApplier, FlowModifierDef, FlowModifierLoader};
use crate::pack_applier::PackApplier;
use crate::paths::PathResolver;
use crate::registry::PackRegistry;
use crate::sandbox::{DockerCapabilityHandler, SecureExecutor};
use crate::scheduler::{ExecuteCallback, FlowScheduler};
use crate::signer::HmacSigner;
use crate::usage::CapabilityUsageStore;

use self::context::{ContextBuilder, RunIds};
use self::executor::{FlowExecutor, FlowRunOutcome};
use self::handlers::builtin_handlers;

/// Checks interface/capability availability for one principal. Built fresh
/// per [`KernelCore::compose_flow`] call rather than stored, since
/// [`FlowModifierApplier`] only needs it for the duration of one `apply`.
struct KernelAvailability {
    registry: Arc<InterfaceRegistry>,
    capability_grants: Arc<CapabilityGrantManager>,
    principal_id: String,
}

impl AvailabilityChecker for KernelAvailability {
    fn has_interface(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    fn has_capability(&self, name: &str) -> bool {
        self.capability_grants.check_access(&self.principal_id, name).is_some()
    }
}

/// Assembles every manager this crate defines into one runtime object. Cheap
/// to clone the `Arc<KernelCore>` the constructor returns; the object itself
/// is not `Clone`.
pub struct KernelCore {
    pub config: KernelConfig,
    pub resolver: PathResolver,
    pub signer: HmacSigner,

    pub registry: RwLock<PackRegistry>,
    pub approval: Arc<ApprovalManager>,

    pub network_grants: Arc<NetworkGrantManager>,
    pub secrets_grants: Arc<SecretsGrantManager>,
    pub capability_grants: Arc<CapabilityGrantManager>,
    pub host_privilege_grants: Arc<HostPrivilegeGrantManager>,
    pub usage: Arc<CapabilityUsageStore>,

    pub audit: AuditLog,
    pub event_bus: Arc<EventBus>,
    pub interface_registry: Arc<InterfaceRegistry>,
    pub di: Arc<DiContainer>,

    pub flow_loader: Arc<FlowLoader>,
    modifiers: RwLock<BTreeMap<String, FlowModifierDef>>,
    pub composer: Arc<FlowComposer>,

    kernel_handlers: Arc<HashMap<String, HandlerFn>>,
    pub executor: Arc<FlowExecutor>,
    pub scheduler: Arc<FlowScheduler>,

    pub lifecycle: Arc<ComponentLifecycleExecutor>,
    pub secure_executor: Arc<SecureExecutor>,
    pub docker_capability: Arc<DockerCapabilityHandler>,

    pub install_journal: Arc<InstallJournal>,
    pub pack_applier: Arc<PackApplier>,
    pub lib_executor: Arc<LibExecutor>,
    pub pip_installer: Arc<PipInstaller>,
    pub capability_installer: Arc<CapabilityInstaller>,

    pub health: Arc<HealthChecker>,
}

impl KernelCore {
    /// Build every manager and wire them together. Does not scan packs,
    /// load flows/modifiers, or start the scheduler/sockets — call
    /// [`Self::scan`] and [`Self::start`] once the returned kernel is in an
    /// `Arc`.
    pub fn new(root: impl Into<std::path::PathBuf>, config: KernelConfig) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Validation)?;
        let resolver = PathResolver::new(root);
        let signer = HmacSigner::load_or_create(&resolver.permissions_dir(), config.hmac_secret_override.as_deref())?;

        let approval = Arc::new(ApprovalManager::new(resolver.clone(), signer.clone()));
        let network_grants = Arc::new(NetworkGrantManager::new(&resolver, signer.clone()));
        let secrets_grants = Arc::new(SecretsGrantManager::new(&resolver, signer.clone()));
        let capability_grants = Arc::new(CapabilityGrantManager::new(&resolver, signer.clone()));
        let host_privilege_grants = Arc::new(HostPrivilegeGrantManager::new(&resolver, signer.clone()));
        let usage = Arc::new(CapabilityUsageStore::new(&resolver, signer.clone()));

        let audit = AuditLog::new(resolver.audit_dir());
        let event_bus = Arc::new(EventBus::new());
        let interface_registry = Arc::new(InterfaceRegistry::new(&resolver, config.block_protected_keys));
        let di = Arc::new(DiContainer::new());

        let flow_loader = Arc::new(FlowLoader::new(resolver.clone()));

        let kernel_handlers = Arc::new(builtin_handlers(interface_registry.clone(), event_bus.clone()));
        let executor = Arc::new(FlowExecutor::new(interface_registry.clone(), kernel_handlers.clone(), None));

        let callback: ExecuteCallback = {
            let flow_loader = flow_loader.clone();
            let executor = executor.clone();
            let config = config.clone();
            Arc::new(move |flow_id: String, step_input: Value| {
                let flow_loader = flow_loader.clone();
                let executor = executor.clone();
                let config = config.clone();
                Box::pin(async move {
                    let flow = flow_loader
                        .get(&flow_id)
                        .ok_or_else(|| Error::Validation(format!("unknown flow '{flow_id}'")))?;
                    let ids = RunIds { flow_id: flow_id.clone(), run_id: uuid::Uuid::new_v4().to_string(), chat_id: None };
                    let ctx_builder = ContextBuilder::new(&config);
                    let ctx = ctx_builder.build("scheduled", &ids, None, &flow.defaults, &Default::default(), &step_input);
                    let outcome = tokio::task::spawn_blocking(move || executor.execute(&flow, ctx, &[flow_id]))
                        .await
                        .map_err(|e| Error::Internal(e.to_string()))??;
                    Ok(outcome.ctx)
                })
            })
        };
        let scheduler = FlowScheduler::new(callback, None);

        let install_journal = Arc::new(InstallJournal::new(resolver.clone()));
        let lifecycle = Arc::new(ComponentLifecycleExecutor::new(install_journal.clone()));
        let secure_executor = Arc::new(SecureExecutor::new(config.security_mode));
        let docker_capability = Arc::new(DockerCapabilityHandler::new(capability_grants.clone(), usage.clone(), secure_executor.clone()));

        let pack_applier = Arc::new(PackApplier::new(resolver.clone(), approval.clone(), &resolver.audit_dir()));
        let lib_executor = Arc::new(LibExecutor::new(resolver.clone(), approval.clone(), install_journal.clone()));
        let pip_installer = Arc::new(PipInstaller::new(resolver.clone(), signer.clone(), install_journal.clone()));
        let capability_installer = Arc::new(CapabilityInstaller::new(approval.clone(), capability_grants.clone(), install_journal.clone()));

        let health = Arc::new(HealthChecker::new(Duration::from_secs(5)));
        health.register("disk_space", crate::health::probe_disk_space(resolver.root(), 100 * 1024 * 1024));
        health.register("memory", crate::health::probe_memory(90.0));
        health.register("user_data_writable", crate::health::probe_file_writable(resolver.user_data_dir()));

        Ok(Arc::new(Self {
            config,
            resolver,
            signer,
            registry: RwLock::new(PackRegistry::new()),
            approval,
            network_grants,
            secrets_grants,
            capability_grants,
            host_privilege_grants,
            usage,
            audit,
            event_bus,
            interface_registry,
            di,
            flow_loader,
            modifiers: RwLock::new(BTreeMap::new()),
            composer: Arc::new(FlowComposer::new()),
            kernel_handlers,
            executor,
            scheduler,
            lifecycle,
            secure_executor,
            docker_capability,
            install_journal,
            pack_applier,
            lib_executor,
            pip_installer,
            capability_installer,
            health,
        }))
    }

    /// Rescan the ecosystem tree and the approval ledger, returning the
    /// discovered pack ids. Safe to call repeatedly; both indexes are
    /// rebuilt wholesale rather than mutated incrementally.
    pub fn scan(&self) -> Result<Vec<String>> {
        let ids = self.registry.write().scan(&self.resolver)?;
        self.approval.scan()?;
        Ok(ids)
    }

    /// Load every `*.flow.yaml` file under the official and ecosystem flow
    /// directories, rejecting a legacy `ecosystem/flows/` tree outright.
    pub fn load_flows(&self) -> Result<crate::flow::FlowLoadReport> {
        self.flow_loader.load_all()
    }

    /// Reload every modifier file the resolver can see, gated by pack
    /// approval state, and cache the result for [`Self::compose_flow`].
    /// The loader borrows [`Self::approval`]/[`Self::network_grants`] only
    /// for the duration of this call.
    pub fn reload_modifiers(&self) -> crate::modifier::ModifierLoadReport {
        let loader = FlowModifierLoader::new(self.resolver.clone(), self.config.clone()).with_managers(&self.approval, &self.network_grants);
        let report = loader.load_all();
        *self.modifiers.write() = loader.all();
        report
    }

    /// Apply every cached modifier targeting `flow.flow_id` (gated on
    /// interface/capability availability for `principal_id`), returning the
    /// composed flow plus the apply/conflict report. The applier and its
    /// availability checker are built transiently and never stored.
    pub fn compose_flow(&self, flow: &FlowDefinition, principal_id: &str) -> (FlowDefinition, Vec<crate::modifier::ModifierApplyResult>, Vec<crate::modifier::ModifierConflict>) {
        let modifiers = {
            let cache = self.modifiers.read();
            let mut matches: Vec<FlowModifierDef> = cache.values().filter(|m| crate::modifier::glob_match(&m.target_flow_id, &flow.flow_id)).cloned().collect();
            matches.sort_by(|a, b| a.phase.cmp(&b.phase).then(a.priority.cmp(&b.priority)).then(a.modifier_id.cmp(&b.modifier_id)));
            matches
        };
        let availability = KernelAvailability {
            registry: self.interface_registry.clone(),
            capability_grants: self.capability_grants.clone(),
            principal_id: principal_id.to_string(),
        };
        let applier = FlowModifierApplier::new(&availability);
        let (composed, results, conflicts) = applier.apply(flow, &modifiers);
        for result in &results {
            if result.success {
                self.composer.record_applied(&result.modifier_id, None);
            }
        }
        (composed, results, conflicts)
    }

    /// Run `flow_id` to completion against a fresh context stamped from
    /// `step_input`, composing modifiers for `principal_id` first. Executed
    /// on a blocking thread since [`FlowExecutor::execute`] is synchronous.
    pub async fn run_flow(self: &Arc<Self>, flow_id: &str, principal_id: &str, chat_id: Option<String>, step_input: Value) -> Result<FlowRunOutcome> {
        let flow = self
            .flow_loader
            .get(flow_id)
            .ok_or_else(|| Error::Validation(format!("unknown flow '{flow_id}'")))?;
        let (composed, _results, _conflicts) = self.compose_flow(&flow, principal_id);

        let ids = RunIds { flow_id: flow_id.to_string(), run_id: uuid::Uuid::new_v4().to_string(), chat_id };
        let ctx_builder = ContextBuilder::new(&self.config);
        let ctx = ctx_builder.build("run", &ids, None, &composed.defaults, &Default::default(), &step_input);

        let executor = self.executor.clone();
        let flow_id = flow_id.to_string();
        tokio::task::spawn_blocking(move || executor.execute(&composed, ctx, &[flow_id]))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    /// Register `key` as ordinary data, subject to the protected-key ACL.
    pub fn register_data(&self, key: &str, value: Value, meta: Option<serde_json::Map<String, Value>>) -> Result<()> {
        self.interface_registry.register(key, RegisteredValue::Data(value), meta)
    }

    /// Start the flow scheduler's tick loop. `self` must be held as an
    /// `Arc` for the scheduler's own internal `Arc<Self>` requirement.
    pub fn start(self: &Arc<Self>) {
        self.scheduler.start();
    }

    /// Stop the flow scheduler, awaiting any in-flight scheduled run.
    pub async fn stop(self: &Arc<Self>) {
        self.scheduler.stop().await;
    }

    /// Run every component's lifecycle phases in order
    /// (`dependency -> setup -> runtime_boot`), via `runner`.
    pub async fn run_lifecycle(&self, runner: &crate::lifecycle::ComponentPhaseRunner) -> Vec<crate::lifecycle::PhaseReport> {
        let mut reports = Vec::with_capacity(crate::lifecycle::PHASES.len());
        let registry = self.registry.read();
        for phase in crate::lifecycle::PHASES {
            reports.push(self.lifecycle.run_phase(phase, &registry, runner).await);
        }
        reports
    }

    /// Aggregate health across every registered probe.
    pub async fn health_report(&self) -> crate::health::HealthReport {
        self.health.check_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_assembles_every_manager_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::for_testing();
        config.hmac_secret_override = Some("a".repeat(32));
        let kernel = KernelCore::new(dir.path(), config).unwrap();
        assert!(kernel.scan().unwrap().is_empty());
        assert_eq!(kernel.health_report().await.status, crate::health::HealthStatus::Up);
    }

    #[tokio::test]
    async fn run_flow_executes_a_loaded_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::for_testing();
        config.hmac_secret_override = Some("a".repeat(32));
        let kernel = KernelCore::new(dir.path(), config).unwrap();

        let resolver = kernel.resolver.clone();
        std::fs::create_dir_all(resolver.official_flows_dir()).unwrap();
        std::fs::write(
            resolver.official_flows_dir().join("greet.flow.yaml"),
            "flow_id: greet\nphases: [main]\nsteps:\n  - id: s1\n    phase: main\n    type: handler\n    handler: kernel:noop\n    output: ran\n",
        )
        .unwrap();

        kernel.load_flows().unwrap();
        let outcome = kernel.run_flow("greet", "pack-a", None, Value::Null).await.unwrap();
        assert!(!outcome.aborted);
        assert_eq!(outcome.ctx["ran"], Value::Null);
    }
}
