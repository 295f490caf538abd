//! Lifecycle orchestration: one `reconcile` call takes the host from whatever
//! is running to exactly the services a manifest needs.
//!
//! A pass always runs purge, then spawn, then wait, then warm-up. A failure at
//! any step releases everything the pass spawned before the error is returned.

use {
    crate::{
        Admission, AdmissionRequest, CalibrationStore, Catalog, Endpoint, Engine, FleetConfig,
        FleetError, GpuMemory, GpuMonitor, Health, HealthReconciler, Launcher, Manifest, PortEntry,
        PurgeReason, Result, ServiceDescriptor, ServiceKind, Supervisor, WaitOutcome, admit,
        plan_purge,
    },
    base::log,
    std::{collections::HashSet, fmt, sync::Mutex, time::Duration},
    tokio::time::Instant,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Purging,
    Spawning,
    Waiting,
    WarmingUp,
    Ready,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::Purging => "PURGING",
            LifecycleState::Spawning => "SPAWNING",
            LifecycleState::Waiting => "WAITING",
            LifecycleState::WarmingUp => "WARMING_UP",
            LifecycleState::Ready => "READY",
            LifecycleState::Failed => "FAILED",
        })
    }
}

/// Receives lifecycle progress from a reconciliation.
pub trait ReportSink: Send + Sync {
    fn transition(&self, _state: LifecycleState) {}
    fn report(&self, _report: &ReconcileReport) {}
    fn failed(&self, _error: &FleetError) {}
}

/// Writes progress to the log.
pub struct LogSink;

impl ReportSink for LogSink {
    fn transition(&self, state: LifecycleState) {
        log::info!("lifecycle: {}", state);
    }

    fn report(&self, report: &ReconcileReport) {
        log::info!(
            "ready in {:.1}s: {} killed, {} spawned, {:.2} GB in use before",
            report.setup_time.as_secs_f64(),
            report.killed.len(),
            report.spawned.len(),
            report.prior_used_gb
        );
    }

    fn failed(&self, error: &FleetError) {
        log::error!("lifecycle failed: {}", error);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReconcileOptions {
    pub purge_on_entry: bool,
    pub allow_download: bool,
}

impl From<&FleetConfig> for ReconcileOptions {
    fn from(config: &FleetConfig) -> Self {
        Self {
            purge_on_entry: config.purge_on_entry,
            allow_download: config.allow_download,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcileReport {
    pub setup_time: Duration,
    /// GPU memory in use before anything was purged.
    pub prior_used_gb: f64,
    pub killed: Vec<(u16, PurgeReason)>,
    pub spawned: Vec<u16>,
    pub admission: Admission,
    pub services: Vec<ServiceDescriptor>,
}

pub struct Orchestrator<E: Endpoint, L: Launcher, G: GpuMonitor> {
    catalog: Catalog,
    calibration: CalibrationStore,
    health: HealthReconciler<E>,
    supervisor: Supervisor<L>,
    gpu: G,
    state: Mutex<LifecycleState>,
    pass: tokio::sync::Mutex<()>,
}

impl<E: Endpoint, L: Launcher, G: GpuMonitor> Orchestrator<E, L, G> {
    pub fn new(
        config: FleetConfig,
        calibration: CalibrationStore,
        endpoint: E,
        launcher: L,
        gpu: G,
    ) -> Self {
        Self {
            health: HealthReconciler::new(endpoint, config.poll_interval),
            supervisor: Supervisor::new(launcher, config.log_dir.clone()),
            catalog: Catalog::new(config),
            calibration,
            gpu,
            state: Mutex::new(LifecycleState::Idle),
            pass: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        self.catalog.config()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn supervisor(&self) -> &Supervisor<L> {
        &self.supervisor
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, state: LifecycleState, sink: &dyn ReportSink) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        sink.transition(state);
    }

    /// Probe every registry port at once.
    pub async fn status(&self) -> Vec<(PortEntry, Health)> {
        self.health.snapshot(&self.catalog.registry()).await
    }

    /// Bring the host to exactly the services `manifest` needs.
    pub async fn reconcile(
        &self,
        manifest: &Manifest,
        options: ReconcileOptions,
        sink: &dyn ReportSink,
    ) -> Result<ReconcileReport> {
        let _pass = self.pass.lock().await;
        let started = Instant::now();
        let mut spawned = Vec::new();
        log::info!("reconciling {}", manifest);
        match self.run(manifest, options, sink, &mut spawned).await {
            Ok(mut report) => {
                report.setup_time = started.elapsed();
                self.enter(LifecycleState::Ready, sink);
                sink.report(&report);
                Ok(report)
            }
            Err(error) => {
                if !spawned.is_empty() {
                    log::warn!("tearing down {} services spawned this pass", spawned.len());
                    self.supervisor.release(&spawned).await;
                }
                self.enter(LifecycleState::Failed, sink);
                sink.failed(&error);
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        manifest: &Manifest,
        options: ReconcileOptions,
        sink: &dyn ReportSink,
        spawned: &mut Vec<u16>,
    ) -> Result<ReconcileReport> {
        let config = self.catalog.config();
        self.enter(LifecycleState::Purging, sink);

        let gpu = match self.gpu.memory().await {
            Ok(gpu) => gpu,
            Err(e) => {
                log::warn!("{}; admission runs without memory figures", e);
                GpuMemory::default()
            }
        };
        let admission = admit(
            &AdmissionRequest {
                model: &manifest.llm.model,
                engine: manifest.llm.engine,
                context: manifest.llm.context,
            },
            &self.calibration,
            gpu,
            &config.admission,
        );
        let required = self.catalog.required(manifest, &admission);

        let registry = self.catalog.registry();
        let snapshot = self.health.snapshot(&registry).await;
        let resident = self.supervisor.resident().await;
        let killed = plan_purge(&required, &snapshot, &resident, options.purge_on_entry);
        for (port, reason) in &killed {
            self.supervisor.kill(*port, *reason).await?;
        }
        if !killed.is_empty() {
            let closing: Vec<PortEntry> = registry
                .iter()
                .filter(|e| killed.iter().any(|(port, _)| *port == e.port))
                .copied()
                .collect();
            let open = self
                .health
                .wait_closed(&closing, config.startup_timeout)
                .await;
            if let Some(port) = open.first() {
                return Err(FleetError::PortConflict {
                    port: *port,
                    reason: "still in use after purge".into(),
                });
            }
        }

        let killed_ports: HashSet<u16> = killed.iter().map(|(port, _)| *port).collect();
        let missing: Vec<&ServiceDescriptor> = required
            .iter()
            .filter(|s| {
                killed_ports.contains(&s.port)
                    || !snapshot
                        .iter()
                        .any(|(e, h)| e.port == s.port && h.status.is_up())
            })
            .collect();

        self.enter(LifecycleState::Spawning, sink);
        for service in &missing {
            self.preflight(service, options).await?;
        }
        for service in &missing {
            self.supervisor.spawn(service).await?;
            spawned.push(service.port);
        }

        self.enter(LifecycleState::Waiting, sink);
        let waiting: Vec<PortEntry> = missing.iter().map(|s| s.entry()).collect();
        match self.health.wait_all(&waiting, config.startup_timeout).await {
            WaitOutcome::Ready => {}
            WaitOutcome::TimedOut { pending } => {
                let port = pending.first().copied().unwrap_or_default();
                return Err(FleetError::StartupTimeout {
                    service: service_name(&required, port),
                    port,
                    waited: config.startup_timeout,
                });
            }
            WaitOutcome::Crashed { port } => {
                return Err(FleetError::StartupCrashed {
                    service: service_name(&required, port),
                    port,
                });
            }
        }

        let llm = required.iter().find(|s| s.kind == ServiceKind::Llm);
        if let Some(llm) = llm.filter(|s| s.engine == Some(Engine::Ollama)) {
            self.ensure_pulled(llm, options).await?;
        }

        self.enter(LifecycleState::WarmingUp, sink);
        for service in missing.iter().filter(|s| s.kind == ServiceKind::Llm) {
            if let Err(e) = self.health.endpoint().warm_up(service).await {
                log::warn!("{}", e);
            }
        }

        Ok(ReconcileReport {
            setup_time: Duration::ZERO,
            prior_used_gb: gpu.used_gb,
            killed,
            spawned: spawned.clone(),
            admission,
            services: required,
        })
    }

    /// Checks that must pass before a service is worth spawning.
    async fn preflight(&self, service: &ServiceDescriptor, options: ReconcileOptions) -> Result<()> {
        if service.container.is_some() && !self.supervisor.launcher().runtime_available().await {
            return Err(FleetError::RuntimeUnavailable(format!(
                "{} needs the container runtime; start the docker daemon",
                service.name()
            )));
        }
        if service.engine == Some(Engine::Vllm)
            && !options.allow_download
            && !self.catalog.hf_cached(&service.model)
        {
            return Err(FleetError::MissingModel {
                model: service.model.clone(),
                engine: Engine::Vllm,
            });
        }
        Ok(())
    }

    async fn ensure_pulled(&self, llm: &ServiceDescriptor, options: ReconcileOptions) -> Result<()> {
        let endpoint = self.health.endpoint();
        let models = endpoint.models(llm.port, Engine::Ollama).await?;
        let tagged = format!("{}:latest", llm.model);
        if models.iter().any(|m| *m == llm.model || *m == tagged) {
            return Ok(());
        }
        if !options.allow_download {
            return Err(FleetError::MissingModel {
                model: llm.model.clone(),
                engine: Engine::Ollama,
            });
        }
        endpoint
            .pull(llm.port, &llm.model, self.config().pull_timeout)
            .await
    }

    /// Session teardown. With `purge_on_exit` every registry port is cleared, owned or not.
    pub async fn shutdown(&self, purge_on_exit: bool) {
        let _pass = self.pass.lock().await;
        self.supervisor
            .cleanup(purge_on_exit, &self.catalog.registry())
            .await;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = LifecycleState::Idle;
    }
}

fn service_name(required: &[ServiceDescriptor], port: u16) -> String {
    required
        .iter()
        .find(|s| s.port == port)
        .map(|s| s.name())
        .unwrap_or_else(|| format!("port {port}"))
}
