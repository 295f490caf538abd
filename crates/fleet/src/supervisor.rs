//! Process supervision: spawning, killing and purge policy.

use {
    crate::{
        FleetError, Health, PortEntry, Result, ServiceDescriptor, ServiceKind, ServiceStatus,
        calibration::normalize_model_id,
    },
    base::log,
    std::{
        collections::HashMap,
        fmt,
        fs::{self, File, OpenOptions},
        future::Future,
        path::PathBuf,
        process::Stdio,
        time::Duration,
    },
    tokio::{
        process::{Child, Command},
        sync::Mutex,
    },
};

/// Starts and stops service processes.
pub trait Launcher: Send + Sync {
    type Handle: Send;

    /// Launch `service` with its output going to `output`.
    fn spawn(
        &self,
        service: &ServiceDescriptor,
        output: File,
    ) -> impl Future<Output = Result<Self::Handle>> + Send;

    fn terminate(&self, handle: Self::Handle) -> impl Future<Output = Result<()>> + Send;

    /// Kill whatever listens on `port`, owned or not.
    fn kill_port(&self, port: u16) -> impl Future<Output = Result<()>> + Send;

    /// Whether the container runtime daemon answers.
    fn runtime_available(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug)]
pub enum ProcessHandle {
    Child(Child),
    Container {
        name: String,
        /// `docker logs -f` process copying container output into the service log.
        follower: Option<Child>,
    },
}

/// Native processes through `tokio::process`, containers through the docker CLI.
#[derive(Clone, Debug)]
pub struct SystemLauncher {
    docker: String,
    fuser: String,
    grace: Duration,
}

impl SystemLauncher {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            fuser: "fuser".into(),
            grace: Duration::from_secs(10),
        }
    }

    /// Program used to kill native listeners on a port.
    pub fn with_fuser(mut self, fuser: impl Into<String>) -> Self {
        self.fuser = fuser.into();
        self
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Ok(Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?)
    }

    async fn stop_child(&self, mut child: Child) -> Result<()> {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await;
            if let Ok(status) = tokio::time::timeout(self.grace, child.wait()).await {
                log::debug!("process {} exited with {:?}", pid, status.ok());
                return Ok(());
            }
            log::warn!("process {} ignored SIGTERM, killing", pid);
        }
        child.kill().await?;
        Ok(())
    }
}

impl Launcher for SystemLauncher {
    type Handle = ProcessHandle;

    async fn spawn(&self, service: &ServiceDescriptor, output: File) -> Result<ProcessHandle> {
        let spawn_error = |reason: String| FleetError::Spawn {
            service: service.name(),
            reason,
        };
        let (program, args) = service
            .argv
            .split_first()
            .ok_or_else(|| spawn_error("empty command".into()))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .envs(service.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        match &service.container {
            None => {
                let stderr = output.try_clone()?;
                let child = command
                    .stdout(Stdio::from(output))
                    .stderr(Stdio::from(stderr))
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| spawn_error(e.to_string()))?;
                log::info!("spawned {} as pid {:?}", service.name(), child.id());
                Ok(ProcessHandle::Child(child))
            }
            Some(name) => {
                // a container left behind by a crashed run would hold the name
                let _ = self.docker(&["rm", "-f", name]).await;
                let result = command
                    .output()
                    .await
                    .map_err(|e| spawn_error(e.to_string()))?;
                if !result.status.success() {
                    return Err(spawn_error(
                        String::from_utf8_lossy(&result.stderr).trim().to_string(),
                    ));
                }
                let stderr = output.try_clone()?;
                let follower = Command::new(&self.docker)
                    .args(["logs", "-f", name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::from(output))
                    .stderr(Stdio::from(stderr))
                    .kill_on_drop(true)
                    .spawn();
                let follower = match follower {
                    Ok(child) => Some(child),
                    Err(e) => {
                        log::warn!("cannot follow logs of {}: {}", name, e);
                        None
                    }
                };
                log::info!("started container {} for {}", name, service.name());
                Ok(ProcessHandle::Container {
                    name: name.clone(),
                    follower,
                })
            }
        }
    }

    async fn terminate(&self, handle: ProcessHandle) -> Result<()> {
        match handle {
            ProcessHandle::Child(child) => self.stop_child(child).await,
            ProcessHandle::Container { name, follower } => {
                let grace = self.grace.as_secs().to_string();
                let stopped = self.docker(&["stop", "-t", &grace, &name]).await;
                if !matches!(&stopped, Ok(out) if out.status.success()) {
                    let _ = self.docker(&["rm", "-f", &name]).await;
                }
                if let Some(mut follower) = follower {
                    let _ = follower.kill().await;
                }
                Ok(())
            }
        }
    }

    async fn kill_port(&self, port: u16) -> Result<()> {
        let filter = format!("publish={port}");
        if let Ok(out) = self.docker(&["ps", "-q", "--filter", &filter]).await {
            let ids = String::from_utf8_lossy(&out.stdout);
            for id in ids.split_whitespace() {
                log::info!("removing container {} publishing port {}", id, port);
                let _ = self.docker(&["rm", "-f", id]).await;
            }
        }
        // fuser exits non-zero when nothing holds the port
        match Command::new(&self.fuser)
            .args(["-k", "-TERM", &format!("{port}/tcp")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(_) => Ok(()),
            // the port check after the purge still catches a surviving listener
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} not installed, cannot kill native listeners on port {}", self.fuser, port);
                Ok(())
            }
            Err(e) => Err(FleetError::PortConflict {
                port,
                reason: format!("fuser: {e}"),
            }),
        }
    }

    async fn runtime_available(&self) -> bool {
        Command::new(&self.docker)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgeReason {
    /// Neither ON nor OFF.
    Unhealthy,
    /// ON, but not the exact model requested for that port.
    Mismatch,
    /// ON on a port the manifest does not need.
    Orphan,
    /// A language model on a port the manifest does not need; only one may be resident.
    SecondEngine,
}

impl fmt::Display for PurgeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PurgeReason::Unhealthy => "unhealthy",
            PurgeReason::Mismatch => "model mismatch",
            PurgeReason::Orphan => "not required",
            PurgeReason::SecondEngine => "second language model",
        })
    }
}

fn matches_required(service: &ServiceDescriptor, health: &Health, owned_id: Option<&String>) -> bool {
    match owned_id {
        Some(id) => *id == service.id,
        None => health
            .info
            .as_deref()
            .is_some_and(|info| normalize_model_id(info) == normalize_model_id(&service.model)),
    }
}

/// Decide which live services must go before the required set can be started.
///
/// `resident` maps ports owned by this supervisor to the descriptor id they were started with.
pub fn plan_purge(
    required: &[ServiceDescriptor],
    snapshot: &[(PortEntry, Health)],
    resident: &HashMap<u16, String>,
    purge_on_entry: bool,
) -> Vec<(u16, PurgeReason)> {
    snapshot
        .iter()
        .filter_map(|(entry, health)| {
            let reason = match health.status {
                ServiceStatus::Off => None,
                ServiceStatus::Startup | ServiceStatus::Unhealthy => Some(PurgeReason::Unhealthy),
                ServiceStatus::On | ServiceStatus::Busy => {
                    match required.iter().find(|s| s.port == entry.port) {
                        Some(service) => (!matches_required(
                            service,
                            health,
                            resident.get(&entry.port),
                        ))
                        .then_some(PurgeReason::Mismatch),
                        None if entry.kind == ServiceKind::Llm => Some(PurgeReason::SecondEngine),
                        None if purge_on_entry => Some(PurgeReason::Orphan),
                        None => None,
                    }
                }
            };
            reason.map(|r| (entry.port, r))
        })
        .collect()
}

struct OwnedProcess<H> {
    id: String,
    kind: ServiceKind,
    handle: H,
}

/// Owns the port → process table. Every mutation holds the table lock.
pub struct Supervisor<L: Launcher> {
    launcher: L,
    log_dir: PathBuf,
    table: Mutex<HashMap<u16, OwnedProcess<L::Handle>>>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            log_dir: log_dir.into(),
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Owned ports and the descriptor id each was started with.
    pub async fn resident(&self) -> HashMap<u16, String> {
        self.table
            .lock()
            .await
            .iter()
            .map(|(port, owned)| (*port, owned.id.clone()))
            .collect()
    }

    /// Stop whatever is on `port`: the owned process if any, then anything else bound to it.
    pub async fn kill(&self, port: u16, reason: PurgeReason) -> Result<()> {
        let mut table = self.table.lock().await;
        log::info!("purging port {} ({})", port, reason);
        if let Some(owned) = table.remove(&port) {
            log::debug!("terminating owned {} {}", owned.kind, owned.id);
            self.launcher.terminate(owned.handle).await?;
        }
        self.launcher.kill_port(port).await
    }

    pub async fn spawn(&self, service: &ServiceDescriptor) -> Result<()> {
        let mut table = self.table.lock().await;
        fs::create_dir_all(&self.log_dir)?;
        let path = self
            .log_dir
            .join(format!("{}_{}.log", service.kind, service.port));
        let output = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!(
            "spawning {} on port {} (log {})",
            service.name(),
            service.port,
            path.display()
        );
        let handle = self.launcher.spawn(service, output).await?;
        if let Some(previous) = table.insert(
            service.port,
            OwnedProcess {
                id: service.id.clone(),
                kind: service.kind,
                handle,
            },
        ) {
            log::warn!("replacing owned {} on port {}", previous.id, service.port);
            self.launcher.terminate(previous.handle).await?;
        }
        Ok(())
    }

    /// Terminate the owned processes on `ports`, continuing past failures.
    pub async fn release(&self, ports: &[u16]) {
        let mut table = self.table.lock().await;
        for port in ports {
            if let Some(owned) = table.remove(port) {
                log::info!("releasing {} on port {}", owned.id, port);
                if let Err(e) = self.launcher.terminate(owned.handle).await {
                    log::warn!("failed to terminate {}: {}", owned.id, e);
                }
            }
        }
    }

    /// End-of-session teardown: every owned process, and with `purge_on_exit`
    /// every registry port regardless of ownership.
    pub async fn cleanup(&self, purge_on_exit: bool, registry: &[PortEntry]) {
        let ports: Vec<u16> = self.table.lock().await.keys().copied().collect();
        self.release(&ports).await;
        if purge_on_exit {
            let _table = self.table.lock().await;
            for entry in registry {
                if let Err(e) = self.launcher.kill_port(entry.port).await {
                    log::warn!("failed to clear port {}: {}", entry.port, e);
                }
            }
        }
    }
}
