use {
    crate::Engine,
    std::{fmt, time::Duration},
};

#[derive(Debug)]
pub enum FleetError {
    /// The model is not present locally and downloading was not authorized.
    MissingModel { model: String, engine: Engine },
    /// A spawned service never reported ON.
    StartupTimeout { service: String, port: u16, waited: Duration },
    /// A service went from STARTUP back to OFF while being waited on.
    StartupCrashed { service: String, port: u16 },
    /// The container runtime daemon is not reachable.
    RuntimeUnavailable(String),
    /// A port is held by something the purge step could not remove.
    PortConflict { port: u16, reason: String },
    Spawn { service: String, reason: String },
    /// The requested loadout cannot be turned into a service set.
    Manifest(String),
    Gpu(String),
    Config(String),
    Calibration(String),
    Io(String),
    Http(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::MissingModel { model, engine } => write!(
                f,
                "missing model: {model} is not available to {engine} and downloads are disabled"
            ),
            FleetError::StartupTimeout {
                service,
                port,
                waited,
            } => write!(
                f,
                "startup timeout: {service} on port {port} not ready after {}s",
                waited.as_secs()
            ),
            FleetError::StartupCrashed { service, port } => {
                write!(f, "startup crashed: {service} on port {port} exited while starting")
            }
            FleetError::RuntimeUnavailable(msg) => write!(f, "container runtime unavailable: {msg}"),
            FleetError::PortConflict { port, reason } => {
                write!(f, "port conflict on {port}: {reason}")
            }
            FleetError::Spawn { service, reason } => {
                write!(f, "failed to spawn {service}: {reason}")
            }
            FleetError::Manifest(msg) => write!(f, "invalid loadout: {msg}"),
            FleetError::Gpu(msg) => write!(f, "gpu query failed: {msg}"),
            FleetError::Config(msg) => write!(f, "config error: {msg}"),
            FleetError::Calibration(msg) => write!(f, "calibration error: {msg}"),
            FleetError::Io(msg) => write!(f, "io error: {msg}"),
            FleetError::Http(msg) => write!(f, "http error: {msg}"),
        }
    }
}

impl std::error::Error for FleetError {}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        FleetError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Calibration(err.to_string())
    }
}
