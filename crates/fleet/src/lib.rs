pub mod admission;
pub mod calibration;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod health;
pub mod orchestrator;
pub mod supervisor;

pub use admission::{Admission, AdmissionRequest, BudgetSource, admit};
pub use calibration::{CalibrationRecord, CalibrationStore};
pub use catalog::{Catalog, HealthTarget, LlmRef, Manifest, PortEntry, ServiceDescriptor, ServiceKind, SpeechRef};
pub use config::{AdmissionConfig, FleetConfig, Ports};
pub use engine::Engine;
pub use error::{FleetError, Result};
pub use gpu::{GpuMemory, GpuMonitor, NvidiaSmi};
pub use health::{Endpoint, Health, HealthReconciler, HttpEndpoint, ServiceStatus, WaitOutcome};
pub use orchestrator::{
    LifecycleState, LogSink, Orchestrator, ReconcileOptions, ReconcileReport, ReportSink,
};
pub use supervisor::{Launcher, ProcessHandle, PurgeReason, Supervisor, SystemLauncher, plan_purge};
