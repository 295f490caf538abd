use {
    crate::{FleetError, Result},
    std::future::Future,
    tokio::process::Command,
};

/// Total and used memory of the accelerator, in GB.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GpuMemory {
    pub total_gb: f64,
    pub used_gb: f64,
}

impl GpuMemory {
    pub fn free_gb(&self) -> f64 {
        (self.total_gb - self.used_gb).max(0.0)
    }
}

pub trait GpuMonitor: Send + Sync {
    fn memory(&self) -> impl Future<Output = Result<GpuMemory>> + Send;
}

/// Reads GPU 0 through `nvidia-smi`.
#[derive(Clone, Debug)]
pub struct NvidiaSmi {
    program: String,
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuMonitor for NvidiaSmi {
    async fn memory(&self) -> Result<GpuMemory> {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=memory.total,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .map_err(|e| FleetError::Gpu(format!("{}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(FleetError::Gpu(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `total, used` MiB pairs; only the first GPU is considered.
pub fn parse_nvidia_smi(output: &str) -> Result<GpuMemory> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| FleetError::Gpu("empty nvidia-smi output".into()))?;
    let mut fields = line.split(',').map(|f| f.trim().parse::<f64>());
    match (fields.next(), fields.next()) {
        (Some(Ok(total)), Some(Ok(used))) => Ok(GpuMemory {
            total_gb: total / 1024.0,
            used_gb: used / 1024.0,
        }),
        _ => Err(FleetError::Gpu(format!("unexpected nvidia-smi line: {line:?}"))),
    }
}
