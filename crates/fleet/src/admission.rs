//! Admission control: how much GPU memory and context an engine may claim.
//!
//! Pure computation over calibration records and a GPU memory snapshot. Policy
//! outcomes (no calibration, tight memory) are returned as warnings, never errors.

use {
    crate::{AdmissionConfig, CalibrationStore, Engine, GpuMemory},
    base::log,
};

#[derive(Clone, Debug)]
pub struct AdmissionRequest<'a> {
    pub model: &'a str,
    pub engine: Engine,
    /// Requested context length; `None` uses the engine default.
    pub context: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetSource {
    Calibrated,
    /// No calibration record: the static safety net was applied.
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Admission {
    pub engine: Engine,
    pub context_length: u32,
    /// Memory fraction for engines that take one.
    pub utilization: Option<f64>,
    /// Predicted footprint including the static floor, in GB.
    pub predicted_gb: f64,
    /// Images per prompt for multimodal models.
    pub multimodal_images: Option<u32>,
    pub source: BudgetSource,
    pub warnings: Vec<String>,
}

/// Compute the memory budget for one engine start.
pub fn admit(
    request: &AdmissionRequest,
    store: &CalibrationStore,
    gpu: GpuMemory,
    config: &AdmissionConfig,
) -> Admission {
    let mut warnings = Vec::new();
    let mut context = request
        .context
        .unwrap_or_else(|| config.default_context(request.engine));

    let record = store.get(request.model, request.engine);
    let (predicted_gb, source) = match record {
        Some(record) => (
            record.footprint_gb(context) + config.static_floor_gb,
            BudgetSource::Calibrated,
        ),
        None => {
            context = context.min(config.fallback_context);
            warnings.push(format!(
                "no calibration for {} on {}; using safety net of {} GB with context {}",
                request.model, request.engine, config.fallback_vram_gb, context
            ));
            (config.fallback_vram_gb, BudgetSource::Fallback)
        }
    };

    // an unknown total falls back to the calibration GPU, else to the minimum fraction
    let total_gb = if gpu.total_gb > 0.0 {
        gpu.total_gb
    } else {
        let known = record
            .map(|record| record.gpu_total_vram_at_calibration)
            .filter(|total| *total > 0.0);
        warnings.push(match known {
            Some(total) => format!("GPU memory unknown; sizing against the calibration GPU of {total} GB"),
            None => "GPU memory unknown; requesting the minimum memory fraction".to_string(),
        });
        known.unwrap_or(0.0)
    };

    let utilization = request
        .engine
        .takes_memory_fraction()
        .then(|| utilization(predicted_gb, total_gb, config));

    if gpu.total_gb > 0.0 && predicted_gb > gpu.free_gb() {
        warnings.push(format!(
            "predicted footprint {:.2} GB exceeds free GPU memory {:.2} GB",
            predicted_gb,
            gpu.free_gb()
        ));
    }

    for warning in &warnings {
        log::warn!("admission: {}", warning);
    }

    Admission {
        engine: request.engine,
        context_length: context,
        utilization,
        predicted_gb,
        multimodal_images: (request.engine == Engine::Vllm && is_multimodal(request.model))
            .then_some(1),
        source,
        warnings,
    }
}

/// `required / total + buffer`, capped at the configured maximum and floored at the minimum.
/// An unknown (zero) total gets the minimum.
pub fn utilization(required_gb: f64, total_gb: f64, config: &AdmissionConfig) -> f64 {
    if total_gb <= 0.0 {
        return config.min_utilization;
    }
    (required_gb / total_gb + config.safety_buffer)
        .min(config.max_utilization)
        .max(config.min_utilization)
}

fn is_multimodal(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("vision")
        || model.contains("llava")
        || model
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|part| part == "vl" || part.ends_with("vl"))
}
