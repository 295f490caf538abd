use {
    crate::{Engine, FleetError, Result},
    base::log,
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        fs,
        path::{Path, PathBuf},
    },
};

/// Measured memory physics of one model on one engine.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationRecord {
    pub model_id: String,
    pub engine: Engine,
    pub base_vram_gb: f64,
    pub kv_cache_gb_per_10k_tokens: f64,
    pub calibrated_at: String,
    pub gpu_total_vram_at_calibration: f64,
}

impl CalibrationRecord {
    pub fn validate(&self) -> Result<()> {
        if !(self.base_vram_gb > 0.0) {
            return Err(FleetError::Calibration(format!(
                "{}: base_vram_gb must be > 0, got {}",
                self.model_id, self.base_vram_gb
            )));
        }
        if !(self.kv_cache_gb_per_10k_tokens >= 0.0) {
            return Err(FleetError::Calibration(format!(
                "{}: kv_cache_gb_per_10k must be >= 0, got {}",
                self.model_id, self.kv_cache_gb_per_10k_tokens
            )));
        }
        Ok(())
    }

    /// Weights plus KV cache for `context` tokens, without any static floor.
    pub fn footprint_gb(&self, context: u32) -> f64 {
        self.base_vram_gb + (context as f64 / 10_000.0) * self.kv_cache_gb_per_10k_tokens
    }
}

#[derive(Serialize, Deserialize)]
struct CalibrationFile {
    id: String,
    engine: Engine,
    constants: Constants,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct Constants {
    base_vram_gb: f64,
    kv_cache_gb_per_10k: f64,
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    calibrated_at: String,
    gpu_vram_total_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_cache_gb: Option<f64>,
}

impl From<CalibrationFile> for CalibrationRecord {
    fn from(file: CalibrationFile) -> Self {
        Self {
            model_id: file.id,
            engine: file.engine,
            base_vram_gb: file.constants.base_vram_gb,
            kv_cache_gb_per_10k_tokens: file.constants.kv_cache_gb_per_10k,
            calibrated_at: file.metadata.calibrated_at,
            gpu_total_vram_at_calibration: file.metadata.gpu_vram_total_gb,
        }
    }
}

impl From<&CalibrationRecord> for CalibrationFile {
    fn from(record: &CalibrationRecord) -> Self {
        Self {
            id: record.model_id.clone(),
            engine: record.engine,
            constants: Constants {
                base_vram_gb: record.base_vram_gb,
                kv_cache_gb_per_10k: record.kv_cache_gb_per_10k_tokens,
            },
            metadata: Metadata {
                calibrated_at: record.calibrated_at.clone(),
                gpu_vram_total_gb: record.gpu_total_vram_at_calibration,
                source_tokens: None,
                source_cache_gb: None,
            },
        }
    }
}

/// Lowercase, drop loadout flags, and fold path-ish separators so that
/// `Qwen/Qwen2.5-7B`, `qwen/qwen2.5-7b#ctx=8k` and `qwen_qwen2.5-7b` agree.
pub fn normalize_model_id(id: &str) -> String {
    let id = id.split('#').next().unwrap_or(id).trim();
    id.chars()
        .map(|c| match c {
            '/' | ':' | '\\' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Read-mostly set of calibration records, keyed by engine and normalized model id.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    dir: Option<PathBuf>,
    records: HashMap<(Engine, String), CalibrationRecord>,
}

impl CalibrationStore {
    /// Load every `*.json` file in `dir`.
    ///
    /// A missing directory yields an empty store; unreadable or invalid files
    /// are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut store = Self {
            dir: Some(dir.clone()),
            records: HashMap::new(),
        };
        if !dir.exists() {
            log::warn!("calibration directory {} does not exist", dir.display());
            return Ok(store);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => store.insert(record),
                Err(e) => log::warn!("skipping calibration file {}: {}", path.display(), e),
            }
        }
        log::info!("loaded {} calibration records", store.records.len());
        Ok(store)
    }

    pub fn in_memory(records: impl IntoIterator<Item = CalibrationRecord>) -> Self {
        let mut store = Self::default();
        for record in records {
            store.insert(record);
        }
        store
    }

    fn insert(&mut self, record: CalibrationRecord) {
        let key = (record.engine, normalize_model_id(&record.model_id));
        self.records.insert(key, record);
    }

    pub fn get(&self, model_id: &str, engine: Engine) -> Option<&CalibrationRecord> {
        self.records.get(&(engine, normalize_model_id(model_id)))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persist a new record. Records are immutable: an existing one is never overwritten.
    pub fn record(&mut self, record: CalibrationRecord) -> Result<PathBuf> {
        record.validate()?;
        let dir = self
            .dir
            .clone()
            .ok_or_else(|| FleetError::Calibration("store has no directory".into()))?;
        if self.get(&record.model_id, record.engine).is_some() {
            return Err(FleetError::Calibration(format!(
                "{} on {} is already calibrated",
                record.model_id, record.engine
            )));
        }
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{}__{}.json",
            record.engine,
            normalize_model_id(&record.model_id)
        ));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        serde_json::to_writer_pretty(file, &CalibrationFile::from(&record))?;
        self.insert(record);
        Ok(path)
    }
}

fn read_record(path: &Path) -> Result<CalibrationRecord> {
    let text = fs::read_to_string(path)?;
    let file: CalibrationFile = serde_json::from_str(&text)?;
    let record = CalibrationRecord::from(file);
    record.validate()?;
    Ok(record)
}
