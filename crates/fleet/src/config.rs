use {
    crate::{Engine, FleetError, Result},
    std::{path::PathBuf, time::Duration},
};

/// Canonical ports of the managed services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ports {
    pub stt: u16,
    pub tts: u16,
    pub ollama: u16,
    pub vllm: u16,
    pub pipeline: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            stt: 8001,
            tts: 8002,
            ollama: 11434,
            vllm: 8000,
            pipeline: 8765,
        }
    }
}

impl Ports {
    pub fn llm(&self, engine: Engine) -> u16 {
        match engine {
            Engine::Ollama => self.ollama,
            Engine::Vllm => self.vllm,
        }
    }
}

/// Memory-physics constants used by the admission controller.
#[derive(Clone, Debug, PartialEq)]
pub struct AdmissionConfig {
    /// Fixed overhead added to every calibrated prediction (CUDA context, activations).
    pub static_floor_gb: f64,
    /// Added to the computed utilization fraction.
    pub safety_buffer: f64,
    pub min_utilization: f64,
    pub max_utilization: f64,
    pub default_context_ollama: u32,
    pub default_context_vllm: u32,
    /// Context ceiling when no calibration exists.
    pub fallback_context: u32,
    /// VRAM budget assumed when no calibration exists.
    pub fallback_vram_gb: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            static_floor_gb: 1.0,
            safety_buffer: 0.05,
            min_utilization: 0.10,
            max_utilization: 0.95,
            default_context_ollama: 8192,
            default_context_vllm: 16384,
            fallback_context: 4096,
            fallback_vram_gb: 8.0,
        }
    }
}

impl AdmissionConfig {
    pub fn default_context(&self, engine: Engine) -> u32 {
        match engine {
            Engine::Ollama => self.default_context_ollama,
            Engine::Vllm => self.default_context_vllm,
        }
    }
}

/// Everything the lifecycle layer needs, built once at process start and
/// passed down explicitly.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub host: String,
    pub ports: Ports,
    /// How long one spawned service may take to report ON.
    pub startup_timeout: Duration,
    /// How long a model pull may take.
    pub pull_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub log_dir: PathBuf,
    pub calibration_dir: PathBuf,
    /// Weight cache of the tag-style engine (`OLLAMA_MODELS`).
    pub ollama_models: PathBuf,
    /// Weight cache of the completion-style engine (`HF_HOME`).
    pub hf_home: PathBuf,
    pub stt_command: Vec<String>,
    pub tts_command: Vec<String>,
    pub ollama_command: Vec<String>,
    pub docker: String,
    pub vllm_image: String,
    pub allow_download: bool,
    pub purge_on_entry: bool,
    pub purge_on_exit: bool,
    pub admission: AdmissionConfig,
}

impl FleetConfig {
    /// Defaults for everything except the two weight-cache paths, which have none.
    pub fn new(ollama_models: impl Into<PathBuf>, hf_home: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: Ports::default(),
            startup_timeout: Duration::from_secs(180),
            pull_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(1500),
            log_dir: PathBuf::from("logs"),
            calibration_dir: PathBuf::from("calibration"),
            ollama_models: ollama_models.into(),
            hf_home: hf_home.into(),
            stt_command: argv("python -m servers.stt"),
            tts_command: argv("python -m servers.tts"),
            ollama_command: argv("ollama serve"),
            docker: "docker".to_string(),
            vllm_image: "vllm/vllm-openai:latest".to_string(),
            allow_download: false,
            purge_on_entry: true,
            purge_on_exit: false,
            admission: AdmissionConfig::default(),
        }
    }

    /// Build the configuration from the process environment.
    ///
    /// `OLLAMA_MODELS` and `HF_HOME` must be set; a missing cache path is an
    /// error rather than a silent default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<PathBuf> {
            match get(key) {
                Some(value) if !value.trim().is_empty() => Ok(PathBuf::from(value.trim())),
                _ => Err(FleetError::Config(format!(
                    "{key} must be set to the model cache directory"
                ))),
            }
        };
        let mut config = Self::new(required("OLLAMA_MODELS")?, required("HF_HOME")?);

        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("S2S_HOST") {
            config.host = host;
        }
        set_parsed(&get, "S2S_STT_PORT", &mut config.ports.stt)?;
        set_parsed(&get, "S2S_TTS_PORT", &mut config.ports.tts)?;
        set_parsed(&get, "S2S_OLLAMA_PORT", &mut config.ports.ollama)?;
        set_parsed(&get, "S2S_VLLM_PORT", &mut config.ports.vllm)?;
        set_parsed(&get, "S2S_PIPELINE_PORT", &mut config.ports.pipeline)?;

        let mut secs = config.startup_timeout.as_secs();
        set_parsed(&get, "S2S_STARTUP_TIMEOUT_SECS", &mut secs)?;
        config.startup_timeout = Duration::from_secs(secs);
        let mut secs = config.pull_timeout.as_secs();
        set_parsed(&get, "S2S_PULL_TIMEOUT_SECS", &mut secs)?;
        config.pull_timeout = Duration::from_secs(secs);
        let mut millis = config.poll_interval.as_millis() as u64;
        set_parsed(&get, "S2S_POLL_INTERVAL_MS", &mut millis)?;
        config.poll_interval = Duration::from_millis(millis);
        let mut millis = config.probe_timeout.as_millis() as u64;
        set_parsed(&get, "S2S_PROBE_TIMEOUT_MS", &mut millis)?;
        config.probe_timeout = Duration::from_millis(millis);

        if let Some(dir) = get("S2S_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("S2S_CALIBRATION_DIR") {
            config.calibration_dir = PathBuf::from(dir);
        }
        if let Some(command) = get("S2S_STT_COMMAND") {
            config.stt_command = argv(&command);
        }
        if let Some(command) = get("S2S_TTS_COMMAND") {
            config.tts_command = argv(&command);
        }
        if let Some(image) = get("S2S_VLLM_IMAGE") {
            config.vllm_image = image;
        }
        set_flag(&get, "S2S_ALLOW_DOWNLOAD", &mut config.allow_download)?;
        set_flag(&get, "S2S_PURGE_ON_ENTRY", &mut config.purge_on_entry)?;
        set_flag(&get, "S2S_PURGE_ON_EXIT", &mut config.purge_on_exit)?;

        if config.poll_interval.is_zero() {
            return Err(FleetError::Config("S2S_POLL_INTERVAL_MS must be > 0".into()));
        }
        Ok(config)
    }

    pub fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }
}

fn argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

fn set_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(value) = get(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| FleetError::Config(format!("{key}: invalid value {value:?}")))?;
    }
    Ok(())
}

fn set_flag(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) -> Result<()> {
    if let Some(value) = get(key) {
        *target = match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(FleetError::Config(format!("{key}: expected a boolean, got {value:?}"))),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashMap};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_cache_paths_are_required() {
        let err = FleetConfig::from_lookup(lookup(&[("HF_HOME", "/hf")])).unwrap_err();
        assert!(err.to_string().contains("OLLAMA_MODELS"));

        let err = FleetConfig::from_lookup(lookup(&[("OLLAMA_MODELS", "/ol"), ("HF_HOME", " ")]))
            .unwrap_err();
        assert!(err.to_string().contains("HF_HOME"));
    }

    #[test]
    fn test_defaults() {
        let config =
            FleetConfig::from_lookup(lookup(&[("OLLAMA_MODELS", "/ol"), ("HF_HOME", "/hf")])).unwrap();
        assert_eq!(config.ports, Ports::default());
        assert_eq!(config.ollama_models, PathBuf::from("/ol"));
        assert_eq!(config.startup_timeout, Duration::from_secs(180));
        assert!(config.purge_on_entry);
        assert!(!config.allow_download);
        assert_eq!(config.url(8001, "/health"), "http://127.0.0.1:8001/health");
    }

    #[test]
    fn test_overrides() {
        let config = FleetConfig::from_lookup(lookup(&[
            ("OLLAMA_MODELS", "/ol"),
            ("HF_HOME", "/hf"),
            ("S2S_STT_PORT", "9001"),
            ("S2S_STARTUP_TIMEOUT_SECS", "5"),
            ("S2S_ALLOW_DOWNLOAD", "yes"),
            ("S2S_STT_COMMAND", "/opt/stt/bin/serve --fp16"),
        ]))
        .unwrap();
        assert_eq!(config.ports.stt, 9001);
        assert_eq!(config.startup_timeout, Duration::from_secs(5));
        assert!(config.allow_download);
        assert_eq!(config.stt_command, vec!["/opt/stt/bin/serve", "--fp16"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = FleetConfig::from_lookup(lookup(&[
            ("OLLAMA_MODELS", "/ol"),
            ("HF_HOME", "/hf"),
            ("S2S_TTS_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));

        let err = FleetConfig::from_lookup(lookup(&[
            ("OLLAMA_MODELS", "/ol"),
            ("HF_HOME", "/hf"),
            ("S2S_PURGE_ON_EXIT", "maybe"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("S2S_PURGE_ON_EXIT"));
    }
}
