//! Service catalog: from a requested loadout to concrete service descriptors.

use {
    crate::{Admission, Engine, FleetConfig, FleetError, Result},
    std::{fmt, path::PathBuf},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Stt,
    Tts,
    Llm,
    Pipeline,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Stt => "stt",
            ServiceKind::Tts => "tts",
            ServiceKind::Llm => "llm",
            ServiceKind::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a health probe talks to on a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTarget {
    /// Speech services: `GET /health` with a `{"status","model"}` body.
    Speech,
    /// Tag-style engine: `GET /api/tags`.
    OllamaTags,
    /// Completion-style engine: `GET /v1/models`.
    OpenAiModels,
}

impl HealthTarget {
    pub fn path(&self) -> &'static str {
        match self {
            HealthTarget::Speech => "/health",
            HealthTarget::OllamaTags => "/api/tags",
            HealthTarget::OpenAiModels => "/v1/models",
        }
    }

    pub fn is_llm(&self) -> bool {
        !matches!(self, HealthTarget::Speech)
    }

    pub fn for_engine(engine: Engine) -> Self {
        match engine {
            Engine::Ollama => HealthTarget::OllamaTags,
            Engine::Vllm => HealthTarget::OpenAiModels,
        }
    }
}

/// One known port and how to probe it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortEntry {
    pub port: u16,
    pub kind: ServiceKind,
    pub target: HealthTarget,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeechRef {
    pub id: String,
    pub streaming: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmRef {
    pub engine: Engine,
    pub model: String,
    pub context: Option<u32>,
    pub streaming: bool,
}

/// A parsed loadout: at most one STT, at most one TTS, exactly one LLM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub stt: Option<SpeechRef>,
    pub tts: Option<SpeechRef>,
    pub llm: LlmRef,
}

const STT_PREFIXES: [&str; 4] = ["whisper", "parakeet", "canary", "stt"];
const TTS_PREFIXES: [&str; 4] = ["tts", "kokoro", "piper", "xtts"];

#[derive(Default)]
struct Flags {
    context: Option<u32>,
    streaming: bool,
}

fn parse_flags<'a>(flags: impl Iterator<Item = &'a str>, id: &str) -> Result<Flags> {
    let mut parsed = Flags::default();
    for flag in flags {
        let flag = flag.trim();
        if flag.eq_ignore_ascii_case("stream") {
            parsed.streaming = true;
        } else if let Some(value) = flag.strip_prefix("ctx=") {
            parsed.context = Some(parse_context(value).ok_or_else(|| {
                FleetError::Manifest(format!("{id}: invalid context length {value:?}"))
            })?);
        } else {
            return Err(FleetError::Manifest(format!("{id}: unknown flag #{flag}")));
        }
    }
    Ok(parsed)
}

/// `8192`, `32k` and `32K` are all accepted.
fn parse_context(value: &str) -> Option<u32> {
    let value = value.trim();
    let (digits, scale) = match value.strip_suffix(['k', 'K']) {
        Some(digits) => (digits, 1024),
        None => (value, 1),
    };
    digits
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .filter(|n| *n > 0)
}

impl Manifest {
    pub fn parse<S: AsRef<str>>(ids: &[S]) -> Result<Self> {
        let mut stt = None;
        let mut tts = None;
        let mut llm = None;

        for raw in ids.iter().map(|s| s.as_ref().trim()).filter(|s| !s.is_empty()) {
            let mut parts = raw.split('#');
            let base = parts.next().unwrap_or_default().trim();
            let flags = parse_flags(parts, raw)?;

            if let Some(engine) = Engine::ALL.into_iter().find(|e| base.starts_with(e.prefix())) {
                let model = &base[engine.prefix().len()..];
                if model.is_empty() {
                    return Err(FleetError::Manifest(format!("{raw}: empty model name")));
                }
                if llm.is_some() {
                    return Err(FleetError::Manifest(
                        "only one language model may be resident".into(),
                    ));
                }
                llm = Some(LlmRef {
                    engine,
                    model: model.to_string(),
                    context: flags.context,
                    streaming: flags.streaming,
                });
                continue;
            }

            if flags.context.is_some() {
                return Err(FleetError::Manifest(format!(
                    "{raw}: #ctx only applies to language models"
                )));
            }
            let lower = base.to_ascii_lowercase();
            let slot = if STT_PREFIXES.iter().any(|p| lower.starts_with(p)) {
                &mut stt
            } else if TTS_PREFIXES.iter().any(|p| lower.starts_with(p)) {
                &mut tts
            } else {
                return Err(FleetError::Manifest(format!("{raw}: unrecognized model id")));
            };
            if slot.is_some() {
                return Err(FleetError::Manifest(format!("{raw}: duplicate speech service")));
            }
            *slot = Some(SpeechRef {
                id: base.to_string(),
                streaming: flags.streaming,
            });
        }

        let llm = llm.ok_or_else(|| {
            FleetError::Manifest("a loadout needs exactly one OL_ or VL_ language model".into())
        })?;
        Ok(Self { stt, tts, llm })
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(stt) = &self.stt {
            parts.push(stt.id.clone());
        }
        parts.push(format!("{}{}", self.llm.engine.prefix(), self.llm.model));
        if let Some(tts) = &self.tts {
            parts.push(tts.id.clone());
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Immutable description of one service that should be running.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    /// Model id plus encoded flags; two descriptors with equal ids are interchangeable.
    pub id: String,
    /// Model name as reported by the service's health endpoint.
    pub model: String,
    pub engine: Option<Engine>,
    pub port: u16,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub target: HealthTarget,
    pub health_url: String,
    /// Container name for engines that run under the container runtime.
    pub container: Option<String>,
    pub admission: Option<Admission>,
}

impl ServiceDescriptor {
    pub fn entry(&self) -> PortEntry {
        PortEntry {
            port: self.port,
            kind: self.kind,
            target: self.target,
        }
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// Maps loadouts onto ports and launch commands.
#[derive(Clone, Debug)]
pub struct Catalog {
    config: FleetConfig,
}

impl Catalog {
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Every port this host may run a managed service on.
    pub fn registry(&self) -> Vec<PortEntry> {
        let ports = &self.config.ports;
        vec![
            PortEntry { port: ports.stt, kind: ServiceKind::Stt, target: HealthTarget::Speech },
            PortEntry { port: ports.tts, kind: ServiceKind::Tts, target: HealthTarget::Speech },
            PortEntry { port: ports.ollama, kind: ServiceKind::Llm, target: HealthTarget::OllamaTags },
            PortEntry { port: ports.vllm, kind: ServiceKind::Llm, target: HealthTarget::OpenAiModels },
        ]
    }

    pub fn entry(&self, port: u16) -> Option<PortEntry> {
        self.registry().into_iter().find(|e| e.port == port)
    }

    /// Descriptors for every service the manifest needs, speech services first.
    pub fn required(&self, manifest: &Manifest, admission: &Admission) -> Vec<ServiceDescriptor> {
        let mut required = Vec::new();
        if let Some(stt) = &manifest.stt {
            required.push(self.speech(ServiceKind::Stt, stt));
        }
        if let Some(tts) = &manifest.tts {
            required.push(self.speech(ServiceKind::Tts, tts));
        }
        required.push(self.llm(&manifest.llm, admission));
        required
    }

    fn speech(&self, kind: ServiceKind, speech: &SpeechRef) -> ServiceDescriptor {
        let (port, command) = match kind {
            ServiceKind::Tts => (self.config.ports.tts, &self.config.tts_command),
            _ => (self.config.ports.stt, &self.config.stt_command),
        };
        let mut argv = command.clone();
        argv.extend(["--model".into(), speech.id.clone(), "--port".into(), port.to_string()]);
        if speech.streaming {
            argv.push("--streaming".into());
        }
        let id = if speech.streaming {
            format!("{}#stream", speech.id)
        } else {
            speech.id.clone()
        };
        ServiceDescriptor {
            kind,
            id,
            model: speech.id.clone(),
            engine: None,
            port,
            argv,
            env: Vec::new(),
            target: HealthTarget::Speech,
            health_url: self.config.url(port, HealthTarget::Speech.path()),
            container: None,
            admission: None,
        }
    }

    fn llm(&self, llm: &LlmRef, admission: &Admission) -> ServiceDescriptor {
        let port = self.config.ports.llm(llm.engine);
        let target = HealthTarget::for_engine(llm.engine);
        let context = admission.context_length;
        let (argv, env, container) = match llm.engine {
            Engine::Ollama => (
                self.config.ollama_command.clone(),
                vec![
                    ("OLLAMA_HOST".to_string(), format!("{}:{}", self.config.host, port)),
                    (
                        "OLLAMA_MODELS".to_string(),
                        self.config.ollama_models.display().to_string(),
                    ),
                    ("OLLAMA_CONTEXT_LENGTH".to_string(), context.to_string()),
                ],
                None,
            ),
            Engine::Vllm => {
                let name = format!("s2s-vllm-{port}");
                (self.vllm_argv(&name, port, &llm.model, admission), Vec::new(), Some(name))
            }
        };
        ServiceDescriptor {
            kind: ServiceKind::Llm,
            id: format!("{}{}#ctx={}", llm.engine.prefix(), llm.model, context),
            model: llm.model.clone(),
            engine: Some(llm.engine),
            port,
            argv,
            env,
            target,
            health_url: self.config.url(port, target.path()),
            container,
            admission: Some(admission.clone()),
        }
    }

    fn vllm_argv(&self, name: &str, port: u16, model: &str, admission: &Admission) -> Vec<String> {
        let hf_home = self.config.hf_home.display().to_string();
        let mut argv: Vec<String> = vec![
            self.config.docker.clone(),
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "--gpus".into(),
            "all".into(),
            "-p".into(),
            format!("{port}:8000"),
            "-v".into(),
            format!("{hf_home}:/root/.cache/huggingface"),
            "-e".into(),
            "HF_HOME=/root/.cache/huggingface".into(),
        ];
        if !self.config.allow_download {
            argv.extend(["-e".into(), "HF_HUB_OFFLINE=1".into()]);
        }
        argv.extend([
            self.config.vllm_image.clone(),
            "--model".into(),
            model.into(),
            "--max-model-len".into(),
            admission.context_length.to_string(),
        ]);
        if let Some(utilization) = admission.utilization {
            argv.extend(["--gpu-memory-utilization".into(), format!("{utilization:.3}")]);
        }
        if let Some(images) = admission.multimodal_images {
            argv.extend(["--limit-mm-per-prompt".into(), format!("image={images}")]);
        }
        argv
    }

    /// Location of a model's snapshot in the HF cache.
    pub fn hf_cache_dir(&self, model: &str) -> PathBuf {
        self.config
            .hf_home
            .join("hub")
            .join(format!("models--{}", model.replace('/', "--")))
    }

    pub fn hf_cached(&self, model: &str) -> bool {
        self.hf_cache_dir(model).is_dir()
    }
}
