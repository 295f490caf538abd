use {
    crate::{
        Adapters, HttpStt, HttpTts, LlmAdapter, OllamaChat, OpenAiChat, PipelineConfig,
        PipelineError, Result, StubLlm, StubStt, StubTts, SttAdapter, TtsAdapter,
    },
    fleet::{
        Endpoint, Engine, GpuMonitor, Launcher, LogSink, Manifest, Orchestrator, ReconcileOptions,
    },
    std::{
        future::Future,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    },
};

/// Turns a manifest into ready adapters.
pub trait Backend: Send + Sync + 'static {
    fn activate(&self, manifest: &Manifest) -> impl Future<Output = Result<Adapters>> + Send;
}

/// Reconciles the local fleet, then talks to it over HTTP.
pub struct FleetBackend<E: Endpoint, L: Launcher, G: GpuMonitor> {
    orchestrator: Arc<Orchestrator<E, L, G>>,
    client: reqwest::Client,
    config: PipelineConfig,
}

impl<E: Endpoint, L: Launcher, G: GpuMonitor> FleetBackend<E, L, G> {
    pub fn new(orchestrator: Arc<Orchestrator<E, L, G>>, config: PipelineConfig) -> Result<Self> {
        Ok(Self {
            orchestrator,
            client: reqwest::Client::builder().build()?,
            config,
        })
    }
}

impl<E, L, G> Backend for FleetBackend<E, L, G>
where
    E: Endpoint + 'static,
    L: Launcher + 'static,
    G: GpuMonitor + 'static,
{
    async fn activate(&self, manifest: &Manifest) -> Result<Adapters> {
        let fleet = self.orchestrator.config();
        let report = self
            .orchestrator
            .reconcile(manifest, ReconcileOptions::from(fleet), &LogSink)
            .await?;
        let url = |port: u16| fleet.url(port, "");

        let stt = manifest.stt.as_ref().map(|_| {
            SttAdapter::Http(HttpStt::new(
                self.client.clone(),
                url(fleet.ports.stt),
                self.config.input_sample_rate,
            ))
        });
        let tts = manifest.tts.as_ref().map(|_| {
            TtsAdapter::Http(HttpTts::new(
                self.client.clone(),
                url(fleet.ports.tts),
                self.config.output_sample_rate,
            ))
        });
        let llm = match manifest.llm.engine {
            Engine::Ollama => LlmAdapter::Ollama(OllamaChat::new(
                self.client.clone(),
                url(fleet.ports.ollama),
                manifest.llm.model.clone(),
                report.admission.context_length,
            )),
            Engine::Vllm => LlmAdapter::Vllm(OpenAiChat::new(
                self.client.clone(),
                url(fleet.ports.vllm),
                manifest.llm.model.clone(),
            )),
        };

        let adapters = Adapters { stt, llm, tts };
        adapters.load().await?;
        Ok(adapters)
    }
}

/// Hands out deterministic stub adapters without touching any process.
pub struct StubBackend {
    adapters: Adapters,
    failure: Option<String>,
    activations: AtomicUsize,
}

impl StubBackend {
    pub fn new(adapters: Adapters) -> Self {
        Self {
            adapters,
            failure: None,
            activations: AtomicUsize::new(0),
        }
    }

    /// Stubs that hear `transcript` and answer with `reply`.
    pub fn scripted(transcript: &str, reply: &str, output_sample_rate: u32) -> Self {
        Self::new(Adapters {
            stt: Some(SttAdapter::Stub(StubStt::new(transcript))),
            llm: LlmAdapter::Stub(StubLlm::from_reply(reply)),
            tts: Some(TtsAdapter::Stub(StubTts::new(output_sample_rate))),
        })
    }

    /// Every activation fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        let mut backend = Self::scripted("", "", 24_000);
        backend.failure = Some(message.into());
        backend
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }
}

impl Backend for StubBackend {
    async fn activate(&self, manifest: &Manifest) -> Result<Adapters> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(PipelineError::Adapter(message.clone()));
        }
        Ok(Adapters {
            stt: manifest.stt.as_ref().and(self.adapters.stt.clone()),
            llm: self.adapters.llm.clone(),
            tts: manifest.tts.as_ref().and(self.adapters.tts.clone()),
        })
    }
}
