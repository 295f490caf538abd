//! The common shape of every model adapter, and the set a session runs with.

use {
    crate::{LlmAdapter, PipelineError, Result, SttAdapter, TtsAdapter},
    base::log,
    fleet::{HealthTarget, ServiceKind, health::classify_response},
    serde::{Deserialize, Serialize},
    std::future::Future,
    tokio::sync::mpsc,
};

/// A model behind some transport. Variants are picked when the adapter is built.
pub trait Adapter: Send + Sync {
    type Input: Send;
    type Output: Send;

    fn kind(&self) -> ServiceKind;

    /// Make sure the model is ready to serve.
    fn load(&self) -> impl Future<Output = Result<()>> + Send;

    fn unload(&self) -> impl Future<Output = Result<()>> + Send;

    fn infer(&self, input: Self::Input) -> impl Future<Output = Result<Self::Output>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Tokens produced by a language model, fed by a background task.
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

impl TokenStream {
    pub fn channel() -> (mpsc::UnboundedSender<Result<String>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub fn from_tokens<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Self {
        let (tx, stream) = Self::channel();
        for token in tokens {
            let _ = tx.send(Ok(token.into()));
        }
        stream
    }

    /// Next token, or `None` once the model is done.
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

/// Check that a speech service reports ON (or BUSY) on `/health`.
pub(crate) async fn ensure_speech_ready(client: &reqwest::Client, base_url: &str) -> Result<()> {
    let url = format!("{base_url}{}", HealthTarget::Speech.path());
    let response = client.get(&url).send().await?;
    let code = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let health = classify_response(code, &body, HealthTarget::Speech);
    if health.status.is_up() {
        Ok(())
    } else {
        Err(PipelineError::Adapter(format!("{url} reports {}", health.status)))
    }
}

/// The adapters one loadout provides. Speech adapters are absent in text-only loadouts.
#[derive(Clone, Debug)]
pub struct Adapters {
    pub stt: Option<SttAdapter>,
    pub llm: LlmAdapter,
    pub tts: Option<TtsAdapter>,
}

impl Adapters {
    pub async fn load(&self) -> Result<()> {
        if let Some(stt) = &self.stt {
            stt.load().await?;
        }
        self.llm.load().await?;
        if let Some(tts) = &self.tts {
            tts.load().await?;
        }
        Ok(())
    }

    pub async fn unload(&self) {
        if let Some(stt) = &self.stt {
            if let Err(e) = stt.unload().await {
                log::warn!("unloading {}: {}", stt.kind(), e);
            }
        }
        if let Err(e) = self.llm.unload().await {
            log::warn!("unloading {}: {}", self.llm.kind(), e);
        }
        if let Some(tts) = &self.tts {
            if let Err(e) = tts.unload().await {
                log::warn!("unloading {}: {}", tts.kind(), e);
            }
        }
    }
}
