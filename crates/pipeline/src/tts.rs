use {
    crate::{Adapter, Result, adapter::ensure_speech_ready},
    com::pcm_to_bytes,
    fleet::ServiceKind,
    serde_json::json,
    std::time::Duration,
};

/// Text-to-speech server: `POST /synthesize` with `{"text","sample_rate"}`, answers raw PCM.
#[derive(Clone, Debug)]
pub struct HttpTts {
    client: reqwest::Client,
    base_url: String,
    sample_rate: u32,
}

impl HttpTts {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            sample_rate,
        }
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/synthesize", self.base_url))
            .json(&json!({ "text": text, "sample_rate": self.sample_rate }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Deterministic audio: 10 ms of a sawtooth per character.
#[derive(Clone, Debug)]
pub struct StubTts {
    sample_rate: u32,
    latency: Duration,
}

impl StubTts {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            latency: Duration::ZERO,
        }
    }

    /// Simulated synthesis time per request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn render(&self, text: &str) -> Vec<u8> {
        let count = text.chars().count() * (self.sample_rate as usize / 100);
        let samples: Vec<i16> = (0..count).map(|i| ((i % 100) as i16 - 50) * 200).collect();
        pcm_to_bytes(&samples)
    }
}

#[derive(Clone, Debug)]
pub enum TtsAdapter {
    Http(HttpTts),
    Stub(StubTts),
}

impl Adapter for TtsAdapter {
    type Input = String;
    type Output = Vec<u8>;

    fn kind(&self) -> ServiceKind {
        ServiceKind::Tts
    }

    async fn load(&self) -> Result<()> {
        match self {
            TtsAdapter::Http(http) => ensure_speech_ready(&http.client, &http.base_url).await,
            TtsAdapter::Stub(_) => Ok(()),
        }
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    async fn infer(&self, text: String) -> Result<Vec<u8>> {
        match self {
            TtsAdapter::Http(http) => http.synthesize(&text).await,
            TtsAdapter::Stub(stub) => {
                if !stub.latency.is_zero() {
                    tokio::time::sleep(stub.latency).await;
                }
                Ok(stub.render(&text))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_audio_is_deterministic() {
        let tts = TtsAdapter::Stub(StubTts::new(24_000));
        let first = tts.infer("Hello.".into()).await.unwrap();
        let second = tts.infer("Hello.".into()).await.unwrap();
        assert_eq!(first, second);
        // six characters, 240 samples each, two bytes per sample
        assert_eq!(first.len(), 6 * 240 * 2);
    }
}
