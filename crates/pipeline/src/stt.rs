use {
    crate::{Adapter, PipelineError, Result, adapter::ensure_speech_ready},
    fleet::ServiceKind,
    serde::Deserialize,
};

#[derive(Deserialize)]
struct Transcription {
    text: String,
}

/// Speech-to-text server: `POST /transcribe` with raw 16-bit PCM, answers `{"text"}`.
#[derive(Clone, Debug)]
pub struct HttpStt {
    client: reqwest::Client,
    base_url: String,
    sample_rate: u32,
}

impl HttpStt {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            sample_rate,
        }
    }

    async fn transcribe(&self, pcm: Vec<u8>) -> Result<String> {
        let url = format!("{}/transcribe?sample_rate={}", self.base_url, self.sample_rate);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(pcm)
            .send()
            .await?
            .error_for_status()?;
        let transcription: Transcription = response.json().await?;
        Ok(transcription.text)
    }
}

/// Returns the same transcript for any input.
#[derive(Clone, Debug)]
pub struct StubStt {
    transcript: String,
}

impl StubStt {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum SttAdapter {
    Http(HttpStt),
    Stub(StubStt),
}

impl Adapter for SttAdapter {
    type Input = Vec<u8>;
    type Output = String;

    fn kind(&self) -> ServiceKind {
        ServiceKind::Stt
    }

    async fn load(&self) -> Result<()> {
        match self {
            SttAdapter::Http(http) => ensure_speech_ready(&http.client, &http.base_url).await,
            SttAdapter::Stub(_) => Ok(()),
        }
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    async fn infer(&self, pcm: Vec<u8>) -> Result<String> {
        if pcm.len() % 2 != 0 {
            return Err(PipelineError::Adapter(format!(
                "odd PCM length {}: input must be 16-bit samples",
                pcm.len()
            )));
        }
        match self {
            SttAdapter::Http(http) => http.transcribe(pcm).await,
            SttAdapter::Stub(stub) => Ok(stub.transcript.clone()),
        }
    }
}
