//! Chat adapters for the two engine families, plus a scripted stub.
//!
//! Both engines stream: the tag-style engine as newline-delimited JSON, the
//! completion-style engine as server-sent events. Either way the body is read
//! chunk by chunk on a background task and tokens arrive through a [`TokenStream`].

use {
    crate::{Adapter, ChatMessage, PipelineError, Result, TokenStream},
    base::log,
    fleet::ServiceKind,
    serde_json::{Value, json},
    std::time::Duration,
    tokio::sync::mpsc,
};

/// One parsed line of a streaming body: an optional token and whether the stream ended.
pub type Line = (Option<String>, bool);

/// `{"message":{"content":"..."},"done":false}`
pub fn parse_ndjson_line(line: &str) -> Result<Line> {
    let line = line.trim();
    if line.is_empty() {
        return Ok((None, false));
    }
    let json: Value = serde_json::from_str(line)?;
    if let Some(error) = json.get("error").and_then(Value::as_str) {
        return Err(PipelineError::Adapter(error.to_string()));
    }
    let token = json
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let done = json.get("done").and_then(Value::as_bool).unwrap_or(false);
    Ok((token, done))
}

/// `data: {"choices":[{"delta":{"content":"..."}}]}` terminated by `data: [DONE]`.
pub fn parse_sse_line(line: &str) -> Result<Line> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok((None, false));
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok((None, true));
    }
    let json: Value = serde_json::from_str(data)?;
    if let Some(error) = json.pointer("/error/message").and_then(Value::as_str) {
        return Err(PipelineError::Adapter(error.to_string()));
    }
    let token = json
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok((token, false))
}

/// Forward one line; returns false once the stream is over or the reader went away.
fn forward(line: &[u8], parse: fn(&str) -> Result<Line>, tx: &mpsc::UnboundedSender<Result<String>>) -> bool {
    match parse(&String::from_utf8_lossy(line)) {
        Ok((token, done)) => {
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                if tx.send(Ok(token)).is_err() {
                    return false;
                }
            }
            !done
        }
        Err(e) => {
            let _ = tx.send(Err(e));
            false
        }
    }
}

fn pump(mut response: reqwest::Response, parse: fn(&str) -> Result<Line>) -> TokenStream {
    let (tx, stream) = TokenStream::channel();
    tokio::spawn(async move {
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => pending.extend_from_slice(&bytes),
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            }
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if !forward(&line, parse, &tx) {
                    return;
                }
            }
        }
        if !pending.is_empty() {
            forward(&pending, parse, &tx);
        }
    });
    stream
}

/// Tag-style engine: `POST /api/chat`.
#[derive(Clone, Debug)]
pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
    context: u32,
}

impl OllamaChat {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        context: u32,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            context,
        }
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": { "num_ctx": self.context },
        });
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(pump(response, parse_ndjson_line))
    }
}

/// Completion-style engine: `POST /v1/chat/completions`.
#[derive(Clone, Debug)]
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(pump(response, parse_sse_line))
    }
}

/// Replays a fixed token script.
#[derive(Clone, Debug)]
pub struct StubLlm {
    tokens: Vec<String>,
    delay: Duration,
}

impl StubLlm {
    pub fn new<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
        }
    }

    /// Split `reply` into word tokens, each keeping its trailing space.
    pub fn from_reply(reply: &str) -> Self {
        Self::new(reply.split_inclusive(' '))
    }

    /// Pause before each token.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn stream(&self) -> TokenStream {
        if self.delay.is_zero() {
            return TokenStream::from_tokens(self.tokens.clone());
        }
        let (tx, stream) = TokenStream::channel();
        let tokens = self.tokens.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            for token in tokens {
                tokio::time::sleep(delay).await;
                if tx.send(Ok(token)).is_err() {
                    return;
                }
            }
        });
        stream
    }
}

#[derive(Clone, Debug)]
pub enum LlmAdapter {
    Ollama(OllamaChat),
    Vllm(OpenAiChat),
    Stub(StubLlm),
}

impl Adapter for LlmAdapter {
    type Input = Vec<ChatMessage>;
    type Output = TokenStream;

    fn kind(&self) -> ServiceKind {
        ServiceKind::Llm
    }

    async fn load(&self) -> Result<()> {
        let (client, url) = match self {
            LlmAdapter::Ollama(chat) => (&chat.client, format!("{}/api/tags", chat.base_url)),
            LlmAdapter::Vllm(chat) => (&chat.client, format!("{}/v1/models", chat.base_url)),
            LlmAdapter::Stub(_) => return Ok(()),
        };
        client.get(&url).send().await?.error_for_status()?;
        log::debug!("{} answered", url);
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    async fn infer(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        match self {
            LlmAdapter::Ollama(chat) => chat.chat(messages).await,
            LlmAdapter::Vllm(chat) => chat.chat(messages).await,
            LlmAdapter::Stub(stub) => Ok(stub.stream()),
        }
    }
}
