//! The per-session pipeline state machine.
//!
//! A session moves through `IDLE → LOADING → IDLE` on a mode switch and
//! `IDLE → LISTENING → THINKING → SPEAKING → IDLE` on a turn. Only one turn
//! runs at a time; input that arrives while a turn or a load is in flight is
//! dropped.

use {
    crate::{
        Adapter, Adapters, Backend, ChatMessage, ChatRole, LogEntry, Multiplexer, PipelineConfig,
        PipelineError, Result, SessionLog,
    },
    base::{Stopwatch, log},
    com::{ClientMessage, Incoming, Outgoing, Role, ServerMessage},
    fleet::Manifest,
    std::{
        fmt,
        sync::{Arc, Mutex, MutexGuard},
    },
    tokio::{sync::mpsc::UnboundedSender, task::JoinHandle},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Loading,
    Listening,
    Thinking,
    Speaking,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "IDLE",
            Stage::Loading => "LOADING",
            Stage::Listening => "LISTENING",
            Stage::Thinking => "THINKING",
            Stage::Speaking => "SPEAKING",
        }
    }

    /// Whether a new turn may start.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Stage::Idle | Stage::Listening)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Text in, text out.
    Text,
    /// Audio in, text and audio out.
    Stream,
}

impl Mode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" | "chat" => Some(Mode::Text),
            "voice" | "s2s" | "stream" | "speech" => Some(Mode::Stream),
            _ => None,
        }
    }
}

enum TurnInput {
    Audio(Vec<u8>),
    Text(String),
}

struct PipelineContext {
    session_id: Option<String>,
    manifest: Option<Manifest>,
    mode: Mode,
    stage: Stage,
    input: Vec<u8>,
    history: Vec<ChatMessage>,
    adapters: Option<Arc<Adapters>>,
}

struct Inner<B> {
    backend: Arc<B>,
    config: PipelineConfig,
    out: UnboundedSender<Outgoing>,
    log: Option<SessionLog>,
    context: Mutex<PipelineContext>,
}

/// One connected client. Clones share the same state.
pub struct Session<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Session<B> {
    pub fn new(backend: Arc<B>, config: PipelineConfig, out: UnboundedSender<Outgoing>) -> Self {
        let log = config.session_dir.clone().map(SessionLog::new);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                out,
                log,
                context: Mutex::new(PipelineContext {
                    session_id: None,
                    manifest: None,
                    mode: Mode::Text,
                    stage: Stage::Idle,
                    input: Vec::new(),
                    history: Vec::new(),
                    adapters: None,
                }),
            }),
        }
    }

    pub fn stage(&self) -> Stage {
        self.inner.lock().stage
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.inner.lock().manifest.clone()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.lock().history.clone()
    }

    /// Dispatch one client message. Work that outlives the call (a load or a
    /// turn) runs on its own task, whose handle is returned.
    pub fn handle(&self, incoming: Incoming) -> Option<JoinHandle<()>> {
        match incoming {
            Incoming::Audio(bytes) => self.push_audio(&bytes),
            Incoming::Control(ClientMessage::SessionInit { session_id }) => {
                self.init(&session_id);
                None
            }
            Incoming::Control(ClientMessage::Config { mode, loadout }) => {
                self.configure(&mode, loadout.as_slice())
            }
            Incoming::Control(ClientMessage::Message { content }) => self.submit_text(content),
            Incoming::Control(ClientMessage::Ping) => {
                let stage = self.stage();
                self.inner.notify(ServerMessage::status(stage.as_str()));
                None
            }
        }
    }

    /// Attach to `session_id`, reloading its logged history.
    pub fn init(&self, session_id: &str) {
        let history = match &self.inner.log {
            Some(log) => match log.load(session_id) {
                Ok(entries) => entries
                    .into_iter()
                    .map(|entry| match entry.role {
                        Role::User => ChatMessage::user(entry.content),
                        Role::Assistant => ChatMessage::assistant(entry.content),
                    })
                    .collect(),
                Err(e) => {
                    self.inner.notify(ServerMessage::error(e.to_string()));
                    return;
                }
            },
            None => Vec::new(),
        };
        let stage = {
            let mut context = self.inner.lock();
            if !context.stage.accepts_input() {
                drop(context);
                self.inner.notify(ServerMessage::error("session is busy"));
                return;
            }
            log::info!(
                "session {} attached with {} logged messages",
                session_id,
                history.len()
            );
            context.session_id = Some(session_id.to_string());
            context.history = history;
            trim_history(&mut context.history, self.inner.config.history_turns);
            context.stage
        };
        self.inner.notify(ServerMessage::status(stage.as_str()));
    }

    /// Switch mode and loadout. The backend brings up the models on a separate task.
    pub fn configure<S: AsRef<str>>(&self, mode: &str, loadout: &[S]) -> Option<JoinHandle<()>> {
        let Some(mode) = Mode::parse(mode) else {
            self.inner.notify(ServerMessage::error(format!("unknown mode {mode:?}")));
            return None;
        };
        let manifest = match Manifest::parse(loadout) {
            Ok(manifest) => manifest,
            Err(e) => {
                self.inner.notify(ServerMessage::error(PipelineError::from(e).to_string()));
                return None;
            }
        };
        if mode == Mode::Stream && (manifest.stt.is_none() || manifest.tts.is_none()) {
            self.inner.notify(ServerMessage::error(format!(
                "invalid loadout: streaming mode needs speech-to-text and text-to-speech, got {manifest}"
            )));
            return None;
        }

        let previous = {
            let mut context = self.inner.lock();
            if !context.stage.accepts_input() {
                drop(context);
                self.inner.notify(ServerMessage::error("session is busy"));
                return None;
            }
            context.stage = Stage::Loading;
            context.input.clear();
            context.manifest = None;
            context.adapters.take()
        };
        self.inner.notify(ServerMessage::status(Stage::Loading.as_str()));

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.unload().await;
            }
            let activated = inner.backend.activate(&manifest).await;
            match activated {
                Ok(adapters) => {
                    log::info!("session ready with {}", manifest);
                    let mut context = inner.lock();
                    context.mode = mode;
                    context.manifest = Some(manifest);
                    context.adapters = Some(Arc::new(adapters));
                }
                Err(e) => {
                    log::error!("loading {} failed: {}", manifest, e);
                    inner.notify(ServerMessage::error(e.to_string()));
                }
            }
            inner.enter(Stage::Idle);
        }))
    }

    /// Buffer client PCM; a full buffer starts a turn.
    pub fn push_audio(&self, bytes: &[u8]) -> Option<JoinHandle<()>> {
        let threshold = self.inner.config.threshold_bytes();
        let (pcm, adapters, mode) = {
            let mut context = self.inner.lock();
            if !context.stage.accepts_input() {
                log::debug!("{} bytes of audio dropped while {}", bytes.len(), context.stage);
                return None;
            }
            if context.mode != Mode::Stream {
                log::debug!("audio dropped outside streaming mode");
                return None;
            }
            let adapters = context.adapters.clone()?;
            context.input.extend_from_slice(bytes);
            if context.input.len() < threshold {
                if context.stage == Stage::Idle {
                    context.stage = Stage::Listening;
                    drop(context);
                    self.inner.notify(ServerMessage::status(Stage::Listening.as_str()));
                }
                return None;
            }
            context.stage = Stage::Thinking;
            (std::mem::take(&mut context.input), adapters, context.mode)
        };
        self.inner.notify(ServerMessage::status(Stage::Thinking.as_str()));
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(inner.run_turn(TurnInput::Audio(pcm), adapters, mode)))
    }

    /// Run a turn on typed input, skipping speech-to-text.
    pub fn submit_text(&self, text: String) -> Option<JoinHandle<()>> {
        let (adapters, mode) = {
            let mut context = self.inner.lock();
            if !context.stage.accepts_input() {
                log::debug!("message dropped while {}", context.stage);
                return None;
            }
            let Some(adapters) = context.adapters.clone() else {
                drop(context);
                self.inner.notify(ServerMessage::error("no loadout configured"));
                return None;
            };
            context.stage = Stage::Thinking;
            context.input.clear();
            (adapters, context.mode)
        };
        self.inner.notify(ServerMessage::status(Stage::Thinking.as_str()));
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(inner.run_turn(TurnInput::Text(text), adapters, mode)))
    }
}

impl<B: Backend> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, PipelineContext> {
        self.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, message: ServerMessage) {
        if self.out.send(Outgoing::Control(message)).is_err() {
            log::debug!("client gone, message dropped");
        }
    }

    fn enter(&self, stage: Stage) {
        self.lock().stage = stage;
        self.notify(ServerMessage::status(stage.as_str()));
    }

    async fn run_turn(self: Arc<Self>, input: TurnInput, adapters: Arc<Adapters>, mode: Mode) {
        match Arc::clone(&self).turn(input, &adapters, mode).await {
            Ok(()) => {}
            Err(PipelineError::ChannelClosed) => log::debug!("client gone during turn"),
            Err(e) => {
                log::error!("turn failed: {}", e);
                self.notify(ServerMessage::error(e.to_string()));
            }
        }
        self.enter(Stage::Idle);
    }

    async fn turn(self: Arc<Self>, input: TurnInput, adapters: &Adapters, mode: Mode) -> Result<()> {
        let speaking = Arc::clone(&self);
        let mut mux = Multiplexer::new(self.out.clone(), Stopwatch::start())
            .on_first_sentence(move || speaking.enter(Stage::Speaking));
        let (text, start, end) = match input {
            TurnInput::Audio(pcm) => {
                let stt = adapters.stt.as_ref().ok_or_else(|| {
                    PipelineError::Session("loadout has no speech-to-text".into())
                })?;
                let start = mux.elapsed();
                let text = stt.infer(pcm).await?;
                let end = mux.elapsed();
                mux.record_stt(start, end);
                (text, start, end)
            }
            TurnInput::Text(text) => {
                let now = mux.elapsed();
                (text, now, now)
            }
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            log::debug!("empty input, no turn");
            return Ok(());
        }

        // from here on the frame stream is open and must end with `M`
        mux.user_text(&text, start, end)?;
        let reply = match self.respond(&mut mux, &text, adapters, mode).await {
            Ok(reply) => reply,
            Err(e) => {
                if mux.finish().is_err() {
                    log::debug!("client gone before the stream was closed");
                }
                return Err(e);
            }
        };
        let metrics = mux.finish()?;
        log::info!(
            "turn done in {:.3}s ({} chars in, {} chars out)",
            metrics.total,
            text.len(),
            reply.len()
        );

        self.out.send(Outgoing::Control(ServerMessage::Log {
            role: Role::Assistant,
            content: reply.clone(),
        }))?;
        self.remember(text, reply);
        Ok(())
    }

    /// Run the language model on `text` with the session history and relay its reply.
    async fn respond(
        &self,
        mux: &mut Multiplexer,
        text: &str,
        adapters: &Adapters,
        mode: Mode,
    ) -> Result<String> {
        self.out.send(Outgoing::Control(ServerMessage::Log {
            role: Role::User,
            content: text.to_string(),
        }))?;

        let messages = {
            let context = self.lock();
            let mut messages = Vec::with_capacity(context.history.len() + 2);
            messages.push(ChatMessage::system(&self.config.system_prompt));
            messages.extend(context.history.iter().cloned());
            messages.push(ChatMessage::user(text));
            messages
        };

        let mut tokens = adapters.llm.infer(messages).await?;
        let tts = match mode {
            Mode::Stream => adapters.tts.as_ref(),
            Mode::Text => None,
        };
        mux.relay(&mut tokens, tts).await
    }

    /// Add a finished exchange to the history and the session log.
    fn remember(&self, user: String, assistant: String) {
        let session_id = {
            let mut context = self.lock();
            context.history.push(ChatMessage::user(&user));
            context.history.push(ChatMessage::assistant(&assistant));
            trim_history(&mut context.history, self.config.history_turns);
            context.session_id.clone()
        };
        if let (Some(log), Some(session_id)) = (&self.log, session_id) {
            let entries = [
                LogEntry::now(Role::User, user),
                LogEntry::now(Role::Assistant, assistant),
            ];
            if let Err(e) = log.append(&session_id, &entries) {
                log::warn!("session log for {}: {}", session_id, e);
            }
        }
    }
}

fn trim_history(history: &mut Vec<ChatMessage>, turns: usize) {
    let keep = turns * 2;
    if history.len() > keep {
        history.drain(..history.len() - keep);
    }
    // never start the window with an assistant message
    while history.first().is_some_and(|m| m.role == ChatRole::Assistant) {
        history.remove(0);
    }
}
