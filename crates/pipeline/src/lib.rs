pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod llm;
pub mod multiplexer;
pub mod session;
pub mod session_log;
pub mod splitter;
pub mod stt;
pub mod tts;

pub use adapter::{Adapter, Adapters, ChatMessage, ChatRole, TokenStream};
pub use backend::{Backend, FleetBackend, StubBackend};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use llm::{LlmAdapter, OllamaChat, OpenAiChat, StubLlm};
pub use multiplexer::Multiplexer;
pub use session::{Mode, Session, Stage};
pub use session_log::{LogEntry, SessionLog};
pub use splitter::SentenceSplitter;
pub use stt::{HttpStt, StubStt, SttAdapter};
pub use tts::{HttpTts, StubTts, TtsAdapter};
