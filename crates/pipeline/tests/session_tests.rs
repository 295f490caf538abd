use {
    com::{ClientMessage, Incoming, Outgoing, Role, ServerMessage, StreamFrame},
    pipeline::{
        Adapters, ChatMessage, HttpTts, LlmAdapter, OllamaChat, PipelineConfig, Session, Stage,
        StubBackend, StubLlm, StubStt, StubTts, SttAdapter, TtsAdapter,
    },
    std::{sync::Arc, time::Duration},
    tempfile::tempdir,
    tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel},
};

const VOICE: [&str; 3] = ["whisper-tiny", "OL_demo-model", "tts-default"];

/// Half of the 0.1 s turn threshold at 16 kHz.
const HALF_CHUNK: usize = 1600;

fn config() -> PipelineConfig {
    PipelineConfig {
        buffer_seconds: 0.1,
        ..PipelineConfig::default()
    }
}

fn start(
    backend: StubBackend,
    config: PipelineConfig,
) -> (Arc<StubBackend>, Session<StubBackend>, UnboundedReceiver<Outgoing>) {
    let backend = Arc::new(backend);
    let (tx, rx) = unbounded_channel();
    let session = Session::new(Arc::clone(&backend), config, tx);
    (backend, session, rx)
}

fn drain(rx: &mut UnboundedReceiver<Outgoing>) -> Vec<Outgoing> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn statuses(messages: &[Outgoing]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Outgoing::Control(ServerMessage::Status { state }) => Some(state.clone()),
            _ => None,
        })
        .collect()
}

fn errors(messages: &[Outgoing]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Outgoing::Control(ServerMessage::Error { message }) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn frames(messages: &[Outgoing]) -> Vec<StreamFrame> {
    messages
        .iter()
        .filter_map(|m| match m {
            Outgoing::Frame(frame) => Some(frame.clone()),
            _ => None,
        })
        .collect()
}

async fn configure(session: &Session<StubBackend>, mode: &str, loadout: &[&str]) {
    session
        .configure(mode, loadout)
        .expect("configure should start loading")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_voice_turn_end_to_end() {
    let (_, session, mut rx) = start(
        StubBackend::scripted("what time is it", "It is noon.", 24_000),
        config(),
    );
    configure(&session, "voice", &VOICE).await;
    assert_eq!(statuses(&drain(&mut rx)), vec!["LOADING", "IDLE"]);

    assert!(session.push_audio(&[0; HALF_CHUNK]).is_none());
    assert_eq!(session.stage(), Stage::Listening);
    session.push_audio(&[0; HALF_CHUNK]).unwrap().await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(
        statuses(&messages),
        vec!["LISTENING", "THINKING", "SPEAKING", "IDLE"]
    );
    let frames = frames(&messages);
    assert_eq!(frames.len(), 4);
    assert!(
        matches!(&frames[0], StreamFrame::Text(t) if t.role == Role::User && t.text == "what time is it")
    );
    assert!(
        matches!(&frames[1], StreamFrame::Text(t) if t.role == Role::Assistant && t.text == "It is noon.")
    );
    assert!(matches!(&frames[2], StreamFrame::Audio(a) if !a.is_empty()));
    let StreamFrame::Metrics(metrics) = &frames[3] else {
        panic!("last frame should be metrics, got {:?}", frames[3]);
    };
    assert!(metrics.stt.is_some() && metrics.llm.is_some() && metrics.tts.is_some());

    assert!(messages.contains(&Outgoing::Control(ServerMessage::Log {
        role: Role::Assistant,
        content: "It is noon.".into(),
    })));
    assert_eq!(
        session.history(),
        vec![
            ChatMessage::user("what time is it"),
            ChatMessage::assistant("It is noon.")
        ]
    );
    assert_eq!(session.stage(), Stage::Idle);
}

#[tokio::test]
async fn test_input_during_a_turn_is_dropped() {
    let slow = Adapters {
        stt: Some(SttAdapter::Stub(StubStt::new("tell me a story"))),
        llm: LlmAdapter::Stub(
            StubLlm::new(["Once ", "upon ", "a ", "time."]).with_delay(Duration::from_millis(30)),
        ),
        tts: Some(TtsAdapter::Stub(StubTts::new(24_000))),
    };
    let (backend, session, mut rx) = start(StubBackend::new(slow), config());
    configure(&session, "voice", &VOICE).await;

    let turn = session.push_audio(&[0; 2 * HALF_CHUNK]).unwrap();
    assert_eq!(session.stage(), Stage::Thinking);
    assert!(session.push_audio(&[0; 2 * HALF_CHUNK]).is_none());
    assert!(session.submit_text("interrupt".into()).is_none());
    assert!(session.configure("text", &["OL_other"]).is_none());
    turn.await.unwrap();

    let messages = drain(&mut rx);
    let user_frames = frames(&messages)
        .into_iter()
        .filter(|f| matches!(f, StreamFrame::Text(t) if t.role == Role::User))
        .count();
    assert_eq!(user_frames, 1);
    assert_eq!(session.history().len(), 2);
    assert_eq!(backend.activations(), 1);
    assert_eq!(session.stage(), Stage::Idle);
}

#[tokio::test]
async fn test_failed_mode_switch_returns_to_idle_with_one_error() {
    let (_, session, mut rx) = start(StubBackend::failing("no GPU memory left"), config());
    configure(&session, "voice", &VOICE).await;

    let messages = drain(&mut rx);
    assert_eq!(statuses(&messages), vec!["LOADING", "IDLE"]);
    let errors = errors(&messages);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("no GPU memory left"));
    assert_eq!(session.stage(), Stage::Idle);
    assert!(session.manifest().is_none());
    assert!(session.push_audio(&[0; 4 * HALF_CHUNK]).is_none());
}

/// Nothing listens on port 1, so every request to it fails.
const DEAD_URL: &str = "http://127.0.0.1:1";

#[tokio::test]
async fn test_failed_synthesis_still_ends_the_stream() {
    let adapters = Adapters {
        stt: Some(SttAdapter::Stub(StubStt::new("say something"))),
        llm: LlmAdapter::Stub(StubLlm::from_reply("Something. And more.")),
        tts: Some(TtsAdapter::Http(HttpTts::new(
            reqwest::Client::new(),
            DEAD_URL,
            24_000,
        ))),
    };
    let (_, session, mut rx) = start(StubBackend::new(adapters), config());
    configure(&session, "voice", &VOICE).await;
    drain(&mut rx);

    session.push_audio(&[0; 2 * HALF_CHUNK]).unwrap().await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(errors(&messages).len(), 1);
    let frames = frames(&messages);
    assert!(matches!(&frames[0], StreamFrame::Text(t) if t.role == Role::User));
    assert!(frames.last().is_some_and(StreamFrame::is_end), "got {frames:?}");
    assert!(!frames.iter().any(|f| matches!(f, StreamFrame::Audio(_))));
    assert_eq!(statuses(&messages).last().map(String::as_str), Some("IDLE"));
    assert!(session.history().is_empty());
    assert_eq!(session.stage(), Stage::Idle);
}

#[tokio::test]
async fn test_failed_language_model_still_ends_the_stream() {
    let adapters = Adapters {
        stt: None,
        llm: LlmAdapter::Ollama(OllamaChat::new(
            reqwest::Client::new(),
            DEAD_URL,
            "demo-model",
            4096,
        )),
        tts: None,
    };
    let (_, session, mut rx) = start(StubBackend::new(adapters), config());
    configure(&session, "text", &["OL_demo-model"]).await;
    drain(&mut rx);

    session.submit_text("hello".into()).unwrap().await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(errors(&messages).len(), 1);
    let frames = frames(&messages);
    assert_eq!(frames.len(), 2, "got {frames:?}");
    assert!(matches!(&frames[0], StreamFrame::Text(t) if t.text == "hello"));
    assert!(matches!(&frames[1], StreamFrame::Metrics(m) if m.llm.is_none()));
}

#[tokio::test]
async fn test_bad_loadouts_are_rejected_before_loading() {
    let (backend, session, mut rx) = start(StubBackend::scripted("", "", 24_000), config());
    assert!(session.configure("voice", &["OL_demo-model"]).is_none());
    assert!(session.configure("voice", &["whisper-tiny", "tts-default"]).is_none());
    assert!(session.configure("telepathy", &VOICE).is_none());

    let messages = drain(&mut rx);
    assert_eq!(errors(&messages).len(), 3);
    assert!(statuses(&messages).is_empty());
    assert_eq!(backend.activations(), 0);
}

#[tokio::test]
async fn test_text_message_skips_speech() {
    let (_, session, mut rx) = start(
        StubBackend::scripted("unused", "Hi. Nice to meet you.", 24_000),
        config(),
    );
    configure(&session, "text", &["OL_demo-model#ctx=4k"]).await;
    drain(&mut rx);

    // audio is ignored outside streaming mode
    assert!(session.push_audio(&[0; 4 * HALF_CHUNK]).is_none());

    session
        .handle(Incoming::Control(ClientMessage::Message {
            content: "hello".into(),
        }))
        .unwrap()
        .await
        .unwrap();
    let frames = frames(&drain(&mut rx));
    let texts: Vec<(Role, String)> = frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::Text(t) => Some((t.role, t.text.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        texts,
        vec![
            (Role::User, "hello".to_string()),
            (Role::Assistant, "Hi.".to_string()),
            (Role::Assistant, "Nice to meet you.".to_string()),
        ]
    );
    assert!(!frames.iter().any(|f| matches!(f, StreamFrame::Audio(_))));
    assert!(matches!(frames.last(), Some(StreamFrame::Metrics(m)) if m.stt.is_none()));
}

#[tokio::test]
async fn test_message_without_loadout_is_an_error() {
    let (_, session, mut rx) = start(StubBackend::scripted("", "", 24_000), config());
    assert!(session.submit_text("hello".into()).is_none());
    assert_eq!(errors(&drain(&mut rx)).len(), 1);
}

#[tokio::test]
async fn test_ping_reports_stage() {
    let (_, session, mut rx) = start(StubBackend::scripted("", "", 24_000), config());
    assert!(session.handle(Incoming::Control(ClientMessage::Ping)).is_none());
    assert_eq!(statuses(&drain(&mut rx)), vec!["IDLE"]);
}

#[tokio::test]
async fn test_session_history_survives_reattach() {
    let dir = tempdir().unwrap();
    let config = PipelineConfig {
        session_dir: Some(dir.path().to_path_buf()),
        ..config()
    };

    let (_, session, _rx) = start(StubBackend::scripted("", "Sure.", 24_000), config.clone());
    session.handle(Incoming::Control(ClientMessage::SessionInit {
        session_id: "client-7".into(),
    }));
    configure(&session, "text", &["OL_demo-model"]).await;
    session.submit_text("remember me".into()).unwrap().await.unwrap();
    drop(session);

    let (_, again, mut rx) = start(StubBackend::scripted("", "", 24_000), config);
    again.init("client-7");
    assert_eq!(
        again.history(),
        vec![ChatMessage::user("remember me"), ChatMessage::assistant("Sure.")]
    );
    assert_eq!(statuses(&drain(&mut rx)), vec!["IDLE"]);

    again.init("../escape");
    assert_eq!(errors(&drain(&mut rx)).len(), 1);
}
