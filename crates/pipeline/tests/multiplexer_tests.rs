use {
    base::Stopwatch,
    com::{Outgoing, Role, StreamFrame},
    pipeline::{Multiplexer, StubTts, TokenStream, TtsAdapter},
    std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    },
    tokio::sync::mpsc,
};

fn frames(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Outgoing::Frame(frame) = message {
            frames.push(frame);
        }
    }
    frames
}

#[tokio::test]
async fn test_text_and_audio_interleave_per_sentence() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tts = TtsAdapter::Stub(StubTts::new(24_000).with_latency(Duration::from_millis(5)));
    let mut tokens = TokenStream::from_tokens(["One", " two.", " Three", " four!", " Five"]);

    let mut mux = Multiplexer::new(tx, Stopwatch::start());
    let reply = mux.relay(&mut tokens, Some(&tts)).await.unwrap();
    let metrics = mux.finish().unwrap();
    assert_eq!(reply, "One two. Three four! Five");

    let frames = frames(&mut rx);
    assert_eq!(frames.len(), 7);
    let mut last_end = 0.0;
    for (n, pair) in frames[..6].chunks(2).enumerate() {
        let StreamFrame::Text(text) = &pair[0] else {
            panic!("expected text at {n}, got {:?}", pair[0]);
        };
        assert_eq!(text.role, Role::Assistant);
        assert!(text.end > last_end, "sentence {n} ends at {} after {}", text.end, last_end);
        assert!(text.start <= text.end);
        last_end = text.end;
        let StreamFrame::Audio(audio) = &pair[1] else {
            panic!("expected audio at {n}, got {:?}", pair[1]);
        };
        assert_eq!(audio.len(), text.text.chars().count() * 240 * 2);
    }
    assert_eq!(frames[6], StreamFrame::Metrics(metrics.clone()));

    let tts_span = metrics.tts.unwrap();
    let llm_span = metrics.llm.unwrap();
    assert!(metrics.stt.is_none());
    assert!(tts_span.last >= tts_span.first);
    assert!(llm_span.first <= tts_span.first);
    assert!(metrics.total >= tts_span.last);
}

#[tokio::test]
async fn test_first_audio_is_timed_when_synthesis_completes() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tts = TtsAdapter::Stub(StubTts::new(24_000).with_latency(Duration::from_millis(20)));
    let mut tokens = TokenStream::from_tokens(["Hi there.", " Bye."]);
    let mut mux = Multiplexer::new(tx, Stopwatch::start());
    mux.relay(&mut tokens, Some(&tts)).await.unwrap();
    let metrics = mux.finish().unwrap();

    let frames = frames(&mut rx);
    let StreamFrame::Text(first) = &frames[0] else {
        panic!("expected text first, got {:?}", frames[0]);
    };
    let first_audio = metrics.time_to_first_audio().unwrap();
    assert_eq!(first_audio, first.end);
    assert!(first_audio - first.start >= 0.015, "{first_audio} vs {}", first.start);
}

#[tokio::test]
async fn test_without_tts_only_text_is_sent() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut tokens = TokenStream::from_tokens(["Hi", " there."]);
    let mut mux = Multiplexer::new(tx, Stopwatch::start());
    mux.relay(&mut tokens, None).await.unwrap();
    let metrics = mux.finish().unwrap();

    let frames = frames(&mut rx);
    assert_eq!(frames.len(), 2);
    assert!(matches!(&frames[0], StreamFrame::Text(t) if t.text == "Hi there."));
    assert!(metrics.tts.is_none());
}

#[tokio::test]
async fn test_first_sentence_hook_runs_once() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut tokens = TokenStream::from_tokens(["A. ", "B. ", "C."]);
    let mut mux = Multiplexer::new(tx, Stopwatch::start())
        .on_first_sentence(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    mux.relay(&mut tokens, None).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_closed_client_fails_the_relay() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let mut tokens = TokenStream::from_tokens(["Anyone there?"]);
    let mut mux = Multiplexer::new(tx, Stopwatch::start());
    assert!(mux.relay(&mut tokens, None).await.is_err());
}
