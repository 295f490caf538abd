//! Turns one LLM token stream into the ordered frame stream a client receives.
//!
//! Per completed sentence the client gets a `T` frame followed by the `A` frame
//! with its audio; a final `M` frame carries per-stage timings and ends the
//! stream. All offsets are seconds since the request's stopwatch started.

use {
    crate::{Adapter, Result, SentenceSplitter, TokenStream, TtsAdapter},
    base::{Stopwatch, round_millis},
    com::{Metrics, Outgoing, Role, StageSpan, StreamFrame, TextFragment},
    tokio::sync::mpsc::UnboundedSender,
};

fn mark(span: &mut Option<StageSpan>, t: f64) {
    match span {
        Some(span) => span.extend(t),
        None => *span = Some(StageSpan::at(t)),
    }
}

pub struct Multiplexer {
    out: UnboundedSender<Outgoing>,
    clock: Stopwatch,
    metrics: Metrics,
    on_first_sentence: Option<Box<dyn FnOnce() + Send>>,
}

impl Multiplexer {
    pub fn new(out: UnboundedSender<Outgoing>, clock: Stopwatch) -> Self {
        Self {
            out,
            clock,
            metrics: Metrics::default(),
            on_first_sentence: None,
        }
    }

    /// Run `hook` once, just before the first sentence is handed to synthesis.
    pub fn on_first_sentence(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_first_sentence = Some(Box::new(hook));
        self
    }

    pub fn elapsed(&self) -> f64 {
        self.clock.elapsed_secs()
    }

    fn send(&self, frame: StreamFrame) -> Result<()> {
        self.out.send(Outgoing::Frame(frame))?;
        Ok(())
    }

    /// Emit the user's side of the turn.
    pub fn user_text(&mut self, text: &str, start: f64, end: f64) -> Result<()> {
        self.send(StreamFrame::Text(TextFragment::new(Role::User, text, start, end)))
    }

    pub fn record_stt(&mut self, start: f64, end: f64) {
        mark(&mut self.metrics.stt, start);
        mark(&mut self.metrics.stt, end);
    }

    /// Drain `tokens`, speaking each sentence as soon as it completes.
    /// Without `tts` only text frames are sent. Returns the full reply.
    pub async fn relay(&mut self, tokens: &mut TokenStream, tts: Option<&TtsAdapter>) -> Result<String> {
        let mut splitter = SentenceSplitter::new();
        let mut reply = String::new();
        while let Some(token) = tokens.next().await {
            let token = token?;
            let now = self.elapsed();
            mark(&mut self.metrics.llm, now);
            reply.push_str(&token);
            for sentence in splitter.push(&token) {
                self.speak(sentence, tts).await?;
            }
        }
        if let Some(rest) = splitter.finish() {
            self.speak(rest, tts).await?;
        }
        Ok(reply.trim().to_string())
    }

    async fn speak(&mut self, sentence: String, tts: Option<&TtsAdapter>) -> Result<()> {
        if let Some(hook) = self.on_first_sentence.take() {
            hook();
        }
        let start = self.elapsed();
        let audio = match tts {
            Some(tts) => Some(tts.infer(sentence.clone()).await?),
            None => None,
        };
        let end = self.elapsed();
        // tts span holds completion times
        if audio.is_some() {
            mark(&mut self.metrics.tts, end);
        }
        self.send(StreamFrame::Text(TextFragment::new(
            Role::Assistant,
            sentence,
            start,
            end,
        )))?;
        if let Some(audio) = audio {
            self.send(StreamFrame::Audio(audio))?;
        }
        Ok(())
    }

    /// Send the closing metrics frame.
    pub fn finish(mut self) -> Result<Metrics> {
        self.metrics.total = round_millis(self.elapsed());
        for span in [&mut self.metrics.stt, &mut self.metrics.llm, &mut self.metrics.tts]
            .into_iter()
            .flatten()
        {
            span.first = round_millis(span.first);
            span.last = round_millis(span.last);
        }
        let metrics = self.metrics.clone();
        self.send(StreamFrame::Metrics(metrics.clone()))?;
        Ok(metrics)
    }
}
