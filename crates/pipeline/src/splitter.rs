fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Accumulates LLM tokens and cuts them into sentences at `.`, `!` and `?`.
///
/// A run of terminators (`...`, `?!`) stays with its sentence, even when it
/// arrives over several tokens: a run touching the end of the buffer is held
/// until something else follows it or the stream ends. Sentences are trimmed;
/// whitespace-only pieces are dropped.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token and return every sentence it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut sentences = Vec::new();
        while let Some(end) = self.sentence_end() {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Flush whatever is left once the token stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn sentence_end(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !is_terminator(c) {
                continue;
            }
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if !is_terminator(next) {
                    break;
                }
                end = j + next.len_utf8();
                chars.next();
            }
            // the run may continue in the next token
            return (end < self.buffer.len()).then_some(end);
        }
        None
    }
}
