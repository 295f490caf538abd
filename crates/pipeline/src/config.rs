use {
    crate::{PipelineError, Result},
    std::path::PathBuf,
};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Answer in short, \
     natural spoken sentences without lists, markup or emoji.";

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Sample rate of client PCM input.
    pub input_sample_rate: u32,
    /// Sample rate of synthesized PCM output.
    pub output_sample_rate: u32,
    /// Seconds of buffered input that trigger a turn.
    pub buffer_seconds: f64,
    /// Completed user/assistant exchanges kept as LLM context.
    pub history_turns: usize,
    pub system_prompt: String,
    /// Where session logs go; `None` disables them.
    pub session_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            buffer_seconds: 2.0,
            history_turns: 10,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            session_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(dir) = get("S2S_SESSION_DIR") {
            config.session_dir = Some(PathBuf::from(dir));
        }
        if let Some(prompt) = get("S2S_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        if let Some(secs) = get("S2S_BUFFER_SECONDS") {
            config.buffer_seconds = secs
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|s| *s > 0.0)
                .ok_or_else(|| {
                    PipelineError::Config(format!("S2S_BUFFER_SECONDS: invalid value {secs:?}"))
                })?;
        }
        Ok(config)
    }

    /// Bytes of 16-bit mono input that make up one turn.
    pub fn threshold_bytes(&self) -> usize {
        (self.input_sample_rate as f64 * 2.0 * self.buffer_seconds) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_two_seconds_of_pcm() {
        assert_eq!(PipelineConfig::default().threshold_bytes(), 64_000);
    }

    #[test]
    fn test_from_lookup() {
        let config = PipelineConfig::from_lookup(|key| match key {
            "S2S_SESSION_DIR" => Some("/var/s2s/sessions".into()),
            "S2S_BUFFER_SECONDS" => Some("0.5".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.session_dir, Some(PathBuf::from("/var/s2s/sessions")));
        assert_eq!(config.threshold_bytes(), 16_000);

        assert!(PipelineConfig::from_lookup(|_| Some("-1".into())).is_err());
    }
}
