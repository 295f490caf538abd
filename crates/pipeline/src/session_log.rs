use {
    crate::{PipelineError, Result},
    base::{format_timestamp, log},
    com::Role,
    serde::{Deserialize, Serialize},
    std::{
        fs::{self, OpenOptions},
        io::Write,
        path::PathBuf,
    },
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub role: Role,
    pub content: String,
    pub at: String,
}

impl LogEntry {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: format_timestamp(),
        }
    }
}

/// Append-only conversation log, one JSON line per entry in `<dir>/<session_id>.jsonl`.
#[derive(Clone, Debug)]
pub struct SessionLog {
    dir: PathBuf,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id.len() <= 128
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PipelineError::Session(format!(
                "invalid session id {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.jsonl")))
    }

    pub fn append(&self, session_id: &str, entries: &[LogEntry]) -> Result<()> {
        let path = self.path(session_id)?;
        fs::create_dir_all(&self.dir)?;
        let mut lines = String::new();
        for entry in entries {
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(lines.as_bytes())?;
        Ok(())
    }

    /// Every entry logged for `session_id`; a session never seen before has none.
    pub fn load(&self, session_id: &str) -> Result<Vec<LogEntry>> {
        let path = self.path(session_id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("{}:{}: skipping bad entry: {}", path.display(), n + 1, e),
            }
        }
        Ok(entries)
    }
}
