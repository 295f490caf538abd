use {fleet::FleetError, std::fmt};

#[derive(Debug)]
pub enum PipelineError {
    /// A model adapter failed to load or infer.
    Adapter(String),
    Fleet(FleetError),
    Manifest(String),
    Config(String),
    /// The session cannot serve the request.
    Session(String),
    Io(String),
    Json(String),
    /// The client went away while a turn was running.
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Adapter(msg) => write!(f, "adapter error: {msg}"),
            PipelineError::Fleet(err) => write!(f, "{err}"),
            PipelineError::Manifest(msg) => write!(f, "invalid loadout: {msg}"),
            PipelineError::Config(msg) => write!(f, "config error: {msg}"),
            PipelineError::Session(msg) => write!(f, "session error: {msg}"),
            PipelineError::Io(msg) => write!(f, "io error: {msg}"),
            PipelineError::Json(msg) => write!(f, "json error: {msg}"),
            PipelineError::ChannelClosed => write!(f, "client channel closed"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Fleet(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FleetError> for PipelineError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::Manifest(msg) => PipelineError::Manifest(msg),
            other => PipelineError::Fleet(other),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Adapter(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PipelineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PipelineError::ChannelClosed
    }
}
