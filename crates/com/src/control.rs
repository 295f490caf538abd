use {
    crate::Role,
    serde::{Deserialize, Serialize},
};

/// JSON messages a client sends on the control channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionInit {
        session_id: String,
    },
    Config {
        mode: String,
        #[serde(default)]
        loadout: Vec<String>,
    },
    Message {
        content: String,
    },
    Ping,
}

/// JSON messages the server sends on the control channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { state: String },
    Log { role: Role, content: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn status(state: impl Into<String>) -> Self {
        ServerMessage::Status {
            state: state.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
