pub mod client;
pub mod server;

pub use client::WsClient;
pub use server::{WsConnection, WsServer};

use crate::{ClientMessage, ServerMessage, StreamFrame};

/// What a client sends: control JSON as text messages, raw PCM as binary messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Control(ClientMessage),
    Audio(Vec<u8>),
}

/// What the server sends: control JSON as text messages, one stream frame per binary message.
#[derive(Clone, Debug, PartialEq)]
pub enum Outgoing {
    Control(ServerMessage),
    Frame(StreamFrame),
}
