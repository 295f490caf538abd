pub mod control;
pub mod error;
pub mod frame;
pub mod framing;
pub mod ws;

pub use control::{ClientMessage, ServerMessage};
pub use error::ComError;
pub use frame::{
    Metrics, Role, StageSpan, StreamFrame, TextFragment, bytes_to_pcm, decode_all, pcm_to_bytes,
};
pub use ws::{Incoming, Outgoing, WsClient, WsConnection, WsServer};
