use {
    super::Outgoing,
    crate::{ClientMessage, ComError, ServerMessage, StreamFrame, frame::MAX_MESSAGE_SIZE},
    futures_util::{SinkExt, StreamExt},
    std::net::SocketAddr,
    tokio_websockets::{ClientBuilder, MaybeTlsStream, Message, WebSocketStream},
};

/// Client side of the control/stream channel.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ComError> {
        let uri: http::Uri = format!("ws://{}", addr).parse().map_err(|e| {
            ComError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid WebSocket URI: {e}"),
            ))
        })?;
        let (stream, _response) = ClientBuilder::from_uri(uri).connect().await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ComError> {
        self.send_text(&serde_json::to_string(message)?).await
    }

    /// Send an arbitrary text message on the control channel.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ComError> {
        self.stream.send(Message::text(text.to_string())).await?;
        Ok(())
    }

    /// Send a chunk of 16-bit little-endian PCM input.
    pub async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<(), ComError> {
        self.stream.send(Message::binary(pcm)).await?;
        Ok(())
    }

    /// Receive the next control message or stream frame from the server.
    pub async fn recv(&mut self) -> Result<Outgoing, ComError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(ComError::from(e)),
                None => return Err(ComError::ConnectionClosed),
            };
            if let Some(text) = message.as_text() {
                let control: ServerMessage = serde_json::from_str(text)?;
                return Ok(Outgoing::Control(control));
            }
            if message.is_binary() {
                let payload = message.into_payload();
                if payload.len() > MAX_MESSAGE_SIZE as usize {
                    return Err(ComError::MessageTooLarge(payload.len() as u32));
                }
                let (frame, _) = StreamFrame::decode(&payload)?;
                return Ok(Outgoing::Frame(frame));
            }
        }
    }
}
