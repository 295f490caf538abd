use {
    super::{Incoming, Outgoing},
    crate::{ClientMessage, ComError, ServerMessage, frame::MAX_MESSAGE_SIZE},
    base::log,
    futures_util::{SinkExt, StreamExt},
    std::net::SocketAddr,
    tokio::{
        net::{TcpListener, TcpStream, ToSocketAddrs},
        sync::mpsc,
        task::JoinHandle,
    },
    tokio_websockets::{Message, ServerBuilder, WebSocketStream},
};

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

pub struct WsServer {
    rx: mpsc::Receiver<WsConnection>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl WsServer {
    /// Bind a TCP listener and start accepting WebSocket connections.
    ///
    /// Each accepted connection gets a reader task and a writer task and is
    /// handed out through `accept()`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, ComError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(16);

        let accept_task = tokio::spawn(async move {
            loop {
                let (tcp_stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let ws_stream = match ServerBuilder::new().accept(tcp_stream).await {
                    Ok((_request, ws_stream)) => ws_stream,
                    Err(e) => {
                        log::warn!("websocket handshake failed for {}: {}", peer, e);
                        continue;
                    }
                };
                log::info!("client {} connected", peer);
                if tx.send(WsConnection::start(peer, ws_stream)).await.is_err() {
                    break; // server dropped
                }
            }
        });

        Ok(Self {
            rx,
            accept_task,
            local_addr,
        })
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Result<WsConnection, ComError> {
        self.rx.recv().await.ok_or(ComError::ConnectionClosed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// One connected client.
///
/// Outgoing messages are queued on an unbounded channel so producers never
/// wait on a slow socket; the writer task drains it in order.
pub struct WsConnection {
    peer: SocketAddr,
    incoming: mpsc::Receiver<Incoming>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    tasks: [JoinHandle<()>; 2],
}

impl WsConnection {
    fn start(peer: SocketAddr, stream: WebSocketStream<TcpStream>) -> Self {
        let (sink, source) = stream.split();
        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(peer, source, in_tx, out_tx.clone()));
        let writer = tokio::spawn(write_loop(peer, sink, out_rx));

        Self {
            peer,
            incoming: in_rx,
            outgoing: out_tx,
            tasks: [reader, writer],
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Receive the next control message or audio chunk.
    ///
    /// Returns `ComError::ConnectionClosed` once the client has gone away.
    pub async fn recv(&mut self) -> Result<Incoming, ComError> {
        self.incoming.recv().await.ok_or(ComError::ConnectionClosed)
    }

    /// A cloneable handle for queueing messages to this client.
    pub fn sender(&self) -> mpsc::UnboundedSender<Outgoing> {
        self.outgoing.clone()
    }

    pub fn send(&self, message: Outgoing) -> Result<(), ComError> {
        self.outgoing
            .send(message)
            .map_err(|_| ComError::ConnectionClosed)
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop(
    peer: SocketAddr,
    mut source: WsSource,
    tx: mpsc::Sender<Incoming>,
    replies: mpsc::UnboundedSender<Outgoing>,
) {
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                log::warn!("client {} error: {}", peer, e);
                break;
            }
            None => {
                log::info!("client {} disconnected", peer);
                break;
            }
        };

        let incoming = if let Some(text) = message.as_text() {
            match serde_json::from_str::<ClientMessage>(text) {
                Ok(control) => Incoming::Control(control),
                Err(e) => {
                    log::warn!("bad control message from {}: {}", peer, e);
                    let _ = replies.send(Outgoing::Control(ServerMessage::error(format!(
                        "invalid control message: {e}"
                    ))));
                    continue;
                }
            }
        } else if message.is_binary() {
            let payload = message.into_payload();
            if payload.len() > MAX_MESSAGE_SIZE as usize {
                log::warn!("audio chunk from {} too large: {} bytes", peer, payload.len());
                continue;
            }
            Incoming::Audio(payload.to_vec())
        } else {
            continue; // ping, pong, close
        };

        if tx.send(incoming).await.is_err() {
            break; // connection handle dropped
        }
    }
}

async fn write_loop(
    peer: SocketAddr,
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = rx.recv().await {
        let message = match encode(&outgoing) {
            Ok(message) => message,
            Err(e) => {
                log::error!("failed to encode message for {}: {}", peer, e);
                continue;
            }
        };
        if let Err(e) = sink.send(message).await {
            log::warn!("failed to send to {}: {}", peer, e);
            break;
        }
    }
    let _ = sink.close().await;
}

fn encode(outgoing: &Outgoing) -> Result<Message, ComError> {
    Ok(match outgoing {
        Outgoing::Control(control) => Message::text(serde_json::to_string(control)?),
        Outgoing::Frame(frame) => Message::binary(frame.to_bytes()?),
    })
}
