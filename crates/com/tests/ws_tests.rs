use {
    com::{
        ClientMessage, Incoming, Outgoing, Role, ServerMessage, StreamFrame, TextFragment,
        WsClient, WsServer,
    },
    tokio::time::{Duration, timeout},
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_control_message_reaches_connection() {
    let mut server = WsServer::bind("127.0.0.1:0").await.expect("bind failed");
    let mut client = WsClient::connect(server.local_addr()).await.expect("connect failed");
    let mut connection = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    client.send(&ClientMessage::Ping).await.unwrap();
    let incoming = timeout(WAIT, connection.recv()).await.unwrap().unwrap();
    assert_eq!(incoming, Incoming::Control(ClientMessage::Ping));
}

#[tokio::test]
async fn test_binary_message_is_audio() {
    let mut server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let mut client = WsClient::connect(server.local_addr()).await.unwrap();
    let mut connection = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    client.send_audio(vec![1, 2, 3, 4]).await.unwrap();
    let incoming = timeout(WAIT, connection.recv()).await.unwrap().unwrap();
    assert_eq!(incoming, Incoming::Audio(vec![1, 2, 3, 4]));
}

#[tokio::test]
async fn test_outgoing_order_is_preserved() {
    let mut server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let mut client = WsClient::connect(server.local_addr()).await.unwrap();
    let connection = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    let sent = vec![
        Outgoing::Control(ServerMessage::status("THINKING")),
        Outgoing::Frame(StreamFrame::Text(TextFragment::new(Role::Assistant, "Hi.", 0.1, 0.2))),
        Outgoing::Frame(StreamFrame::Audio(vec![7; 32])),
    ];
    for message in &sent {
        connection.send(message.clone()).unwrap();
    }

    for expected in sent {
        let received = timeout(WAIT, client.recv()).await.unwrap().unwrap();
        assert_eq!(received, expected);
    }
}

#[tokio::test]
async fn test_invalid_control_message_answers_with_error() {
    let mut server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let mut client = WsClient::connect(server.local_addr()).await.unwrap();
    let _connection = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    client.send_text(r#"{"type":"launch"}"#).await.unwrap();
    match timeout(WAIT, client.recv()).await.unwrap().unwrap() {
        Outgoing::Control(ServerMessage::Error { message }) => {
            assert!(message.contains("invalid control message"))
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recv_after_client_disconnect_is_closed() {
    let mut server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let client = WsClient::connect(server.local_addr()).await.unwrap();
    let mut connection = timeout(WAIT, server.accept()).await.unwrap().unwrap();
    drop(client);

    let result = timeout(WAIT, connection.recv()).await.unwrap();
    assert!(result.is_err());
}
