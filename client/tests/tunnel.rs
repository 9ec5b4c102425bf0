//! End-to-end tests against a fake relay and a fake local server

use futures_util::{SinkExt, StreamExt};
use outpost::{LinkState, TunnelClient, TunnelConfig};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type RelaySocket = WebSocketStream<TcpStream>;

struct Relay {
    listener: TcpListener,
    url: String,
}

impl Relay {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/tunnel", listener.local_addr().unwrap());
        Self { listener, url }
    }

    async fn accept(&self) -> RelaySocket {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        accept_async(stream).await.unwrap()
    }
}

async fn send_json(ws: &mut RelaySocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn send_binary(ws: &mut RelaySocket, payload: &[u8]) {
    ws.send(Message::Binary(payload.to_vec())).await.unwrap();
}

/// Next data or control frame, skipping heartbeats
async fn next_frame(ws: &mut RelaySocket) -> Message {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for the client")
            .expect("client disconnected")
            .unwrap();
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_json(ws: &mut RelaySocket) -> Value {
    match next_frame(ws).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn next_binary(ws: &mut RelaySocket) -> Vec<u8> {
    match next_frame(ws).await {
        Message::Binary(payload) => payload,
        other => panic!("expected binary frame, got {:?}", other),
    }
}

/// Run the relay side of the handshake, handing out the given markers
async fn handshake(ws: &mut RelaySocket, suspend: &str, eof: &str) {
    send_json(ws, json!({"type": "hello"})).await;
    assert_eq!(next_json(ws).await["type"], "login");
    send_json(ws, json!({"type": "login", "status": "ok", "primary": true})).await;
    assert_eq!(next_json(ws).await["type"], "start");
    send_json(ws, json!({"type": "start", "suspend": suspend, "eof": eof})).await;
}

/// Local server answering each connection with `resp:` + the request,
/// reporting every request it receives
async fn local_server() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let _ = tx.send(buf[..n].to_vec());
            let mut reply = b"resp:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            socket.write_all(&reply).await.unwrap();
        }
    });
    (port, rx)
}

fn config(relay: &Relay, local_port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::new(relay.url.clone(), "example.com", "s3cret", local_port);
    config.device = "laptop".into();
    config.ping_interval = Duration::from_secs(30);
    config.reconnect_interval = Duration::from_millis(200);
    config
}

#[tokio::test]
async fn test_handshake_sequence() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;

    send_json(&mut ws, json!({"type": "hello"})).await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "login", "domain": "example.com", "secret": "s3cret", "device": "laptop"})
    );

    send_json(&mut ws, json!({"type": "login", "status": "ok", "primary": true})).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "start", "usage": "public"}));

    send_json(&mut ws, json!({"type": "start", "suspend": "S", "eof": "E"})).await;
    assert!(timeout(WAIT, client.wait_for(LinkState::Active)).await.unwrap());

    send_binary(&mut ws, b"GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(next_binary(&mut ws).await, b"resp:GET / HTTP/1.1\r\n\r\nE".to_vec());
}

#[tokio::test]
async fn test_bad_control_text_is_not_fatal() {
    let relay = Relay::bind().await;
    let (port, mut requests) = local_server().await;
    let _client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    handshake(&mut ws, "S", "E").await;

    send_json(&mut ws, json!({"type": "error", "message": "quota exceeded"})).await;
    send_json(&mut ws, json!({"type": "start", "suspend": "only"})).await;
    ws.send(Message::Text("echo: hi there".into())).await.unwrap();
    ws.send(Message::Text("not json at all".into())).await.unwrap();
    send_binary(&mut ws, b"").await;
    send_binary(&mut ws, b"req").await;

    assert_eq!(next_binary(&mut ws).await, b"resp:reqE".to_vec());
    assert_eq!(requests.recv().await.unwrap(), b"req".to_vec());
}

#[tokio::test]
async fn test_responses_follow_request_order() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let _client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    handshake(&mut ws, "S", "<EOF>").await;

    for i in 1..=5 {
        send_binary(&mut ws, format!("R{}", i).as_bytes()).await;
    }
    for i in 1..=5 {
        assert_eq!(
            next_binary(&mut ws).await,
            format!("resp:R{}<EOF>", i).into_bytes()
        );
    }
}

#[tokio::test]
async fn test_suspend_marker_is_not_a_request() {
    let relay = Relay::bind().await;
    let (port, mut requests) = local_server().await;
    let client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    handshake(&mut ws, "SUSPEND", "E").await;

    send_binary(&mut ws, b"SUSPEND").await;
    assert!(timeout(WAIT, client.wait_for(LinkState::Suspended)).await.unwrap());

    send_binary(&mut ws, b"req").await;
    assert_eq!(next_binary(&mut ws).await, b"resp:reqE".to_vec());
    assert_eq!(requests.recv().await.unwrap(), b"req".to_vec());
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn test_local_failure_does_not_stall_queue() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // first exchange: reset the connection mid-response
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await.unwrap();
        socket.write_all(b"partial").await.unwrap();
        socket2::SockRef::from(&socket).set_linger(Some(Duration::ZERO)).unwrap();
        drop(socket);

        let (mut socket, _) = listener.accept().await.unwrap();
        let n = socket.read(&mut buf).await.unwrap();
        let mut reply = b"resp:".to_vec();
        reply.extend_from_slice(&buf[..n]);
        socket.write_all(&reply).await.unwrap();
    });

    let relay = Relay::bind().await;
    let _client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    handshake(&mut ws, "S", "E").await;

    send_binary(&mut ws, b"R1").await;
    send_binary(&mut ws, b"R2").await;

    assert_eq!(next_binary(&mut ws).await, b"resp:R2E".to_vec());
}

#[tokio::test]
async fn test_missed_heartbeat_reconnects() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let mut config = config(&relay, port);
    config.ping_interval = Duration::from_millis(100);
    let _client = TunnelClient::start(config);

    let mut first = relay.accept().await;
    handshake(&mut first, "S1", "E1").await;
    // stop reading: pings from the client go unanswered

    let mut second = relay.accept().await;
    handshake(&mut second, "S2", "E2").await;
    send_binary(&mut second, b"req").await;
    assert_eq!(next_binary(&mut second).await, b"resp:reqE2".to_vec());
    drop(first);
}

#[tokio::test]
async fn test_answered_heartbeat_keeps_connection() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let mut config = config(&relay, port);
    config.ping_interval = Duration::from_millis(50);
    let client = TunnelClient::start(config);

    let mut ws = relay.accept().await;
    handshake(&mut ws, "S", "E").await;
    assert!(timeout(WAIT, client.wait_for(LinkState::Active)).await.unwrap());

    // keep reading so tungstenite answers every ping with a pong
    let (pings_tx, mut pings_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Ping(_) = msg {
                let _ = pings_tx.send(());
            }
        }
    });

    // many intervals without a reconnect attempt
    assert!(timeout(Duration::from_millis(700), relay.listener.accept()).await.is_err());
    assert_eq!(client.state(), LinkState::Active);
    assert!(!reader.is_finished());

    let mut pings = 0;
    while pings_rx.try_recv().is_ok() {
        pings += 1;
    }
    assert!(pings >= 5, "only {} pings", pings);
}

#[tokio::test]
async fn test_zero_ping_interval_disables_heartbeat() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let mut config = config(&relay, port);
    config.ping_interval = Duration::ZERO;
    let client = TunnelClient::start(config);

    let mut first = relay.accept().await;
    handshake(&mut first, "S", "E").await;
    assert!(timeout(WAIT, client.wait_for(LinkState::Active)).await.unwrap());

    send_binary(&mut first, b"req").await;
    assert_eq!(next_binary(&mut first).await, b"resp:reqE".to_vec());

    // the link is still running and recovers through the normal path
    first.close(None).await.unwrap();
    let mut second = relay.accept().await;
    handshake(&mut second, "S2", "E2").await;
    send_binary(&mut second, b"again").await;
    assert_eq!(next_binary(&mut second).await, b"resp:againE2".to_vec());
}

#[tokio::test]
async fn test_relay_drop_reconnects() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let client = TunnelClient::start(config(&relay, port));

    let mut first = relay.accept().await;
    handshake(&mut first, "S", "E").await;
    first.close(None).await.unwrap();

    let mut second = relay.accept().await;
    send_json(&mut second, json!({"type": "hello"})).await;
    assert_eq!(next_json(&mut second).await["type"], "login");
    assert!(client.state().is_connected());
}

#[tokio::test]
async fn test_close_is_permanent_and_idempotent() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    handshake(&mut ws, "S", "E").await;

    client.close();
    client.close();
    assert!(matches!(next_frame(&mut ws).await, Message::Close(_)));
    // exactly one close frame, then the stream ends
    loop {
        match timeout(WAIT, ws.next()).await.expect("stream did not end") {
            Some(Ok(Message::Close(_))) => panic!("duplicate close frame"),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }

    timeout(WAIT, client.closed()).await.unwrap();
    client.close();
    assert_eq!(client.state(), LinkState::Disconnected);

    // well past the reconnect interval
    assert!(timeout(Duration::from_millis(800), relay.listener.accept()).await.is_err());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    handshake(&mut ws, "SUSPEND", "E").await;

    // round trip so the markers are known to the client
    send_binary(&mut ws, b"req").await;
    assert_eq!(next_binary(&mut ws).await, b"resp:reqE".to_vec());

    client.pause();
    assert_eq!(next_binary(&mut ws).await, b"SUSPEND".to_vec());

    client.resume();
    assert_eq!(next_json(&mut ws).await, json!({"type": "start", "usage": "public"}));
}

#[tokio::test]
async fn test_resume_before_handshake_sends_nothing() {
    let relay = Relay::bind().await;
    let (port, _requests) = local_server().await;
    let client = TunnelClient::start(config(&relay, port));
    let mut ws = relay.accept().await;
    assert!(timeout(WAIT, client.wait_for(LinkState::AwaitingGreeting)).await.unwrap());

    client.resume();
    client.pause();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // login is still the first frame the relay sees
    send_json(&mut ws, json!({"type": "hello"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "login");
    send_json(&mut ws, json!({"type": "login", "status": "ok", "primary": true})).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "start", "usage": "public"}));
}

#[tokio::test]
async fn test_pause_without_connection_is_noop() {
    let relay = Relay::bind().await;
    let mut config = config(&relay, 1);
    config.reconnect_interval = Duration::ZERO;
    drop(relay);

    let client = TunnelClient::start(config);
    client.pause();
    client.resume();
    timeout(WAIT, client.closed()).await.unwrap();
    assert_eq!(client.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_streamed_request_chunks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut body = Vec::new();
        let mut buf = [0u8; 1024];
        while !body.ends_with(b"END") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            body.extend_from_slice(&buf[..n]);
        }
        let mut reply = b"resp:".to_vec();
        reply.extend_from_slice(&body);
        socket.write_all(&reply).await.unwrap();
    });

    let relay = Relay::bind().await;
    let mut config = config(&relay, port);
    config.stream_requests = true;
    let _client = TunnelClient::start(config);
    let mut ws = relay.accept().await;
    handshake(&mut ws, "S", "E").await;

    send_binary(&mut ws, b"part1-").await;
    send_binary(&mut ws, b"part2-END").await;

    assert_eq!(next_binary(&mut ws).await, b"resp:part1-part2-ENDE".to_vec());
}
