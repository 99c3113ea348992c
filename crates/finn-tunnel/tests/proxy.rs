//! End-to-end tunnel behaviour against a mock relay: a local WebSocket
//! server stands in for the relay, a raw TCP listener stands in for the dev
//! server, and the assertions cover request/response correlation.

use finn_core::{TunnelRequest, TunnelResponse};
use finn_tunnel::TunnelClient;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Accepts one tunnel connection, forwards `requests` frames, and reports
/// every text frame it gets back.
async fn mock_relay(
    listener: tokio::net::TcpListener,
    requests: Vec<TunnelRequest>,
    responses: mpsc::Sender<TunnelResponse>,
) {
    let (socket, _) = listener.accept().await.expect("accept tunnel");
    let mut ws = tokio_tungstenite::accept_async(socket).await.expect("ws upgrade");

    for request in &requests {
        let frame = serde_json::to_string(request).expect("encode request");
        ws.send(WsMessage::Text(frame)).await.expect("send request");
    }

    let mut remaining = requests.len();
    while remaining > 0 {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let response: TunnelResponse = serde_json::from_str(&text).expect("decode");
                responses.send(response).await.expect("report");
                remaining -= 1;
            }
            Some(Ok(_)) => {}
            _ => break,
        }
    }
}

async fn spawn_dev_server(body: &'static str) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind http");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn each_request_id_gets_exactly_one_response() {
    let dev_port = spawn_dev_server("preview body").await;

    let relay_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let relay_port = relay_listener.local_addr().expect("addr").port();

    let requests: Vec<TunnelRequest> = (0..4)
        .map(|i| TunnelRequest {
            id: format!("req-{i}"),
            method: "GET".into(),
            path: "/".into(),
            headers: Default::default(),
            body: Vec::new(),
        })
        .collect();

    let (response_tx, mut response_rx) = mpsc::channel(8);
    let relay = tokio::spawn(mock_relay(relay_listener, requests, response_tx));

    let client = TunnelClient::new(
        &format!("ws://127.0.0.1:{relay_port}"),
        "tok",
        "user",
        "device",
        "folder",
        dev_port,
    );
    client.connect().await.expect("tunnel connect");

    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        let response = tokio::time::timeout(std::time::Duration::from_secs(10), response_rx.recv())
            .await
            .expect("response in time")
            .expect("response");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"preview body");
        assert!(response.body.len() <= 10 * 1024 * 1024);
        assert!(seen.insert(response.id.clone()), "duplicate response id {}", response.id);
    }
    assert_eq!(seen.len(), 4);

    relay.await.expect("relay task");
    client.close().await;
}

#[tokio::test]
async fn unreachable_dev_server_still_answers_with_502() {
    let relay_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let relay_port = relay_listener.local_addr().expect("addr").port();

    let requests = vec![TunnelRequest {
        id: "lonely".into(),
        method: "GET".into(),
        path: "/missing".into(),
        headers: Default::default(),
        body: Vec::new(),
    }];

    let (response_tx, mut response_rx) = mpsc::channel(1);
    let relay = tokio::spawn(mock_relay(relay_listener, requests, response_tx));

    // Port 9 (discard) has no listener in the test environment.
    let client = TunnelClient::new(
        &format!("ws://127.0.0.1:{relay_port}"),
        "tok",
        "user",
        "device",
        "folder",
        9,
    );
    client.connect().await.expect("tunnel connect");

    let response = tokio::time::timeout(std::time::Duration::from_secs(10), response_rx.recv())
        .await
        .expect("response in time")
        .expect("response");
    assert_eq!(response.id, "lonely");
    assert_eq!(response.status_code, 502);
    assert!(response.error.expect("error").contains("localhost:9"));

    relay.await.expect("relay task");
    client.close().await;
}
