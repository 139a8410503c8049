//! Relay Integration Tests
//!
//! Runs the full router on a local port against a scripted realtime upstream
//! and checks what each side of the relay observes.

mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use support::{
    UpstreamEvent, relay_config, spawn_mock_upstream, spawn_rejecting_upstream, spawn_relay,
    spawn_slow_upstream, wait_for_upstream_session,
};
use voice_relay_gateway::config::AuthApiSecret;
use voice_relay_gateway::core::realtime::DEFAULT_REALTIME_MODEL;

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_client(url: String) -> ClientSocket {
    let (socket, _) = connect_async(url).await.expect("relay should accept the client");
    socket
}

/// Next text frame from the relay, parsed as JSON.
async fn next_json(client: &mut ClientSocket) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for relay frame")
            .expect("relay closed the connection")
            .expect("relay connection error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("relay forwarded invalid JSON");
        }
    }
}

fn secret(id: &str, secret: &str) -> AuthApiSecret {
    AuthApiSecret {
        id: id.to_string(),
        secret: secret.to_string(),
    }
}

#[tokio::test]
async fn test_upstream_handshake_and_manual_session_init() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime?mode=manual")).await;

    match upstream.next().await {
        UpstreamEvent::Handshake {
            path_and_query,
            authorization,
            beta,
        } => {
            assert_eq!(
                path_and_query,
                format!("/v1/realtime?model={DEFAULT_REALTIME_MODEL}")
            );
            assert_eq!(authorization.as_deref(), Some("Bearer sk-test"));
            assert_eq!(beta.as_deref(), Some("realtime=v1"));
        }
        other => panic!("expected handshake, got {other:?}"),
    }

    // The session update is the first frame the upstream sees
    let UpstreamEvent::Text(init) = upstream.next().await else {
        panic!("expected session.update");
    };
    let init: Value = serde_json::from_str(&init).unwrap();
    assert_eq!(init["type"], "session.update");
    assert_eq!(init["session"]["input_audio_format"], "pcm16");
    assert_eq!(init["session"]["output_audio_format"], "pcm16");
    assert_eq!(init["session"]["sample_rate"], 24000);
    assert!(init["session"]["turn_detection"].is_null());

    let first = next_json(&mut client).await;
    assert_eq!(first["type"], "session.created");
}

#[tokio::test]
async fn test_auto_mode_enables_server_vad_without_auto_response() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let _client = connect_client(format!("ws://{addr}/realtime?mode=auto")).await;

    let init = upstream.expect_type("session.update").await;
    let UpstreamEvent::Text(init) = init else {
        unreachable!()
    };
    let init: Value = serde_json::from_str(&init).unwrap();
    assert_eq!(init["session"]["turn_detection"]["type"], "server_vad");
    assert_eq!(init["session"]["turn_detection"]["create_response"], false);
}

#[tokio::test]
async fn test_frames_forwarded_verbatim_and_in_order() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    wait_for_upstream_session(&mut upstream).await;
    assert_eq!(next_json(&mut client).await["type"], "session.created");

    let sent: Vec<String> = (0..25)
        .map(|seq| json!({"type": "test.ping", "seq": seq, "pad": " spaced  out "}).to_string())
        .collect();
    for text in &sent {
        client.send(Message::Text(text.clone().into())).await.unwrap();
    }

    // Upstream sees the exact bytes, in order
    for expected in &sent {
        match upstream.next().await {
            UpstreamEvent::Text(text) => assert_eq!(&text, expected),
            other => panic!("unexpected upstream event {other:?}"),
        }
    }

    // And the echoes come back in the same order
    for seq in 0..25 {
        let echo = next_json(&mut client).await;
        assert_eq!(echo["type"], "test.ping");
        assert_eq!(echo["seq"], seq);
    }
}

#[tokio::test]
async fn test_frames_before_upstream_open_are_dropped() {
    let mut upstream = spawn_slow_upstream(Duration::from_millis(400)).await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    let early = json!({"type": "test.early"}).to_string();
    client.send(Message::Text(early.into())).await.unwrap();

    wait_for_upstream_session(&mut upstream).await;
    for name in ["test.first", "test.second"] {
        let text = json!({"type": name}).to_string();
        client.send(Message::Text(text.into())).await.unwrap();
    }

    // The early frame is gone, the later ones arrive in order
    assert_eq!(upstream.next().await.event_type().as_deref(), Some("test.first"));
    assert_eq!(upstream.next().await.event_type().as_deref(), Some("test.second"));

    // Only the frames sent after the upstream opened were echoed
    assert_eq!(next_json(&mut client).await["type"], "session.created");
    assert_eq!(next_json(&mut client).await["type"], "test.first");
    assert_eq!(next_json(&mut client).await["type"], "test.second");

    client.close(None).await.unwrap();
    loop {
        let event = upstream.next().await;
        assert_ne!(event.event_type().as_deref(), Some("test.early"));
        if event == UpstreamEvent::Closed {
            break;
        }
    }
}

#[tokio::test]
async fn test_binary_frames_forwarded() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    wait_for_upstream_session(&mut upstream).await;

    let payload = vec![0u8, 1, 2, 254, 255];
    client
        .send(Message::Binary(payload.clone().into()))
        .await
        .unwrap();

    assert_eq!(upstream.next().await, UpstreamEvent::Binary(payload.clone()));

    let echoed = loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = msg {
            break data;
        }
    };
    assert_eq!(echoed.to_vec(), payload);
}

#[tokio::test]
async fn test_client_close_closes_upstream() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    wait_for_upstream_session(&mut upstream).await;

    client.close(None).await.unwrap();
    upstream.expect_closed().await;
}

#[tokio::test]
async fn test_client_drop_closes_upstream() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let client = connect_client(format!("ws://{addr}/realtime")).await;
    wait_for_upstream_session(&mut upstream).await;

    drop(client);
    upstream.expect_closed().await;
}

#[tokio::test]
async fn test_upstream_close_leaves_client_connected() {
    let mut upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    wait_for_upstream_session(&mut upstream).await;
    assert_eq!(next_json(&mut client).await["type"], "session.created");

    client
        .send(Message::Text(json!({"type": "test.close"}).to_string().into()))
        .await
        .unwrap();
    upstream.expect_closed().await;

    // Nothing is sent to the client and it is not disconnected
    let quiet = timeout(Duration::from_millis(300), client.next()).await;
    assert!(quiet.is_err(), "client should not hear from the relay");

    // Later frames are dropped without ending the session
    client
        .send(Message::Text(json!({"type": "test.ping"}).to_string().into()))
        .await
        .unwrap();
    client.close(None).await.unwrap();
}

#[tokio::test]
async fn test_upstream_rejection_reported_as_error_event() {
    let mut upstream = spawn_rejecting_upstream(401).await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    assert!(matches!(upstream.next().await, UpstreamEvent::Handshake { .. }));

    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "error");
    let message = event["error"].as_str().unwrap();
    assert!(message.contains("Authentication failed"), "{message}");
}

#[tokio::test]
async fn test_unreachable_upstream_reported_as_error_event() {
    // Bind and drop to get a port with nothing listening
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let addr = spawn_relay(relay_config(&format!("ws://127.0.0.1:{port}/v1/realtime"))).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "error");
    assert!(event["error"].as_str().unwrap().contains("Connection failed"));
}

#[tokio::test]
async fn test_missing_api_key_reported_without_connecting() {
    let mut upstream = spawn_mock_upstream().await;
    let mut config = relay_config(&upstream.url);
    config.openai_api_key = None;
    let addr = spawn_relay(config).await;

    let mut client = connect_client(format!("ws://{addr}/realtime")).await;
    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "error");

    let nothing = timeout(Duration::from_millis(200), upstream.events.recv()).await;
    assert!(nothing.is_err(), "upstream should never be contacted");
}

#[tokio::test]
async fn test_unknown_mode_rejected() {
    let upstream = spawn_mock_upstream().await;
    let addr = spawn_relay(relay_config(&upstream.url)).await;

    let err = connect_async(format!("ws://{addr}/realtime?mode=sometimes"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP rejection, got {other}"),
    }
}

#[tokio::test]
async fn test_auth_required_for_relay() {
    let mut upstream = spawn_mock_upstream().await;
    let mut config = relay_config(&upstream.url);
    config.auth_api_secrets = vec![secret("overlay", "relay-secret")];
    config.auth_required = true;
    let addr = spawn_relay(config).await;

    let err = connect_async(format!("ws://{addr}/realtime")).await.unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP rejection, got {other}"),
    }

    let err = connect_async(format!("ws://{addr}/realtime?token=wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, tungstenite::Error::Http(ref r) if r.status() == 401));

    // Query token for browsers, bearer header for everything else
    let _client = connect_client(format!("ws://{addr}/realtime?token=relay-secret")).await;
    wait_for_upstream_session(&mut upstream).await;

    let mut request = tungstenite::client::IntoClientRequest::into_client_request(format!(
        "ws://{addr}/realtime"
    ))
    .unwrap();
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        "Bearer relay-secret".parse().unwrap(),
    );
    let (_client, response) = connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);
}

#[tokio::test]
async fn test_per_ip_connection_limit() {
    let mut upstream = spawn_mock_upstream().await;
    let mut config = relay_config(&upstream.url);
    config.max_connections_per_ip = 1;
    let addr = spawn_relay(config).await;

    let first = connect_client(format!("ws://{addr}/realtime")).await;
    wait_for_upstream_session(&mut upstream).await;

    let err = connect_async(format!("ws://{addr}/realtime")).await.unwrap_err();
    assert!(matches!(err, tungstenite::Error::Http(ref r) if r.status() == 429));

    // Closing the first session frees the slot
    drop(first);
    upstream.expect_closed().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _second = connect_client(format!("ws://{addr}/realtime")).await;
}
