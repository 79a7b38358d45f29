//! Integration tests for the relay.
//!
//! These tests run the viewer server on an ephemeral port and connect real
//! WebSocket clients. Upstream messages are either injected directly through
//! the subscriber or served by a minimal in-process MQTT broker stub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sensorcast_common::{MqttConfig, Record};
use sensorcast_relay::config::ViewerConfig;
use sensorcast_relay::{Hub, SharedHub, UpstreamSubscriber, ViewerServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const TOPIC: &str = "sensors/test";

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    hub: SharedHub,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

/// Helper to start a viewer server on an ephemeral port.
async fn start_relay() -> Relay {
    start_relay_with(ViewerConfig::default()).await
}

async fn start_relay_with(viewer: ViewerConfig) -> Relay {
    let hub = Arc::new(Hub::new());
    let server = ViewerServer::bind(hub.clone(), "127.0.0.1:0".parse().unwrap(), viewer)
    .await
    .expect("bind viewer server");
    let addr = server.local_addr();

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(async move {
        server.run(rx).await.expect("viewer server");
    });

    Relay {
        hub,
        addr,
        shutdown,
    }
}

fn subscriber(hub: &SharedHub, capacity: usize) -> UpstreamSubscriber {
    let config = MqttConfig {
        topic: TOPIC.to_string(),
        ..MqttConfig::default()
    };
    UpstreamSubscriber::new(hub.clone(), config, capacity)
}

/// Connect a viewer and wait until the hub has registered it.
async fn connect_viewer(relay: &Relay, path: &str) -> Viewer {
    let before = relay.hub.stats().viewers_total;
    let (ws, _) = connect_async(format!("ws://{}{}", relay.addr, path))
        .await
        .expect("connect viewer");
    wait_until(|| relay.hub.stats().viewers_total > before).await;
    ws
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Receive the next history frame.
async fn next_frame(ws: &mut Viewer) -> Vec<Record> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");

        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("frame is a JSON array of records");
        }
    }
}

/// Assert that no frame arrives within a short window.
async fn assert_no_frame(ws: &mut Viewer) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "unexpected frame: {:?}", result);
}

fn payloads(records: &[Record]) -> Vec<&str> {
    records.iter().map(|r| r.payload.as_str()).collect()
}

#[tokio::test]
async fn test_viewer_before_first_message_gets_exactly_one_frame() {
    let relay = start_relay().await;
    let mut sub = subscriber(&relay.hub, 5);

    let mut ws = connect_viewer(&relay, "/").await;
    assert_no_frame(&mut ws).await;

    sub.handle_message(TOPIC, b"m1");

    let frame = next_frame(&mut ws).await;
    assert_eq!(payloads(&frame), vec!["m1"]);
    assert!(frame[0].timestamp.ends_with('Z'));
    assert_no_frame(&mut ws).await;
}

#[tokio::test]
async fn test_late_viewer_receives_bounded_history() {
    let relay = start_relay().await;
    let mut sub = subscriber(&relay.hub, 5);

    for i in 1..=7 {
        sub.handle_message(TOPIC, format!("m{}", i).as_bytes());
    }

    let mut ws = connect_viewer(&relay, "/ws").await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(payloads(&frame), vec!["m7", "m6", "m5", "m4", "m3"]);
    assert_no_frame(&mut ws).await;

    sub.handle_message(TOPIC, b"m8");
    let frame = next_frame(&mut ws).await;
    assert_eq!(payloads(&frame), vec!["m8", "m7", "m6", "m5", "m4"]);
}

#[tokio::test]
async fn test_all_viewers_receive_identical_frames() {
    let relay = start_relay().await;
    let mut sub = subscriber(&relay.hub, 5);

    let mut viewers = Vec::new();
    for _ in 0..4 {
        viewers.push(connect_viewer(&relay, "/").await);
    }

    // One viewer vanishes without a close handshake
    let gone = viewers.pop().unwrap();
    drop(gone);

    sub.handle_message(TOPIC, br#"{"temperature":21.5,"humidity":40}"#);

    let mut frames = Vec::new();
    for ws in &mut viewers {
        frames.push(next_frame(ws).await);
    }
    assert!(frames.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(frames[0][0].payload, r#"{"temperature":21.5,"humidity":40}"#);

    wait_until(|| relay.hub.session_count() == 3).await;
}

#[tokio::test]
async fn test_viewer_close_deregisters_session() {
    let relay = start_relay().await;

    let mut ws = connect_viewer(&relay, "/").await;
    assert_eq!(relay.hub.session_count(), 1);

    ws.close(None).await.expect("close");
    wait_until(|| relay.hub.session_count() == 0).await;

    // Reconnecting creates a brand-new session
    let _ws = connect_viewer(&relay, "/").await;
    assert_eq!(relay.hub.session_count(), 1);
    assert_eq!(relay.hub.stats().viewers_total, 2);
}

#[tokio::test]
async fn test_viewer_messages_are_ignored() {
    let relay = start_relay().await;
    let mut sub = subscriber(&relay.hub, 5);

    let mut ws = connect_viewer(&relay, "/").await;
    ws.send(Message::Text("hello relay".to_string()))
        .await
        .expect("send");

    sub.handle_message(TOPIC, b"m1");
    let frame = next_frame(&mut ws).await;
    assert_eq!(payloads(&frame), vec!["m1"]);
    assert_eq!(relay.hub.session_count(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_viewers() {
    let relay = start_relay().await;
    let mut ws = connect_viewer(&relay, "/").await;

    relay.shutdown.send(true).unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "viewer was not closed on shutdown");
    wait_until(|| relay.hub.session_count() == 0).await;
}

#[tokio::test]
async fn test_stalled_viewer_is_dropped_without_blocking_others() {
    const MESSAGES: usize = 100;

    let relay = start_relay_with(ViewerConfig {
        queue_capacity: 4,
        send_timeout_ms: 200,
    })
    .await;
    let mut sub = subscriber(&relay.hub, 5);

    // Never read from this one, so its socket buffers fill up
    let _stalled = connect_viewer(&relay, "/").await;
    let mut active = connect_viewer(&relay, "/").await;

    let received = Arc::new(AtomicUsize::new(0));
    let last_frame = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let reader = {
        let received = received.clone();
        let last_frame = last_frame.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = active.next().await {
                if let Message::Text(text) = message {
                    *last_frame.lock() = text.into_bytes();
                    received.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    };

    let filler = "x".repeat(100_000);
    for i in 0..MESSAGES {
        sub.handle_message(TOPIC, format!("{:04}{}", i, filler).as_bytes());
        wait_until(|| received.load(Ordering::SeqCst) > i).await;
    }

    assert_eq!(received.load(Ordering::SeqCst), MESSAGES);
    let frame: Vec<Record> = serde_json::from_slice(&last_frame.lock()).unwrap();
    assert_eq!(frame.len(), 5);
    assert!(frame[0].payload.starts_with(&format!("{:04}", MESSAGES - 1)));

    wait_until(|| relay.hub.session_count() == 1).await;
    let stats = relay.hub.stats();
    assert_eq!(stats.viewers_total, 2);
    assert_eq!(stats.viewers_connected, 1);
    assert_eq!(stats.messages_accepted, MESSAGES as u64);

    reader.abort();
}

// ---------------------------------------------------------------------------
// Minimal MQTT 3.1.1 broker stub
// ---------------------------------------------------------------------------

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        len |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = (topic.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend(body);
    packet
}

/// Serve one client connection: acknowledge CONNECT and SUBSCRIBE, publish
/// `payload` after the first subscription and optionally hang up.
async fn serve_connection(mut stream: TcpStream, payload: Vec<u8>, hang_up: bool) {
    let mut published = false;

    while let Some((header, body)) = read_packet(&mut stream).await {
        let result = match header >> 4 {
            // CONNECT -> CONNACK (accepted)
            1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await,
            // SUBSCRIBE -> SUBACK (granted QoS 0)
            8 => {
                let ack = [0x90, 0x03, body[0], body[1], 0x00];
                let mut result = stream.write_all(&ack).await;
                if result.is_ok() && !published {
                    published = true;
                    result = stream.write_all(&publish_packet(TOPIC, &payload)).await;
                    if hang_up {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        return;
                    }
                }
                result
            }
            // PINGREQ -> PINGRESP
            12 => stream.write_all(&[0xd0, 0x00]).await,
            // DISCONNECT
            14 => return,
            _ => Ok(()),
        };

        if result.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn test_subscriber_reconnects_and_keeps_viewers() {
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    {
        let connections = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = broker.accept().await {
                let n = connections.fetch_add(1, Ordering::SeqCst);
                // First session drops mid-stream, later ones stay up
                let (payload, hang_up) = if n == 0 {
                    (b"m1".to_vec(), true)
                } else {
                    (b"m2".to_vec(), false)
                };
                tokio::spawn(serve_connection(stream, payload, hang_up));
            }
        });
    }

    let hub = Arc::new(Hub::new());
    let (tx, mut frames) = mpsc::channel(16);
    let viewer = hub.register(tx);

    let config = MqttConfig {
        broker: format!("mqtt://{}", broker_addr),
        topic: TOPIC.to_string(),
        connect_timeout_ms: 1000,
        reconnect_interval_ms: 50,
        ..MqttConfig::default()
    };
    let sub = UpstreamSubscriber::new(hub.clone(), config, 5);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(sub.run(shutdown_rx));

    let recv = |frames: &mut mpsc::Receiver<Arc<str>>| {
        let frame = frames.try_recv().ok();
        frame.map(|f| serde_json::from_str::<Vec<Record>>(&f).unwrap())
    };

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while seen.len() < 2 {
            if let Some(frame) = recv(&mut frames) {
                seen.push(frame);
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    })
    .await
    .expect("frames from both broker sessions");

    assert_eq!(payloads(&seen[0]), vec!["m1"]);
    assert_eq!(payloads(&seen[1]), vec!["m2", "m1"]);
    assert!(connections.load(Ordering::SeqCst) >= 2);
    assert!(hub.is_registered(viewer));
    wait_until(|| hub.stats().upstream_subscribed).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("subscriber stops on shutdown")
        .unwrap()
        .unwrap();
    assert!(!hub.stats().upstream_subscribed);
}

#[tokio::test]
async fn test_subscriber_retries_unreachable_broker() {
    // Grab a free port, then close it so connections are refused
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let hub = Arc::new(Hub::new());
    let config = MqttConfig {
        broker: addr.to_string(),
        topic: TOPIC.to_string(),
        reconnect_interval_ms: 20,
        ..MqttConfig::default()
    };
    let sub = UpstreamSubscriber::new(hub.clone(), config, 5);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(sub.run(shutdown_rx));

    // Still retrying, not crashed
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());
    assert!(!hub.stats().upstream_subscribed);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("subscriber stops on shutdown")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_subscriber_times_out_silent_broker() {
    // Accepts connections but never answers CONNECT
    let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_addr = broker.local_addr().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    {
        let attempts = attempts.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = broker.accept().await {
                attempts.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
    }

    let hub = Arc::new(Hub::new());
    let config = MqttConfig {
        broker: format!("mqtt://{}", broker_addr),
        topic: TOPIC.to_string(),
        connect_timeout_ms: 150,
        reconnect_interval_ms: 50,
        ..MqttConfig::default()
    };
    let sub = UpstreamSubscriber::new(hub.clone(), config, 5);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(sub.run(shutdown_rx));

    // Each timed-out attempt is followed by a fresh connection
    wait_until(|| attempts.load(Ordering::SeqCst) >= 3).await;
    assert!(!task.is_finished());
    assert!(!hub.stats().upstream_subscribed);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("subscriber stops on shutdown")
        .unwrap()
        .unwrap();
}
