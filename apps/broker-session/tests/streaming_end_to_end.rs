//! Price streaming against a local WebSocket server and a mock REST gateway.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use broker_session::infrastructure::streaming::encode_frame;
use broker_session::infrastructure::streaming::frame::{FORMAT_JSON, HEARTBEAT_REF};
use broker_session::{
    CircuitBreakerConfig, Instrument, PriceCache, PriceCallback, RateLimitPolicy, RequestExecutor,
    RestSettings, StaticTokenProvider, StreamSettings, StreamState, StreamingClient,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UIC: u64 = 36590;
const REF_ID: &str = "p36590_Stock";

/// What the server saw during the handshake.
struct Handshake {
    authorization: Option<String>,
    query: Option<String>,
}

/// Accept one connection, send `frames` as binary messages, then keep the
/// socket open until the client closes it.
async fn spawn_ws_server(frames: Vec<Vec<u8>>) -> (SocketAddr, oneshot::Receiver<Handshake>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let inspect = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = seen_tx.send(Handshake {
                authorization: request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                query: request.uri().query().map(str::to_string),
            });
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, inspect)
            .await
            .unwrap();

        for frame in frames {
            ws.send(Message::Binary(frame.into())).await.unwrap();
        }
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    (addr, seen_rx)
}

fn quote_frame(msg_id: u64, bid: &str) -> Vec<u8> {
    let payload = format!(r#"{{"Quote":{{"Bid":{bid}}}}}"#);
    encode_frame(msg_id, REF_ID, FORMAT_JSON, payload.as_bytes())
}

fn heartbeat_frame(msg_id: u64) -> Vec<u8> {
    let payload = json!([{"ReferenceId": "_heartbeat", "Heartbeats": []}]).to_string();
    encode_frame(msg_id, HEARTBEAT_REF, FORMAT_JSON, payload.as_bytes())
}

async fn mount_gateway(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/trade/v1/prices/subscriptions"))
        .and(header("authorization", "Bearer stream-token"))
        .and(body_partial_json(json!({
            "ReferenceId": REF_ID,
            "Arguments": {"AccountKey": "acct", "Uic": UIC, "AssetType": "Stock"},
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ReferenceId": REF_ID,
            "State": "Active",
            "Snapshot": {"Quote": {"Bid": 99.9, "Ask": 100.3}},
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/trade/v1/prices/subscriptions/ctx[0-9a-f]+$"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(server)
        .await;
}

fn client(rest: &MockServer, ws: SocketAddr, cache: Arc<PriceCache>) -> StreamingClient {
    let auth = Arc::new(StaticTokenProvider::new("stream-token"));
    let executor = Arc::new(
        RequestExecutor::new(
            &RestSettings::default().with_base_url(rest.uri()),
            CircuitBreakerConfig::default(),
            RateLimitPolicy::default(),
            auth.clone(),
            Arc::clone(&cache),
        )
        .unwrap(),
    );
    StreamingClient::new(
        StreamSettings::default()
            .with_url(format!("ws://{ws}/connect"))
            .with_field_groups(["Quote"]),
        "acct",
        auth,
        executor,
        cache,
    )
}

/// Callback recording every bid it sees.
fn recording_callback() -> (PriceCallback, Arc<Mutex<Vec<Option<Decimal>>>>) {
    let bids = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bids);
    let callback: PriceCallback = Arc::new(move |uic, snapshot| {
        assert_eq!(uic, UIC);
        sink.lock().push(snapshot.bid());
    });
    (callback, bids)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn streamed_updates_reach_cache_and_callback() {
    let rest = MockServer::start().await;
    mount_gateway(&rest).await;

    let (addr, handshake) = spawn_ws_server(vec![
        heartbeat_frame(1),
        quote_frame(2, "100.0"),
        vec![0xde, 0xad, 0xbe, 0xef],
        quote_frame(3, "100.1"),
    ])
    .await;

    let cache = Arc::new(PriceCache::new());
    let stream = client(&rest, addr, Arc::clone(&cache));
    let (callback, bids) = recording_callback();

    stream
        .start(&[Instrument::new(UIC, "Stock")], callback)
        .await
        .unwrap();

    let seen = handshake.await.unwrap();
    assert_eq!(seen.authorization.as_deref(), Some("Bearer stream-token"));
    assert!(seen.query.unwrap().starts_with("contextId=ctx"));

    wait_until(|| bids.lock().len() == 3).await;
    assert_eq!(
        *bids.lock(),
        vec![Some(dec!(99.9)), Some(dec!(100.0)), Some(dec!(100.1))]
    );

    // Deltas merge onto the snapshot: the ask from the snapshot survives.
    let cached = cache.get(UIC, Duration::from_secs(60)).unwrap();
    assert_eq!(cached.bid(), Some(dec!(100.1)));
    assert_eq!(cached.ask(), Some(dec!(100.3)));

    let health = stream.health();
    assert_eq!(health.state, StreamState::Connected);
    assert_eq!(health.subscriptions, 1);
    assert_eq!(health.heartbeats, 1);
    assert_eq!(health.frames_dropped, 1);
    assert!(stream.is_healthy());

    stream.stop().await;

    assert!(cache.is_empty());
    assert!(!stream.is_healthy());
    assert_eq!(stream.state(), StreamState::Disconnected);
    assert_eq!(stream.health().subscriptions, 0);
}

#[tokio::test]
async fn server_disconnect_request_marks_stream_unhealthy() {
    let rest = MockServer::start().await;
    mount_gateway(&rest).await;

    let disconnect = encode_frame(
        1,
        "_disconnect",
        FORMAT_JSON,
        br#"[{"ReferenceId":"_disconnect"}]"#,
    );
    let (addr, _handshake) = spawn_ws_server(vec![disconnect]).await;

    let cache = Arc::new(PriceCache::new());
    let stream = client(&rest, addr, Arc::clone(&cache));
    let (callback, _bids) = recording_callback();
    stream
        .start(&[Instrument::new(UIC, "Stock")], callback)
        .await
        .unwrap();

    wait_until(|| stream.health().restart_requested).await;
    assert!(!stream.is_healthy());
    // Control frames never touch the cache; only the snapshot is there.
    assert_eq!(
        cache.get(UIC, Duration::from_secs(60)).unwrap().bid(),
        Some(dec!(99.9))
    );

    stream.stop().await;
}

#[tokio::test]
async fn failed_subscriptions_abort_start() {
    let rest = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ErrorCode": "InvalidInstrument",
            "Message": "Unknown Uic",
        })))
        .expect(1)
        .mount(&rest)
        .await;

    let (addr, _handshake) = spawn_ws_server(Vec::new()).await;
    let cache = Arc::new(PriceCache::new());
    let stream = client(&rest, addr, Arc::clone(&cache));
    let (callback, bids) = recording_callback();

    let err = stream
        .start(&[Instrument::new(1, "Stock")], callback)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        broker_session::StreamError::Subscription(broker_session::ApiError::Status {
            status: 400,
            ..
        })
    ));
    assert!(bids.lock().is_empty());
    assert_eq!(stream.state(), StreamState::Disconnected);
    assert!(!stream.health().is_streaming);
}

#[tokio::test]
async fn restart_counts_as_a_new_session() {
    let rest = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/trade/v1/prices/subscriptions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ReferenceId": REF_ID})))
        .expect(2)
        .mount(&rest)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(202))
        .expect(2)
        .mount(&rest)
        .await;

    // Two connections: one per start.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            });
        }
    });

    let cache = Arc::new(PriceCache::new());
    let stream = client(&rest, addr, Arc::clone(&cache));
    let (callback, _bids) = recording_callback();
    stream
        .start(&[Instrument::new(UIC, "Stock")], callback)
        .await
        .unwrap();

    stream.restart().await.unwrap();
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert!(stream.is_healthy());

    stream.stop().await;
}
