//! End-to-end tests for the websocket transport against an in-process
//! server: request/response correlation, expiry, reconnection, URL
//! swapping, and shutdown behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dexlink_ws::{Connection, ConnectionStatus, Message, MessageKind, WsCfg, WsError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream).await.expect("server handshake")
}

fn test_cfg(url: &str) -> WsCfg {
    WsCfg {
        url: url.to_string(),
        ping_wait: Duration::from_secs(10),
        ..Default::default()
    }
}

#[tokio::test]
async fn request_response_round_trip() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while let Some(Ok(frame)) = ws.next().await {
            if let WsFrame::Text(text) = frame {
                let req: serde_json::Value = serde_json::from_str(&text).expect("request json");
                let id = req["id"].as_u64().expect("request id");
                let resp = serde_json::json!({
                    "type": "response",
                    "id": id,
                    "payload": { "result": { "pong": true } },
                });
                ws.send(WsFrame::Text(resp.to_string()))
                    .await
                    .expect("send response");
            }
        }
    });

    let conn = Connection::new(test_cfg(&url)).expect("connection");
    let ctx = CancellationToken::new();
    let tasks = conn.connect(ctx).await.expect("connect");
    assert!(!conn.is_down());

    let id = conn.next_id();
    let msg = Message::request(id, "ping", &serde_json::json!({})).expect("request");
    let (tx, rx) = oneshot::channel();
    conn.request(
        &msg,
        Box::new(move |resp| {
            let _ = tx.send(resp);
        }),
    )
    .await
    .expect("send request");

    let resp = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("response in time")
        .expect("callback ran");
    assert_eq!(resp.kind, MessageKind::Response);
    assert_eq!(resp.id, id);

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
    server.abort();
}

#[tokio::test]
async fn expired_request_runs_on_expire_not_callback() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut request_id = None;
        if let Some(Ok(WsFrame::Text(text))) = ws.next().await {
            let req: serde_json::Value = serde_json::from_str(&text).expect("request json");
            request_id = req["id"].as_u64();
        }
        // Respond well past the caller's deadline.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Some(id) = request_id {
            let late = serde_json::json!({
                "type": "response",
                "id": id,
                "payload": { "result": {} },
            });
            let _ = ws.send(WsFrame::Text(late.to_string())).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
    });

    let conn = Connection::new(test_cfg(&url)).expect("connection");
    let tasks = conn.connect(CancellationToken::new()).await.expect("connect");

    let callback_ran = Arc::new(AtomicBool::new(false));
    let callback_flag = Arc::clone(&callback_ran);
    let (expire_tx, expire_rx) = oneshot::channel();

    let id = conn.next_id();
    let msg = Message::request(id, "slow_route", &serde_json::json!({})).expect("request");
    conn.request_with_timeout(
        &msg,
        Box::new(move |_| callback_flag.store(true, Ordering::SeqCst)),
        Duration::from_millis(200),
        Box::new(move || {
            let _ = expire_tx.send(());
        }),
    )
    .await
    .expect("send request");

    tokio::time::timeout(Duration::from_secs(2), expire_rx)
        .await
        .expect("expiry fired")
        .expect("expire callback ran");

    // Let the late response arrive; it has no handler left to run.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        !callback_ran.load(Ordering::SeqCst),
        "late response must not reach the expired handler"
    );
    assert!(!conn.is_down(), "a late response is not a read error");

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
    server.abort();
}

#[tokio::test]
async fn shutdown_aborts_pending_requests_and_closes_source() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let conn = Connection::new(test_cfg(&url)).expect("connection");
    let mut source = conn.message_source().expect("first take");
    let tasks = conn.connect(CancellationToken::new()).await.expect("connect");

    let aborted = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let id = conn.next_id();
        let msg = Message::request(id, "query", &serde_json::json!({})).expect("request");
        let count = Arc::clone(&aborted);
        conn.request_with_timeout(
            &msg,
            Box::new(|_| panic!("no response was ever sent")),
            Duration::from_secs(60),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("send request");
    }

    conn.stop();
    conn.stop(); // stopping twice is safe
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");

    assert_eq!(aborted.load(Ordering::SeqCst), 3);
    let closed = tokio::time::timeout(Duration::from_secs(1), source.recv())
        .await
        .expect("source resolves after shutdown");
    assert!(closed.is_none(), "message source must close");
    server.abort();
}

#[tokio::test]
async fn ping_wait_breach_reconnects_and_resyncs_once() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        // First connection goes silent past the ping wait.
        let _first = accept(&listener).await;
        // Second connection is kept alive with protocol pings.
        let mut second = accept(&listener).await;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if second.send(WsFrame::Ping(Vec::new())).await.is_err() {
                return;
            }
        }
    });

    let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sync_count = Arc::new(AtomicUsize::new(0));

    let mut cfg = test_cfg(&url);
    cfg.ping_wait = Duration::from_millis(400);
    let recorder = Arc::clone(&statuses);
    cfg.connect_event = Some(Arc::new(move |status| recorder.lock().push(status)));
    let counter = Arc::clone(&sync_count);
    cfg.reconnect_sync = Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let conn = Connection::new(cfg).expect("connection");
    let tasks = conn.connect(CancellationToken::new()).await.expect("connect");
    assert!(!conn.is_down());

    // Breach at ~400 ms, immediate reconnect onto the second socket.
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert!(!conn.is_down(), "connection should be re-established");
    assert_eq!(sync_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        *statuses.lock(),
        vec![
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connected,
        ]
    );

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
    server.abort();
}

#[tokio::test]
async fn update_url_applies_to_next_reconnect() {
    let (listener_a, url_a) = bind().await;
    let (listener_b, url_b) = bind().await;

    let server_a = tokio::spawn(async move {
        let mut ws = accept(&listener_a).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = ws.close(None).await;
        // Drain until the peer goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });
    let (dialed_tx, dialed_rx) = oneshot::channel();
    let server_b = tokio::spawn(async move {
        let mut ws = accept(&listener_b).await;
        let _ = dialed_tx.send(());
        while let Some(Ok(_)) = ws.next().await {}
    });

    let conn = Connection::new(test_cfg(&url_a)).expect("connection");
    let tasks = conn.connect(CancellationToken::new()).await.expect("connect");
    conn.update_url(&url_b);

    // Server A drops the link; the reconnect must target the new URL.
    tokio::time::timeout(Duration::from_secs(3), dialed_rx)
        .await
        .expect("reconnected in time")
        .expect("second server dialed");

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
    server_a.abort();
    server_b.abort();
}

#[tokio::test]
async fn notifications_preserve_order_and_bad_shapes_are_skipped() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let first = serde_json::json!({
            "type": "notification", "route": "book_update", "payload": {"seq": 1},
        });
        // Well-formed JSON with the wrong shape; must be skipped without
        // tearing the connection down.
        let malformed = serde_json::json!({ "type": 5, "bogus": true });
        let second = serde_json::json!({
            "type": "notification", "route": "epoch_report", "payload": {"seq": 2},
        });
        for frame in [first, malformed, second] {
            ws.send(WsFrame::Text(frame.to_string()))
                .await
                .expect("send frame");
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let conn = Connection::new(test_cfg(&url)).expect("connection");
    let mut source = conn.message_source().expect("source");
    let tasks = conn.connect(CancellationToken::new()).await.expect("connect");

    let first = tokio::time::timeout(Duration::from_secs(2), source.recv())
        .await
        .expect("first notification")
        .expect("channel open");
    assert_eq!(first.route, "book_update");

    let second = tokio::time::timeout(Duration::from_secs(2), source.recv())
        .await
        .expect("second notification")
        .expect("channel open");
    assert_eq!(second.route, "epoch_report");

    assert!(!conn.is_down(), "decode type errors are not fatal");

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
    server.abort();
}

#[tokio::test]
async fn raw_handler_receives_frames_verbatim() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ws.send(WsFrame::Text("not json at all".to_string()))
            .await
            .expect("send text");
        ws.send(WsFrame::Binary(vec![0x01, 0x02, 0x03]))
            .await
            .expect("send binary");
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut cfg = test_cfg(&url);
    cfg.raw_handler = Some(Arc::new(move |bytes: &[u8]| {
        let _ = frames_tx.send(bytes.to_vec());
    }));

    let conn = Connection::new(cfg).expect("connection");
    let tasks = conn.connect(CancellationToken::new()).await.expect("connect");

    let first = tokio::time::timeout(Duration::from_secs(2), frames_rx.recv())
        .await
        .expect("first frame")
        .expect("handler ran");
    assert_eq!(first, b"not json at all");

    let second = tokio::time::timeout(Duration::from_secs(2), frames_rx.recv())
        .await
        .expect("second frame")
        .expect("handler ran");
    assert_eq!(second, vec![0x01, 0x02, 0x03]);

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
    server.abort();
}

#[tokio::test]
async fn connect_refused_is_soft_when_auto_reconnect_enabled() {
    // Bind then drop the listener so the port refuses connections.
    let (listener, url) = bind().await;
    drop(listener);

    let conn = Connection::new(test_cfg(&url)).expect("connection");
    let ctx = CancellationToken::new();
    // The first attempt fails, but startup succeeds and the reconnect
    // loop takes over.
    let tasks = conn.connect(ctx).await.expect("soft failure");
    assert!(conn.is_down());

    conn.stop();
    tokio::time::timeout(Duration::from_secs(5), tasks.wait())
        .await
        .expect("clean shutdown");
}

#[tokio::test]
async fn connect_refused_is_hard_when_auto_reconnect_disabled() {
    let (listener, url) = bind().await;
    drop(listener);

    let mut cfg = test_cfg(&url);
    cfg.disable_auto_reconnect = true;
    let conn = Connection::new(cfg).expect("connection");
    let mut source = conn.message_source().expect("source");

    let err = conn
        .connect(CancellationToken::new())
        .await
        .expect_err("single-shot connect fails outright");
    assert!(matches!(err, WsError::HandshakeFailed(_)));

    // The inbound channel is closed so consumers observe end-of-stream.
    let closed = tokio::time::timeout(Duration::from_secs(1), source.recv())
        .await
        .expect("source resolves");
    assert!(closed.is_none());
}
