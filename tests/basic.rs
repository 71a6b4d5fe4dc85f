//! Basic endpoint tests over in-process duplex streams.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use packrpc::{Endpoint, EndpointConfig, Mode, NoReconnect, Router, RpcError, Value};
use tokio::io::AsyncReadExt;

fn echo_router() -> Arc<Router> {
    let mut router = Router::new();
    router.register_call_fn("echo", |mut params| Ok(params.pop().unwrap_or(Value::Nil)));
    router.register_call_fn("boom", |_| Err(Value::from("boom")));
    router.register_call_fn("add", |params| {
        let sum: i64 = params.iter().filter_map(|v| v.as_i64()).sum();
        Ok(Value::from(sum))
    });
    Arc::new(router)
}

fn client_config(timeout: Duration) -> EndpointConfig {
    EndpointConfig {
        mode: Mode::Client,
        call_timeout: timeout,
        ..Default::default()
    }
}

/// A connected client/server endpoint pair over a duplex stream.
fn pair(server_router: Arc<Router>, client_config: EndpointConfig) -> (Endpoint, Endpoint) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Endpoint::new(Arc::new(Router::new()), NoReconnect, client_config);
    assert!(client.attach_connection(a));
    let server = Endpoint::new(
        server_router,
        NoReconnect,
        EndpointConfig {
            mode: Mode::Server,
            ..Default::default()
        },
    );
    assert!(server.attach_connection(b));
    (client, server)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (client, _server) = pair(echo_router(), client_config(Duration::from_secs(5)));
    let result = client.call("echo", &[Value::from("hi")]).await.unwrap();
    assert_eq!(result, Value::from("hi"));
}

#[tokio::test]
async fn test_method_not_found() {
    let (client, _server) = pair(echo_router(), client_config(Duration::from_secs(5)));
    let err = client.call("nope", &[Value::from(1)]).await.unwrap_err();
    match err {
        RpcError::Remote(payload) => {
            let text = payload.as_str().unwrap();
            assert!(text.contains("method not found"), "payload: {}", text);
            assert!(text.contains("nope"), "payload: {}", text);
        }
        other => panic!("expected Remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handler_error_becomes_remote_error() {
    let (client, _server) = pair(echo_router(), client_config(Duration::from_secs(5)));
    let err = client.call("boom", &[]).await.unwrap_err();
    match err {
        RpcError::Remote(payload) => assert_eq!(payload, Value::from("boom")),
        other => panic!("expected Remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_severed_connection_times_out_after_full_duration() {
    let timeout = Duration::from_millis(300);
    let (client, server) = pair(echo_router(), client_config(timeout));

    // Sever the connection before any response can arrive.
    server.close();

    let start = Instant::now();
    let err = client.call("echo", &[Value::from("hi")]).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, RpcError::Timeout { .. }), "got {:?}", err);
    assert!(elapsed >= timeout, "returned early: {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(2));
}

#[tokio::test]
async fn test_unregistered_notify_is_silent() {
    let (client, _server) = pair(echo_router(), client_config(Duration::from_secs(5)));

    client.notify("log", &[Value::from("x")]).await.unwrap();

    // The server logs and discards the notification; the connection stays
    // usable.
    let result = client.call("echo", &[Value::from("after")]).await.unwrap();
    assert_eq!(result, Value::from("after"));
}

#[tokio::test]
async fn test_concurrent_calls_correlate() {
    let (client, _server) = pair(echo_router(), client_config(Duration::from_secs(5)));
    let client = Arc::new(client);

    let mut handles = vec![];
    for i in 0..50_i64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let result = client
                .call("add", &[Value::from(i), Value::from(i)])
                .await?;
            assert_eq!(result, Value::from(i * 2));
            Ok::<_, RpcError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_backpressure_blocks_at_capacity() {
    let ep = Endpoint::new(
        Arc::new(Router::new()),
        NoReconnect,
        EndpointConfig {
            mode: Mode::Client,
            outbound_queue_capacity: 1,
            ..Default::default()
        },
    );

    // No connection yet, so nothing drains the queue. The first message
    // fills it; the second producer must block.
    ep.notify("log", &[Value::from("x")]).await.unwrap();
    assert_eq!(ep.queued_outbound(), 1);

    let blocked = {
        let ep = ep.clone();
        tokio::spawn(async move { ep.notify("log", &[Value::from("y")]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    // Attaching a drained connection unblocks the producer.
    let (a, mut peer) = tokio::io::duplex(1024);
    assert!(ep.attach_connection(a));
    let drain = tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        while peer.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    blocked.await.unwrap().unwrap();
    drain.abort();
}

#[tokio::test]
async fn test_both_mode_is_full_duplex() {
    let hits = Arc::new(AtomicUsize::new(0));

    let mut router_a = Router::new();
    router_a.register_call_fn("side", |_| Ok(Value::from("a")));
    let mut router_b = Router::new();
    router_b.register_call_fn("side", |_| Ok(Value::from("b")));
    let hits_b = hits.clone();
    router_b.register_notify_fn("ping", move |_| {
        hits_b.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let (sa, sb) = tokio::io::duplex(64 * 1024);
    let a = Endpoint::new(Arc::new(router_a), NoReconnect, EndpointConfig::default());
    assert!(a.attach_connection(sa));
    let b = Endpoint::new(Arc::new(router_b), NoReconnect, EndpointConfig::default());
    assert!(b.attach_connection(sb));

    // Each endpoint calls the other over the same connection.
    assert_eq!(b.call("side", &[]).await.unwrap(), Value::from("a"));
    assert_eq!(a.call("side", &[]).await.unwrap(), Value::from("b"));

    a.notify("ping", &[]).await.unwrap();
    // A round trip through b's call router guarantees the earlier
    // notification has been dispatched.
    a.call("side", &[]).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
