//! Reconnect policy tests over real TCP connections.

use std::{sync::Arc, time::Duration};

use packrpc::{
    Endpoint, EndpointConfig, Mode, NoReconnect, Reconnect, Router, Value, Watchdog,
};
use tokio::net::{TcpListener, TcpStream};

fn echo_router() -> Arc<Router> {
    let mut router = Router::new();
    router.register_call_fn("echo", |mut params| Ok(params.pop().unwrap_or(Value::Nil)));
    Arc::new(router)
}

/// Accepts connections forever, dropping the first one immediately and
/// serving echo on the rest. Returns the listen address.
async fn flaky_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let server = Endpoint::new(
                echo_router(),
                NoReconnect,
                EndpointConfig {
                    mode: Mode::Server,
                    ..Default::default()
                },
            );
            assert!(server.attach_connection(stream));
            // The spawned reader/writer tasks keep the endpoint alive after
            // this handle goes out of scope.
        }
    });
    addr
}

#[tokio::test]
async fn test_reconnect_restores_service_after_drop() {
    let addr = flaky_echo_server().await;

    let client = Endpoint::new(
        Arc::new(Router::new()),
        Reconnect::with_intervals(
            addr.clone(),
            Duration::from_secs(1),
            Duration::from_millis(50),
        ),
        EndpointConfig {
            mode: Mode::Client,
            call_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );
    let stream = TcpStream::connect(&addr).await.unwrap();
    assert!(client.attach_connection(stream));

    // The first connection dies underneath us; calls fail with Timeout until
    // the policy has re-attached, then succeed.
    let mut result = None;
    for _ in 0..20 {
        if let Ok(value) = client.call("echo", &[Value::from("hi")]).await {
            result = Some(value);
            break;
        }
    }
    assert_eq!(result, Some(Value::from("hi")));

    client.close();
}

#[tokio::test]
async fn test_watchdog_waits_for_outbound_demand() {
    let addr = flaky_echo_server().await;

    let client = Endpoint::new(
        Arc::new(Router::new()),
        Watchdog::new(addr.clone(), Duration::from_millis(50)),
        EndpointConfig {
            mode: Mode::Client,
            call_timeout: Duration::from_secs(3),
            ..Default::default()
        },
    );
    let stream = TcpStream::connect(&addr).await.unwrap();
    assert!(client.attach_connection(stream));

    // Wait for the first connection to be dropped by the server.
    for _ in 0..100 {
        if !client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!client.is_connected());

    // Idle endpoint: the watchdog must not reconnect without demand.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.is_connected());

    // Queueing a call creates demand; the watchdog dials and the call lands
    // on the restored connection before its timeout.
    let result = client.call("echo", &[Value::from("hi")]).await.unwrap();
    assert_eq!(result, Value::from("hi"));
    assert!(client.is_connected());

    client.close();
}
