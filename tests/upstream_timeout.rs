//! End-to-end scenario: an upstream that never answers trips the
//! response-header timeout, surfacing as a 502 to the client and an
//! `is_timeout` entry rather than hanging the proxy indefinitely.

mod common;

use bytes::Bytes;
use http_body_util::Full;
use std::time::Duration;
use tokio::net::TcpListener;

/// Accepts the connection and then never writes a byte back — the
/// minimal "hung upstream" shape, regardless of what HTTP it never sends.
async fn spawn_silent_origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        }
    });
    addr
}

#[tokio::test]
async fn hung_upstream_trips_the_response_header_timeout() {
    let origin_addr = spawn_silent_origin().await;

    let proxy = common::spawn_proxy(common::ProxyOptions::default()).await;
    let mut sub = common::connect_subscription(proxy.subscription_addr.unwrap()).await;
    let (event, _) = common::recv_envelope(&mut sub).await;
    assert_eq!(event, "traffic_entries");

    let req = hyper::Request::builder()
        .method("GET")
        .uri(format!("http://{origin_addr}/slow"))
        .header("Host", origin_addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();

    let started = tokio::time::Instant::now();
    let (status, _headers, _body) = common::send_plain_request(proxy.proxy_addr, req).await;
    let elapsed = started.elapsed();

    assert_eq!(status, http::StatusCode::BAD_GATEWAY);
    assert!(
        elapsed < Duration::from_secs(10),
        "should fail on the 5s response-header timeout, not wait for the full 10s hang, took {elapsed:?}"
    );
    assert!(
        elapsed >= Duration::from_secs(5),
        "should not fail before the 5s response-header timeout elapses, took {elapsed:?}"
    );

    let (event, payload) = common::recv_envelope(&mut sub).await;
    assert_eq!(event, "traffic_new_entry");
    assert_eq!(payload["flags"]["is_timeout"], true);
    assert!(payload["error"].as_str().is_some());

    proxy.core.stop();
}
