//! Property: a CA persisted to disk by one proxy instance and reloaded
//! via `custom_cert_path`/`custom_key_path` by a second instance still
//! mints leaves that validate against the very same root — the
//! export/reload round trip a `-use-ca`/`-use-key` restart depends on.

mod common;

use bytes::Bytes;
use http_body_util::Full;
use proxycraft::config::{Config, Mode};
use proxycraft::ProxyCore;

async fn start(config: Config) -> (ProxyCore, std::net::SocketAddr) {
    let core = ProxyCore::new(config).expect("core should build");
    let bound = core.bind().await.expect("proxy should bind an ephemeral port");
    let proxy_addr = bound.proxy_addr().expect("proxy_addr");
    let serving_core = core.clone();
    tokio::spawn(async move {
        serving_core.serve(bound).await;
    });
    (core, proxy_addr)
}

#[tokio::test]
async fn leaf_from_a_reloaded_ca_validates_against_the_original_root() {
    let origin_addr = common::spawn_tls_origin(|_req| async move {
        hyper::Response::builder()
            .status(200)
            .header("content-type", "text/plain")
            .body(common::text_body(Bytes::from_static(b"reloaded")))
            .unwrap()
    })
    .await;

    // First instance: mint a fresh root under its own cert dir, then tear
    // it down. `load_or_create` always persists to `<cert_dir>/proxycraft-ca.pem`
    // / `proxycraft-ca-key.pem` when no custom path is given.
    let first_dir = common::TempDir::new("ca-reload-first");
    let mut first_config = Config::default();
    first_config.listen_port = 0;
    first_config.mitm = true;
    first_config.mode = Mode::Web;
    first_config.ca.cert_dir = first_dir.path().to_path_buf();
    first_config.expand_paths();
    first_config.ensure_directories().expect("ensure first cert dir");

    let (first_core, _first_addr) = start(first_config).await;
    let root_pem = first_core.ca().root_cert_pem().to_string();
    first_core.stop();

    let cert_path = first_dir.path().join("proxycraft-ca.pem");
    let key_path = first_dir.path().join("proxycraft-ca-key.pem");
    assert!(cert_path.exists(), "root cert should have been persisted");
    assert!(key_path.exists(), "root key should have been persisted");

    // Second instance: a fresh, otherwise-empty cert dir, pointed at the
    // first instance's exported root via custom_cert_path/custom_key_path.
    let second_dir = common::TempDir::new("ca-reload-second");
    let mut second_config = Config::default();
    second_config.listen_port = 0;
    second_config.mitm = true;
    second_config.mode = Mode::Web;
    second_config.ca.cert_dir = second_dir.path().to_path_buf();
    second_config.ca.custom_cert_path = Some(cert_path);
    second_config.ca.custom_key_path = Some(key_path);
    second_config.expand_paths();
    second_config.ensure_directories().expect("ensure second cert dir");

    let (second_core, proxy_addr) = start(second_config).await;

    assert_eq!(
        second_core.ca().root_cert_pem(),
        root_pem,
        "reloaded CA should carry forward the exact same root"
    );

    let tls = common::connect_mitm_tls(proxy_addr, "localhost", origin_addr.port(), &root_pem).await;
    let req = hyper::Request::builder()
        .method("GET")
        .uri("/hello")
        .header("Host", format!("localhost:{}", origin_addr.port()))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, body) = common::send_over(tls, req).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(&body[..], b"reloaded");

    second_core.stop();
}
