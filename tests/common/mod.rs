//! Shared scaffolding for the end-to-end tests: a throwaway origin HTTP
//! server, a proxy instance bound to an ephemeral port, and small client
//! helpers that speak the forward-proxy and CONNECT-tunnel wire protocols
//! directly (this crate has no HTTP client dependency of its own, so the
//! tests drive `hyper::client::conn` the same way `transport.rs` does).

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use proxycraft::config::{Config, Mode};
use proxycraft::ProxyCore;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub type OriginBody = BoxBody<Bytes, Infallible>;

pub fn text_body(s: impl Into<Bytes>) -> OriginBody {
    BoxBody::new(Full::new(s.into()).map_err(|never: Infallible| match never {}))
}

/// A directory removed on drop, standing in for a real `-cert-dir`.
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(label: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "proxycraft-{label}-{}-{}",
            std::process::id(),
            unique_suffix()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        Self(dir)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn unique_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Spawn a bare-bones HTTP/1.1 origin server on an ephemeral port, serving
/// every accepted connection with `handler`. Returns the bound address;
/// the server task runs for the lifetime of the test process.
pub async fn spawn_origin<H, Fut>(handler: H) -> SocketAddr
where
    H: Fn(hyper::Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = hyper::Response<OriginBody>> + Send,
{
    let listener = TcpListener::bind(("0.0.0.0", 0)).await.expect("bind origin listener");
    let addr = listener.local_addr().expect("origin local_addr");
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Spawn a bare-bones HTTPS origin server on an ephemeral port, using a
/// throwaway self-signed leaf for `localhost`. Upstream TLS verification
/// is disabled in `transport.rs` by design, so a self-signed cert here is
/// exactly what a real MITM-through-the-proxy exchange would see.
pub async fn spawn_tls_origin<H, Fut>(handler: H) -> SocketAddr
where
    H: Fn(hyper::Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = hyper::Response<OriginBody>> + Send,
{
    let listener = TcpListener::bind(("0.0.0.0", 0)).await.expect("bind TLS origin listener");
    let addr = listener.local_addr().expect("TLS origin local_addr");

    let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("origin key");
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).expect("origin cert params");
    let cert = params.self_signed(&key).expect("self-signed origin cert");
    let cert_der = rustls_pki_types::CertificateDer::from(cert.der().to_vec());
    let key_der = rustls_pki_types::PrivatePkcs8KeyDer::from(key.serialize_der());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are always valid")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], rustls_pki_types::PrivateKeyDer::Pkcs8(key_der))
        .expect("origin TLS server config");
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let handler = handler.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = hyper::service::service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

/// A running proxy core plus the bits a test needs to reach it. Keeping
/// `_cert_dir` alive for the struct's lifetime keeps the CA directory from
/// being cleaned up out from under a still-running core.
pub struct RunningProxy {
    pub core: ProxyCore,
    pub proxy_addr: SocketAddr,
    pub subscription_addr: Option<SocketAddr>,
    _cert_dir: TempDir,
}

pub struct ProxyOptions {
    pub mitm: bool,
    pub mode: Mode,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        // Web mode by default so tests can observe captured entries
        // through the same Live Subscription surface a real inspection
        // client uses, rather than reaching into private store internals.
        Self {
            mitm: false,
            mode: Mode::Web,
        }
    }
}

/// Build, bind and start serving a `ProxyCore` on an ephemeral port.
pub async fn spawn_proxy(opts: ProxyOptions) -> RunningProxy {
    let cert_dir = TempDir::new("ca");
    let mut config = Config::default();
    config.listen_port = 0;
    config.mitm = opts.mitm;
    config.mode = opts.mode;
    config.ca.cert_dir = cert_dir.path().to_path_buf();
    config.expand_paths();
    config.ensure_directories().expect("ensure cert dir");

    let core = ProxyCore::new(config).expect("core should build from a fresh CA directory");
    let bound = core.bind().await.expect("proxy should bind an ephemeral port");
    let proxy_addr = bound.proxy_addr().expect("proxy_addr");
    let subscription_addr = bound.subscription_addr().map(|r| r.expect("subscription_addr"));

    let serving_core = core.clone();
    tokio::spawn(async move {
        serving_core.serve(bound).await;
    });

    RunningProxy {
        core,
        proxy_addr,
        subscription_addr,
        _cert_dir: cert_dir,
    }
}

/// Send one plain-HTTP (absolute-form) request through the proxy's plain
/// listener and collect the full response body.
pub async fn send_plain_request(
    proxy_addr: SocketAddr,
    req: hyper::Request<Full<Bytes>>,
) -> (http::StatusCode, http::HeaderMap, Bytes) {
    let stream = TcpStream::connect(proxy_addr).await.expect("connect to proxy");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("client handshake with proxy");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender.send_request(req).await.expect("proxy should answer");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect response body")
        .to_bytes();
    (status, headers, body)
}

/// Issue a raw `CONNECT host:port` over a fresh connection to the proxy
/// and return the still-open socket once the tunnel is established (the
/// "200 Connection Established" line has been consumed).
pub async fn connect_tunnel(proxy_addr: SocketAddr, target_host: &str, target_port: u16) -> TcpStream {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(proxy_addr).await.expect("connect to proxy");
    let connect_line =
        format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n");
    stream
        .write_all(connect_line.as_bytes())
        .await
        .expect("write CONNECT line");

    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.expect("read CONNECT response");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let status_line = String::from_utf8_lossy(&buf);
    assert!(
        status_line.starts_with("HTTP/1.1 200"),
        "expected the tunnel to be established, got: {status_line}"
    );
    stream
}

/// Complete a CONNECT tunnel, then perform a TLS client handshake with the
/// proxy's freshly minted leaf certificate, verifying it against `root_pem`
/// exactly as a real browser trusting the installed root CA would.
pub async fn connect_mitm_tls(
    proxy_addr: SocketAddr,
    target_host: &str,
    target_port: u16,
    root_pem: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let stream = connect_tunnel(proxy_addr, target_host, target_port).await;

    let mut root_store = rustls::RootCertStore::empty();
    let mut pem_reader = std::io::BufReader::new(root_pem.as_bytes());
    for cert in rustls_pemfile::certs(&mut pem_reader) {
        root_store.add(cert.expect("valid root cert PEM")).expect("add root to store");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let client_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are always valid")
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls_pki_types::ServerName::try_from(target_host.to_string())
        .expect("target host is a valid SNI name");
    connector
        .connect(server_name, stream)
        .await
        .expect("client TLS handshake against the minted leaf should succeed")
}

/// Send one request over an already-established HTTP/1.1 connection
/// (plain or TLS) and collect the response.
pub async fn send_over<IO>(io: IO, req: hyper::Request<Full<Bytes>>) -> (http::StatusCode, Bytes)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .expect("client handshake over established connection");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let response = sender.send_request(req).await.expect("request should be answered");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect response body")
        .to_bytes();
    (status, body)
}

pub type SubscriptionStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Connect to the Live Subscription WebSocket endpoint, consuming nothing
/// yet — the server's first message is always the `traffic_entries`
/// snapshot.
pub async fn connect_subscription(addr: SocketAddr) -> SubscriptionStream {
    let url = format!("ws://{addr}/");
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("subscriber should connect to the live subscription endpoint");
    ws
}

/// Read the next named JSON envelope off a subscription stream, skipping
/// non-text frames (pings etc).
pub async fn recv_envelope(ws: &mut SubscriptionStream) -> (String, serde_json::Value) {
    use futures::StreamExt;
    loop {
        let msg = ws
            .next()
            .await
            .expect("subscription stream ended unexpectedly")
            .expect("subscription read error");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text).expect("envelope should be JSON");
            let event = value["event"].as_str().expect("envelope should carry an event name").to_string();
            return (event, value["payload"].clone());
        }
    }
}

/// Drain `traffic_new_entry` deltas off a subscription stream until one
/// satisfies `predicate`, storing every payload seen into `last` along the
/// way. Returns `false` if the stream goes quiet for longer than 5s.
pub async fn wait_until_subscription<F: Fn(&serde_json::Value) -> bool>(
    ws: &mut SubscriptionStream,
    predicate: F,
    last: &mut serde_json::Value,
) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let next = tokio::time::timeout(remaining, recv_envelope(ws)).await;
        let Ok((event, payload)) = next else {
            return false;
        };
        if event != "traffic_new_entry" {
            continue;
        }
        *last = payload;
        if predicate(last) {
            return true;
        }
    }
}

/// Poll a predicate against repeated calls to `f` until it holds or the
/// deadline passes.
pub async fn wait_until<F: Fn() -> bool>(f: F, timeout: std::time::Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
