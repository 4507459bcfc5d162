//! HTTPS Tunnel Handler — CONNECT method handling. With MITM enabled the
//! client socket is hijacked, handed a freshly minted leaf certificate,
//! and its decrypted HTTP/1.1 or HTTP/2 traffic is dispatched through the
//! Request Pipeline exactly like a plain-HTTP exchange. With MITM
//! disabled the proxy opens a raw connection to the target (direct, or
//! via an upstream proxy) and splices bytes in both directions untouched.

use crate::ca::{CertificateAuthority, Leaf};
use crate::events::EventBus;
use crate::model::Event;
use crate::pipeline::RequestPipeline;
use crate::relay::RespBody;
use crate::transport::ForwardingTransport;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Orchestrates CONNECT handling for one accepted connection. Cheap to
/// clone; holds only shared, thread-safe handles.
#[derive(Clone)]
pub struct TunnelHandler {
    ca: Arc<CertificateAuthority>,
    transport: Arc<ForwardingTransport>,
    events: EventBus,
    pipeline: RequestPipeline,
    mitm_enabled: bool,
}

impl TunnelHandler {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        transport: Arc<ForwardingTransport>,
        events: EventBus,
        pipeline: RequestPipeline,
        mitm_enabled: bool,
    ) -> Self {
        Self {
            ca,
            transport,
            events,
            pipeline,
            mitm_enabled,
        }
    }

    /// Handle one CONNECT request. Returns the response to send on the
    /// still-plaintext connection; the tunnel itself (if established)
    /// continues in a spawned task once hyper completes the upgrade.
    pub async fn handle_connect(&self, req: Request<Incoming>) -> Response<RespBody> {
        let Some((host, port)) = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .and_then(|a| parse_authority(&a))
        else {
            warn!(uri = %req.uri(), "malformed CONNECT target");
            return plain_response(StatusCode::BAD_REQUEST);
        };

        if self.mitm_enabled {
            self.respond_and_run_mitm(req, host, port)
        } else {
            self.respond_and_run_raw(req, host, port).await
        }
    }

    fn respond_and_run_mitm(&self, req: Request<Incoming>, host: String, port: u16) -> Response<RespBody> {
        let this = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    this.events.emit(Event::TunnelEstablished {
                        host: host.clone(),
                        intercepted: true,
                    });
                    this.serve_mitm(TokioIo::new(upgraded), &host, port).await;
                }
                Err(e) => warn!(host, "CONNECT upgrade failed: {e}"),
            }
        });
        plain_response(StatusCode::OK)
    }

    async fn respond_and_run_raw(&self, req: Request<Incoming>, host: String, port: u16) -> Response<RespBody> {
        let upstream = match self.transport.dial_raw(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(host, port, "failed to dial CONNECT target: {e}");
                return plain_response(StatusCode::BAD_GATEWAY);
            }
        };

        let this = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    this.events.emit(Event::TunnelEstablished {
                        host: host.clone(),
                        intercepted: false,
                    });
                    this.splice(TokioIo::new(upgraded), upstream, &host).await;
                }
                Err(e) => warn!(host, "CONNECT upgrade failed: {e}"),
            }
        });
        plain_response(StatusCode::OK)
    }

    async fn splice<IO>(&self, mut client: IO, mut upstream: TcpStream, host: &str)
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_upstream, to_client)) => {
                debug!(host, to_upstream, to_client, "raw tunnel closed");
            }
            Err(e) => debug!(host, "raw tunnel closed with error: {e}"),
        }
    }

    async fn serve_mitm<IO>(&self, client: IO, host: &str, port: u16)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let leaf = match self.ca.leaf_for_host(host).await {
            Ok(leaf) => leaf,
            Err(e) => {
                warn!(host, "leaf certificate mint failed, dropping tunnel: {e}");
                return;
            }
        };

        let tls_config = match build_server_config(&leaf) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(host, "failed to build TLS server config: {e}");
                return;
            }
        };

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let tls_stream = match acceptor.accept(client).await {
            Ok(s) => s,
            Err(e) => {
                debug!(host, "MITM TLS handshake failed: {e}");
                return;
            }
        };

        let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
        let pipeline = self.pipeline.clone();
        let io = TokioIo::new(tls_stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let pipeline = pipeline.clone();
            async move { Ok::<_, Infallible>(pipeline.handle(req, true).await) }
        });

        let result = if negotiated_h2 {
            hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
        } else {
            hyper::server::conn::http1::Builder::new()
                .preserve_header_case(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
        };

        if let Err(e) = result {
            debug!(host, port, "MITM connection closed: {e}");
        }
    }
}

fn build_server_config(leaf: &Leaf) -> Result<rustls::ServerConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cert = CertificateDer::from(leaf.cert_der.clone());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are always valid")
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn plain_response(status: StatusCode) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn empty_body() -> RespBody {
    RespBody::new(Empty::<Bytes>::new().map_err(|never: Infallible| match never {}))
}

/// Parse a CONNECT authority (`host:port`) into its parts. Unlike a
/// request URI, CONNECT's target is always authority-form.
fn parse_authority(authority: &str) -> Option<(String, u16)> {
    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
