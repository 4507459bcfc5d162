//! Forwarding Transport — dials the real upstream for a decrypted/plain
//! exchange and relays the request, optionally via an upstream proxy.
//!
//! One connection is made per exchange; nothing is pooled. Upstream TLS
//! verification is disabled (the proxy's job is inspection, not
//! validating the far end's identity) and upstream compression is
//! disabled so the Body Codec is the single place decoding happens.

use crate::config::UpstreamProxy;
use crate::error::{ProxyError, ProxyResult};
use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP dial, direct or through an upstream proxy.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// TLS handshake once the TCP connection is up.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for the upstream to start sending response headers.
/// Applies to every exchange, SSE-predicted or not — an SSE source that
/// never answers is still a hung source.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts any certificate chain. Upstream verification is intentionally
/// out of scope — this proxy is already a trusted vantage point for
/// everything it forwards.
#[derive(Debug)]
struct NoCertificateVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_client_config() -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut cfg = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are always valid")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
        .with_no_client_auth();
    cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    cfg
}

/// Outcome of dialing an upstream: a live duplex stream plus which ALPN
/// protocol (if any) was negotiated.
enum Dial {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>, bool),
}

/// Per-exchange forwarding client. Cheap to construct; holds only the
/// optional upstream proxy configuration.
pub struct ForwardingTransport {
    upstream_proxy: Option<UpstreamProxy>,
}

impl ForwardingTransport {
    pub fn new(upstream_proxy: Option<UpstreamProxy>) -> Self {
        Self { upstream_proxy }
    }

    /// Forward `request` to `host:port` (TLS if `use_tls`), returning the
    /// upstream's response. Waiting for response headers is always capped
    /// at `RESPONSE_HEADER_TIMEOUT`; `request_timeout`, when given, is an
    /// additional outer bound on the whole dial-plus-dispatch (used by
    /// non-SSE exchanges for the overall wall-clock budget — predicted-SSE
    /// callers pass `None` since a stream has no natural end time).
    pub async fn send(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        request: Request<Full<Bytes>>,
        request_timeout: Option<Duration>,
    ) -> ProxyResult<Response<Incoming>> {
        let work = async {
            let dial = self.dial(host, port, use_tls).await?;
            match dial {
                Dial::Plain(tcp) => self.send_http1(tcp, request).await,
                Dial::Tls(tls, true) => self.send_http2(*tls, request).await,
                Dial::Tls(tls, false) => self.send_http1(*tls, request).await,
            }
        };

        match request_timeout {
            Some(outer) => tokio::time::timeout(outer, work).await.map_err(|_| ProxyError::Timeout {
                target: format!("{host}:{port}"),
                elapsed_ms: outer.as_millis() as u64,
            })?,
            None => work.await,
        }
    }

    /// Dial a raw TCP connection to `host:port`, honoring the configured
    /// upstream proxy. Used by the HTTPS Tunnel Handler for byte splicing
    /// when MITM is disabled.
    pub async fn dial_raw(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        match &self.upstream_proxy {
            Some(proxy) => self.dial_via_proxy(proxy, host, port).await,
            None => self.dial_direct(host, port).await,
        }
    }

    async fn dial(&self, host: &str, port: u16, use_tls: bool) -> ProxyResult<Dial> {
        let tcp = match &self.upstream_proxy {
            Some(proxy) => self.dial_via_proxy(proxy, host, port).await?,
            None => self.dial_direct(host, port).await?,
        };

        if !use_tls {
            return Ok(Dial::Plain(tcp));
        }

        let connector = tokio_rustls::TlsConnector::from(Arc::new(insecure_client_config()));
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            ProxyError::TLSHandshake {
                peer: host.to_string(),
                reason: format!("invalid server name: {e}"),
            }
        })?;

        let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProxyError::TLSHandshake {
                peer: host.to_string(),
                reason: "handshake timed out".into(),
            })?
            .map_err(|e| ProxyError::TLSHandshake {
                peer: host.to_string(),
                reason: e.to_string(),
            })?;

        let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
        Ok(Dial::Tls(Box::new(tls), negotiated_h2))
    }

    async fn dial_direct(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::UpstreamDial {
                target: format!("{host}:{port}"),
                reason: "connect timed out".into(),
            })?
            .map_err(|e| ProxyError::UpstreamDial {
                target: format!("{host}:{port}"),
                reason: e.to_string(),
            })
    }

    async fn dial_via_proxy(
        &self,
        proxy: &UpstreamProxy,
        host: &str,
        port: u16,
    ) -> ProxyResult<TcpStream> {
        match proxy {
            UpstreamProxy::Http(authority) | UpstreamProxy::Https(authority) => {
                self.connect_via_http_proxy(authority, host, port).await
            }
            UpstreamProxy::Socks5(authority) => {
                self.connect_via_socks5(authority, host, port).await
            }
        }
    }

    async fn connect_via_http_proxy(
        &self,
        proxy_authority: &str,
        host: &str,
        port: u16,
    ) -> ProxyResult<TcpStream> {
        let mut stream = tokio::time::timeout(
            DIAL_TIMEOUT,
            TcpStream::connect(proxy_authority),
        )
        .await
        .map_err(|_| ProxyError::UpstreamConnect {
            proxy: proxy_authority.to_string(),
            reason: "connect timed out".into(),
        })?
        .map_err(|e| ProxyError::UpstreamConnect {
            proxy: proxy_authority.to_string(),
            reason: e.to_string(),
        })?;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let connect_line = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
        );
        stream
            .write_all(connect_line.as_bytes())
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: e.to_string(),
            })?;

        let mut buf = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.map_err(|e| ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: e.to_string(),
            })?;
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
            if buf.len() > 8192 {
                return Err(ProxyError::UpstreamConnect {
                    proxy: proxy_authority.to_string(),
                    reason: "CONNECT response too large".into(),
                });
            }
        }

        let status_line = String::from_utf8_lossy(&buf);
        if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
            return Err(ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: format!("upstream proxy refused CONNECT: {}", status_line.lines().next().unwrap_or("")),
            });
        }

        Ok(stream)
    }

    async fn connect_via_socks5(
        &self,
        proxy_authority: &str,
        host: &str,
        port: u16,
    ) -> ProxyResult<TcpStream> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(proxy_authority))
            .await
            .map_err(|_| ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: "connect timed out".into(),
            })?
            .map_err(|e| ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: e.to_string(),
            })?;

        stream
            .write_all(&[0x05, 0x01, 0x00])
            .await
            .map_err(|e| socks_err(proxy_authority, e))?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.map_err(|e| socks_err(proxy_authority, e))?;
        if reply != [0x05, 0x00] {
            return Err(ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: "SOCKS5 handshake rejected (no acceptable auth method)".into(),
            });
        }

        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await.map_err(|e| socks_err(proxy_authority, e))?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(|e| socks_err(proxy_authority, e))?;
        if header[1] != 0x00 {
            return Err(ProxyError::UpstreamConnect {
                proxy: proxy_authority.to_string(),
                reason: format!("SOCKS5 CONNECT failed with code {}", header[1]),
            });
        }
        let skip = match header[3] {
            0x01 => 4,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.map_err(|e| socks_err(proxy_authority, e))?;
                len[0] as usize
            }
            0x04 => 16,
            other => {
                return Err(ProxyError::UpstreamConnect {
                    proxy: proxy_authority.to_string(),
                    reason: format!("unsupported SOCKS5 address type {other}"),
                })
            }
        };
        let mut discard = vec![0u8; skip + 2];
        stream.read_exact(&mut discard).await.map_err(|e| socks_err(proxy_authority, e))?;

        Ok(stream)
    }

    async fn send_http1<IO>(
        &self,
        io: IO,
        request: Request<Full<Bytes>>,
    ) -> ProxyResult<Response<Incoming>>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::Dispatch {
                target: request.uri().to_string(),
                reason: format!("http/1.1 handshake failed: {e}"),
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream connection closed: {e}");
            }
        });
        tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(request))
            .await
            .map_err(|_| ProxyError::Timeout {
                target: "upstream".into(),
                elapsed_ms: RESPONSE_HEADER_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| ProxyError::Dispatch {
                target: "upstream".into(),
                reason: e.to_string(),
            })
    }

    async fn send_http2<IO>(
        &self,
        io: IO,
        request: Request<Full<Bytes>>,
    ) -> ProxyResult<Response<Incoming>>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);
        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                .await
                .map_err(|e| ProxyError::Dispatch {
                    target: request.uri().to_string(),
                    reason: format!("h2 handshake failed: {e}"),
                })?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("upstream h2 connection closed: {e}");
            }
        });
        tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(request))
            .await
            .map_err(|_| ProxyError::Timeout {
                target: "upstream h2".into(),
                elapsed_ms: RESPONSE_HEADER_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| ProxyError::Dispatch {
                target: "upstream".into(),
                reason: e.to_string(),
            })
    }
}

fn socks_err(proxy: &str, e: std::io::Error) -> ProxyError {
    ProxyError::UpstreamConnect {
        proxy: proxy.to_string(),
        reason: e.to_string(),
    }
}

/// Split a request URI into `(host, port)`, defaulting the port to the
/// scheme's standard port.
pub fn target_of(uri: &Uri, is_https: bool) -> ProxyResult<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::Internal(format!("request URI has no host: {uri}")))?
        .to_string();
    let port = uri
        .port_u16()
        .unwrap_or(if is_https { 443 } else { 80 });
    Ok((host, port))
}

/// Buffer an `Incoming` body fully, for capture and downstream encoding.
pub async fn collect_body(body: Incoming) -> ProxyResult<Bytes> {
    Ok(body
        .collect()
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to read body: {e}")))?
        .to_bytes())
}
