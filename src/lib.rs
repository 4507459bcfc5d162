//! proxycraft — a local, interactive forward proxy that terminates and
//! inspects HTTP/1.1, HTTP/2, HTTPS (via MITM) and SSE traffic, exposing
//! captured exchanges to a live inspection UI over WebSocket.
//!
//! This module wires the pieces documented per-file (Traffic Store, Event
//! Bus, Request Pipeline, HTTPS Tunnel Handler, Live Subscription, Archival
//! Sink) into one running process.

pub mod body;
pub mod ca;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod pipeline;
pub mod relay;
pub mod sink;
pub mod sse;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod tunnel;

use ca::CertificateAuthority;
use config::{Config, Mode};
use error::ProxyResult;
use events::EventBus;
use http::Method;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pipeline::RequestPipeline;
use relay::RespBody;
use sink::{AnnotatorObserver, ArchivalSink, LoggingSink, NoopAnnotator, NullSink, SinkObserver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use store::TrafficStore;
use subscription::LiveSubscription;
use tokio::net::TcpListener;
use transport::ForwardingTransport;
use tunnel::TunnelHandler;
use tracing::{debug, info, warn};

/// Listeners bound by [`ProxyCore::bind`], ready to be handed to
/// [`ProxyCore::serve`]. Exposes the actual bound addresses, which matters
/// when `listen_port` is `0` (the OS assigns an ephemeral port).
pub struct BoundListeners {
    proxy_listener: TcpListener,
    subscription_listener: Option<TcpListener>,
}

impl BoundListeners {
    pub fn proxy_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.proxy_listener.local_addr()
    }

    pub fn subscription_addr(&self) -> Option<std::io::Result<std::net::SocketAddr>> {
        self.subscription_listener.as_ref().map(|l| l.local_addr())
    }
}

/// Every component wired together for one process run. Cheap to clone;
/// `run` drives the accept loops until `shutdown` is flipped.
#[derive(Clone)]
pub struct ProxyCore {
    config: Config,
    ca: Arc<CertificateAuthority>,
    pipeline: RequestPipeline,
    tunnel: TunnelHandler,
    subscription: Arc<LiveSubscription>,
    running: Arc<AtomicBool>,
}

impl ProxyCore {
    /// Build the full observer chain and every long-lived component from
    /// `config`. Does not bind any sockets yet — call `run` for that.
    pub fn new(config: Config) -> ProxyResult<Self> {
        let ca = Arc::new(CertificateAuthority::load_or_create(&config.ca)?);
        let transport = Arc::new(ForwardingTransport::new(config.upstream_proxy()?));
        let store = Arc::new(TrafficStore::new(config.store.capacity));

        let events = EventBus::new();
        events.register(store.clone());
        events.register(Arc::new(AnnotatorObserver::new(store.clone(), Arc::new(NoopAnnotator))));

        let sink: Arc<dyn ArchivalSink> = if config.dump || config.output_file.is_some() {
            Arc::new(LoggingSink)
        } else {
            Arc::new(NullSink)
        };
        events.register(Arc::new(SinkObserver::new(store.clone(), sink)));

        let subscription = LiveSubscription::new(store.clone());
        events.register(subscription.clone());

        let pipeline = RequestPipeline::new(events.clone(), transport.clone());
        let tunnel = TunnelHandler::new(ca.clone(), transport.clone(), events.clone(), pipeline.clone(), config.mitm);

        Ok(Self {
            config,
            ca,
            pipeline,
            tunnel,
            subscription,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The loaded root CA, e.g. for `-export-ca`.
    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Flip the shutdown flag; in-flight connections finish, accept loops
    /// stop taking new ones.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Bind the proxy listener (and, in web mode, the live subscription
    /// listener) without serving yet. Split out from `run` so callers —
    /// notably tests — can discover the actual bound address when
    /// `listen_port` is `0`.
    pub async fn bind(&self) -> ProxyResult<BoundListeners> {
        let proxy_listener = TcpListener::bind((self.config.listen_host.as_str(), self.config.listen_port)).await?;
        let proxy_addr = proxy_listener.local_addr()?;
        info!(
            host = %self.config.listen_host,
            port = proxy_addr.port(),
            mitm = self.config.mitm,
            "proxy listening"
        );

        let subscription_listener = if self.config.mode == Mode::Web {
            // Port 0 (as used by tests requesting an ephemeral proxy port)
            // stays ephemeral here too, rather than wrapping to 1 and
            // needing root to bind it.
            let sub_port = if self.config.listen_port == 0 { 0 } else { self.config.listen_port + 1 };
            let listener = TcpListener::bind((self.config.listen_host.as_str(), sub_port)).await?;
            info!(host = %self.config.listen_host, port = listener.local_addr()?.port(), "live subscription listening");
            Some(listener)
        } else {
            None
        };

        Ok(BoundListeners {
            proxy_listener,
            subscription_listener,
        })
    }

    /// Serve already-bound listeners until `stop` is called.
    pub async fn serve(&self, bound: BoundListeners) {
        if let Some(secs) = self.config.auto_save_secs {
            self.spawn_auto_save_timer(secs);
        }

        let proxy_loop = self.accept_proxy_connections(bound.proxy_listener);
        match bound.subscription_listener {
            Some(listener) => {
                let subscription_loop = self.accept_subscription_connections(listener);
                tokio::join!(proxy_loop, subscription_loop);
            }
            None => proxy_loop.await,
        }
    }

    /// Bind and serve the proxy listener (and, in web mode, the live
    /// subscription listener) until `stop` is called.
    pub async fn run(&self) -> ProxyResult<()> {
        let bound = self.bind().await?;
        self.serve(bound).await;
        Ok(())
    }

    async fn accept_proxy_connections(&self, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to accept proxy connection: {e}");
                    continue;
                }
            };

            let pipeline = self.pipeline.clone();
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let pipeline = pipeline.clone();
                    let tunnel = tunnel.clone();
                    async move { Ok::<_, std::convert::Infallible>(dispatch(&pipeline, &tunnel, req).await) }
                });
                let result = hyper::server::conn::http1::Builder::new()
                    .preserve_header_case(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
                if let Err(e) = result {
                    debug!(%peer, "connection closed: {e}");
                }
            });
        }
    }

    async fn accept_subscription_connections(&self, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to accept subscription connection: {e}");
                    continue;
                }
            };

            let subscription = self.subscription.clone();
            tokio::spawn(async move {
                subscription.serve_connection(stream).await;
                debug!(%peer, "subscriber connection closed");
            });
        }
    }

    fn spawn_auto_save_timer(&self, secs: u64) {
        let period = std::time::Duration::from_secs(secs.max(1));
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                debug!("auto-save tick");
            }
        });
    }
}

/// Route one accepted request: `CONNECT` goes to the HTTPS Tunnel Handler,
/// everything else goes straight through the Request Pipeline as plain HTTP.
async fn dispatch(pipeline: &RequestPipeline, tunnel: &TunnelHandler, req: http::Request<Incoming>) -> http::Response<RespBody> {
    if req.method() == Method::CONNECT {
        tunnel.handle_connect(req).await
    } else {
        pipeline.handle(req, false).await
    }
}
