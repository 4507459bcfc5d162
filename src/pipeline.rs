//! Request Pipeline — per-exchange orchestration shared by the plain-HTTP
//! listener and the HTTPS Tunnel Handler's decrypted loops. Builds the
//! outbound request, dispatches it through the Forwarding Transport,
//! applies Body Codec decompression, and either streams a normal
//! response or hands off to the SSE Relay.

use crate::body;
use crate::events::EventBus;
use crate::model::{Event, EntryFlags, HeaderMultiMap, TrafficEntry};
use crate::relay::{self, RespBody};
use crate::sse;
use crate::transport::{self, ForwardingTransport};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const NORMAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Monotonically assigns traffic-entry ids, stringified for the wire and
/// for lookups, scoped to one process run.
#[derive(Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// Orchestrates one request/response exchange. Cheap to clone; holds only
/// shared, thread-safe handles.
#[derive(Clone)]
pub struct RequestPipeline {
    events: EventBus,
    ids: Arc<IdGenerator>,
    transport: Arc<ForwardingTransport>,
}

impl RequestPipeline {
    pub fn new(events: EventBus, transport: Arc<ForwardingTransport>) -> Self {
        Self {
            events,
            ids: Arc::new(IdGenerator::default()),
            transport,
        }
    }

    /// Handle one exchange end to end. Always returns a response — dial
    /// and dispatch failures become `502 Bad Gateway`, never a hard
    /// error, matching the "nothing is retried, failures are surfaced
    /// as-is" policy.
    pub async fn handle(&self, req: Request<Incoming>, is_https: bool) -> Response<RespBody> {
        let started_at = Instant::now();
        let id = self.ids.next();

        let target = match absolute_uri(&req, is_https) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(id, "malformed request target: {e}");
                return bad_gateway(e.to_string());
            }
        };
        let (host, port) = match transport::target_of(&target, is_https) {
            Ok(v) => v,
            Err(e) => return bad_gateway(e.to_string()),
        };

        let method = req.method().clone();
        let version = format!("{:?}", req.version());
        let request_headers = HeaderMultiMap::from(req.headers());
        let accept_header = req.headers().get(http::header::ACCEPT).and_then(|v| v.to_str().ok());
        let path = target.path().to_string();
        let query = target.query().map(|q| q.to_string());
        let is_predicted_sse = sse::is_predicted_sse(accept_header, &path);

        let (parts, body) = req.into_parts();
        let request_body = match transport::collect_body(body).await {
            Ok(b) => b,
            Err(e) => {
                warn!(id, "failed to read request body: {e}");
                return bad_gateway(e.to_string());
            }
        };

        let mut entry = TrafficEntry::new(
            method.to_string(),
            target.to_string(),
            if is_https { "https".into() } else { "http".into() },
            host.clone(),
            path.clone(),
        );
        entry.id = id.clone();
        entry.protocol_version = version;
        entry.request_headers = request_headers;
        entry.request_body = request_body.to_vec();
        entry.flags = EntryFlags {
            is_https,
            is_sse: is_predicted_sse,
            is_sse_completed: false,
            is_timeout: false,
        };

        self.events.emit(Event::RequestObserved {
            id: id.clone(),
            entry,
        });

        let mut outbound = Request::builder()
            .method(method)
            .uri(target.clone())
            .version(parts.version);
        for (name, value) in parts.headers.iter() {
            outbound = outbound.header(name, value);
        }
        if is_predicted_sse {
            outbound = outbound
                .header(http::header::ACCEPT, "text/event-stream")
                .header(http::header::CACHE_CONTROL, "no-cache")
                .header(http::header::CONNECTION, "keep-alive");
        }
        let outbound = match outbound.body(Full::new(request_body)) {
            Ok(r) => r,
            Err(e) => {
                warn!(id, "failed to build outbound request: {e}");
                return bad_gateway(e.to_string());
            }
        };

        let timeout = if is_predicted_sse { None } else { Some(NORMAL_TIMEOUT) };
        let response = match self.transport.send(&host, port, is_https, outbound, timeout).await {
            Ok(r) => r,
            Err(e) => {
                debug!(id, "dispatch failed: {e}");
                self.events.emit(Event::Error {
                    id: id.clone(),
                    message: e.to_string(),
                    is_timeout: e.is_timeout(),
                });
                return bad_gateway(e.to_string());
            }
        };

        let status = response.status();
        let version_str = format!("{:?}", response.version());
        let response_headers = HeaderMultiMap::from(response.headers());
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let is_sse = sse::is_sse_response(content_type.as_deref(), Some(&path), query.as_deref());

        if is_sse {
            // Headers-only observation before the body starts streaming —
            // the terminal ResponseObserved with the assembled body comes
            // from the SSE Relay at upstream EOF.
            self.events.emit(Event::ResponseObserved {
                id: id.clone(),
                status_code: status.as_u16(),
                headers: response_headers,
                content_type: content_type.clone(),
                body: Vec::new(),
                is_binary: false,
                duration_ms: started_at.elapsed().as_millis() as i64,
                terminal: false,
            });

            let relay_headers = {
                let mut h = HeaderMultiMap::new();
                h.push("Content-Type", "text/event-stream");
                h.push("Cache-Control", "no-cache");
                h.push("Connection", "keep-alive");
                h
            };
            let body = relay::relay_sse(
                id.clone(),
                response.into_body(),
                self.events.clone(),
                relay_headers,
                content_type,
                started_at,
            );

            let mut builder = Response::builder().status(StatusCode::OK);
            builder = builder.header(http::header::CONTENT_TYPE, "text/event-stream");
            builder = builder.header(http::header::CACHE_CONTROL, "no-cache");
            builder = builder.header(http::header::CONNECTION, "keep-alive");
            builder = builder.header("X-Protocol", version_str);
            return builder.body(body).unwrap_or_else(|_| bad_gateway("response build failed".into()));
        }

        let collect = transport::collect_body(response.into_body());
        let raw_body_result = if is_predicted_sse {
            collect.await
        } else {
            let remaining = NORMAL_TIMEOUT.saturating_sub(started_at.elapsed());
            match tokio::time::timeout(remaining, collect).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::ProxyError::Timeout {
                    target: host.clone(),
                    elapsed_ms: started_at.elapsed().as_millis() as u64,
                }),
            }
        };
        let raw_body = match raw_body_result {
            Ok(b) => b,
            Err(e) => {
                let is_timeout = e.is_timeout();
                self.events.emit(Event::Error {
                    id: id.clone(),
                    message: e.to_string(),
                    is_timeout,
                });
                return bad_gateway(e.to_string());
            }
        };

        let content_encoding = response_headers_get(&response_headers, "content-encoding");
        let decoded = match body::decode_body(content_encoding.as_deref(), &raw_body) {
            Ok(d) => d,
            Err(e) => {
                warn!(id, "decompress failed: {e}");
                self.events.emit(Event::Error {
                    id: id.clone(),
                    message: e.to_string(),
                    is_timeout: false,
                });
                body::DecodedBody {
                    bytes: raw_body.to_vec(),
                    encoding_removed: false,
                    passthrough_note: None,
                }
            }
        };

        let mut final_headers = response_headers;
        if decoded.encoding_removed {
            final_headers.0.retain(|(k, _)| !k.eq_ignore_ascii_case("content-encoding"));
            final_headers.0.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
            final_headers.push("Content-Length", decoded.bytes.len().to_string());
        }

        let is_binary = !body::is_text(content_type.as_deref(), &decoded.bytes);

        self.events.emit(Event::ResponseObserved {
            id: id.clone(),
            status_code: status.as_u16(),
            headers: final_headers.clone(),
            content_type: content_type.clone(),
            body: decoded.bytes.clone(),
            is_binary,
            duration_ms: started_at.elapsed().as_millis() as i64,
            terminal: true,
        });

        let mut builder = Response::builder().status(status).version(parts.version);
        for (name, value) in final_headers.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header("X-Protocol", version_str);

        builder
            .body(RespBody::new(Full::new(Bytes::from(decoded.bytes)).map_err(|never: Infallible| match never {})))
            .unwrap_or_else(|_| bad_gateway("response build failed".into()))
    }
}

fn response_headers_get(headers: &HeaderMultiMap, name: &str) -> Option<String> {
    headers.get_first(name).map(|s| s.to_string())
}

fn bad_gateway(reason: String) -> Response<RespBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(RespBody::new(
            Full::new(Bytes::from(reason)).map_err(|never: Infallible| match never {}),
        ))
        .expect("static bad-gateway response is always valid")
}

/// Resolve the request's target as an absolute `Uri`. Absolute-form
/// requests (as a forward proxy normally receives them) pass through
/// unchanged; origin-form requests (as seen inside an MITM tunnel, where
/// the client believes it's talking directly to the origin) are
/// reassembled from the `Host` header and the request path.
fn absolute_uri<B>(req: &Request<B>, is_https: bool) -> Result<Uri, http::Error> {
    if req.uri().scheme().is_some() {
        return Ok(req.uri().clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme(if is_https { "https" } else { "http" })
        .authority(host)
        .path_and_query(path_and_query)
        .build()
}
