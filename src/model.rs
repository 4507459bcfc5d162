//! Core data model: traffic entries, headers, and the event union that
//! flows from the Request Pipeline / HTTPS Tunnel Handler through the
//! Event Bus into the Traffic Store and Live Subscription layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A case-preserving, order-preserving multi-map of HTTP headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderMultiMap(pub Vec<(String, String)>);

impl HeaderMultiMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

impl From<&http::HeaderMap> for HeaderMultiMap {
    fn from(headers: &http::HeaderMap) -> Self {
        let mut map = HeaderMultiMap::new();
        for (name, value) in headers.iter() {
            map.push(
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            );
        }
        map
    }
}

/// Flags carried on a traffic entry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryFlags {
    pub is_https: bool,
    pub is_sse: bool,
    pub is_sse_completed: bool,
    pub is_timeout: bool,
}

/// One observed request/response exchange — the atomic unit exposed to
/// the inspection UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub method: String,
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub content_size: usize,
    pub protocol_version: String,
    pub request_headers: HeaderMultiMap,
    pub response_headers: HeaderMultiMap,
    #[serde(with = "body_as_base64_if_binary")]
    pub request_body: Vec<u8>,
    #[serde(with = "body_as_base64_if_binary")]
    pub response_body: Vec<u8>,
    /// Derived from `content_type` and a sample of `response_body` per the
    /// Body Codec's text/binary classification; `false` until a response
    /// is observed.
    pub response_is_binary: bool,
    pub flags: EntryFlags,
    pub error: Option<String>,
    pub tags: BTreeSet<String>,
}

/// Bodies are serialized as UTF-8 text when valid, otherwise base64 —
/// this keeps the wire format inspectable in the common case without
/// ever corrupting a binary payload.
mod body_as_base64_if_binary {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => text.serialize(ser),
            Err(_) => base64::engine::general_purpose::STANDARD
                .encode(bytes)
                .serialize(ser),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        Ok(s.into_bytes())
    }
}

impl TrafficEntry {
    pub fn new(method: String, url: String, scheme: String, host: String, path: String) -> Self {
        Self {
            id: String::new(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            method,
            url,
            scheme,
            host,
            path,
            status_code: None,
            content_type: None,
            content_size: 0,
            protocol_version: "HTTP/1.1".to_string(),
            request_headers: HeaderMultiMap::new(),
            response_headers: HeaderMultiMap::new(),
            request_body: Vec::new(),
            response_body: Vec::new(),
            response_is_binary: false,
            flags: EntryFlags::default(),
            error: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
        self.duration_ms = Some((at - self.start_time).num_milliseconds().max(0));
    }
}

/// Tagged union of observable occurrences, produced by the Request
/// Pipeline and HTTPS Tunnel Handler, consumed by the Traffic Store and
/// Live Subscription.
#[derive(Debug, Clone)]
pub enum Event {
    RequestObserved {
        id: String,
        entry: TrafficEntry,
    },
    ResponseObserved {
        id: String,
        status_code: u16,
        headers: HeaderMultiMap,
        content_type: Option<String>,
        body: Vec<u8>,
        is_binary: bool,
        duration_ms: i64,
        terminal: bool,
    },
    SSELine {
        id: String,
        line: String,
    },
    Error {
        id: String,
        message: String,
        is_timeout: bool,
    },
    TunnelEstablished {
        host: String,
        intercepted: bool,
    },
}

impl Event {
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            Event::RequestObserved { id, .. }
            | Event::ResponseObserved { id, .. }
            | Event::SSELine { id, .. }
            | Event::Error { id, .. } => Some(id),
            Event::TunnelEstablished { .. } => None,
        }
    }
}

/// A UI client session attached to the Live Subscription layer.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub connection_id: u64,
    pub subscribed: bool,
    pub last_snapshot_seq: u64,
}
