//! Body Codec — gzip/deflate decompression and text/binary classification.

use crate::error::{ProxyError, ProxyResult};
use flate2::read::{DeflateDecoder, GzDecoder};
use std::io::Read;
use tracing::debug;

const TEXT_CONTENT_TYPE_PREFIXES: &[&str] = &["text/"];

const TEXT_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-javascript",
    "application/x-www-form-urlencoded",
    "application/yaml",
    "application/x-yaml",
    "application/graphql",
    "application/rfc822",
    "application/grpc",
];

const TEXT_SUFFIXES: &[&str] = &["+json", "+xml", "+text"];

const BINARY_CONTENT_TYPE_PREFIXES: &[&str] =
    &["image/", "audio/", "video/", "font/", "model/"];

const BINARY_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/x-tar",
    "application/octet-stream",
];

/// Outcome of decompressing a response body.
pub struct DecodedBody {
    pub bytes: Vec<u8>,
    /// `true` when a `Content-Encoding` header was removed.
    pub encoding_removed: bool,
    /// Set when the encoding was recognized but not decoded (e.g. `br`).
    pub passthrough_note: Option<String>,
}

/// Decompress a response body per `Content-Encoding`. `gzip` and
/// `deflate` are decoded and the header stripped; anything else
/// (notably `br`) is passed through untouched with a diagnostic note.
pub fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> ProxyResult<DecodedBody> {
    match content_encoding.map(|s| s.to_ascii_lowercase()) {
        Some(enc) if enc == "gzip" => {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| ProxyError::Decompress {
                encoding: "gzip".into(),
                reason: e.to_string(),
            })?;
            Ok(DecodedBody {
                bytes: out,
                encoding_removed: true,
                passthrough_note: None,
            })
        }
        Some(enc) if enc == "deflate" => {
            let mut decoder = DeflateDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| ProxyError::Decompress {
                encoding: "deflate".into(),
                reason: e.to_string(),
            })?;
            Ok(DecodedBody {
                bytes: out,
                encoding_removed: true,
                passthrough_note: None,
            })
        }
        Some(enc) if !enc.is_empty() => {
            debug!("passing through unsupported content-encoding: {}", enc);
            Ok(DecodedBody {
                bytes: body.to_vec(),
                encoding_removed: false,
                passthrough_note: Some(format!("content-encoding '{enc}' passed through undecoded")),
            })
        }
        _ => Ok(DecodedBody {
            bytes: body.to_vec(),
            encoding_removed: false,
            passthrough_note: None,
        }),
    }
}

/// Classify a body as text or binary per the content-type/sampling rules.
pub fn is_text(content_type: Option<&str>, sample: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = strip_parameters(ct);
        if TEXT_CONTENT_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p))
            || TEXT_APPLICATION_TYPES.contains(&ct.as_str())
            || TEXT_SUFFIXES.iter().any(|suf| ct.ends_with(suf))
        {
            return true;
        }
        if BINARY_CONTENT_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p))
            || BINARY_CONTENT_TYPES.contains(&ct.as_str())
            || ct.starts_with("application/vnd.")
        {
            return false;
        }
    }
    classify_by_sampling(sample)
}

fn strip_parameters(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Valid UTF-8 with <15% control characters (excluding tab/LF/CR) among
/// the first 1024 bytes classifies as text.
fn classify_by_sampling(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(1024)];
    let text = match std::str::from_utf8(sample) {
        Ok(t) => t,
        Err(_) => return false,
    };
    if text.is_empty() {
        return true;
    }
    let control_count = text
        .bytes()
        .filter(|&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    (control_count as f64 / text.len() as f64) < 0.15
}
