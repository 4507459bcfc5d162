//! SSE Recognizer — classifies requests/responses as Server-Sent Events
//! streams using headers and URL heuristics.

const STREAM_PATH_MARKERS: &[&str] = &[
    "/events",
    "/stream",
    "/sse",
    "/notifications",
    "/messages",
    "/updates",
    "/push",
    "/chat",
    "/completions",
    "/v1/chat/completions",
];

/// Response-side recognition: did the upstream actually send SSE?
///
/// `request_path` / `request_query` are `None` when there was no
/// associated request context, which always yields `false`.
pub fn is_sse_response(
    content_type: Option<&str>,
    request_path: Option<&str>,
    request_query: Option<&str>,
) -> bool {
    let Some(path) = request_path else {
        return false;
    };
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();

    if content_type.contains("text/event-stream") {
        return true;
    }

    if content_type.contains("application/json") {
        if path.contains("/stream") {
            return true;
        }
        if path.contains("/completions") || path.contains("/chat/completions") {
            let query = request_query.unwrap_or("");
            if query_has_stream_true(query) {
                return true;
            }
        }
    }

    false
}

fn query_has_stream_true(query: &str) -> bool {
    query
        .split('&')
        .any(|pair| matches!(pair.split_once('='), Some(("stream", "true"))))
}

/// Request-side predictive recognition: should we *expect* SSE before the
/// response arrives? Drives the no-timeout transport and SSE-friendly
/// request headers.
pub fn is_predicted_sse(accept_header: Option<&str>, path: &str) -> bool {
    if let Some(accept) = accept_header {
        if accept.to_ascii_lowercase().contains("text/event-stream") {
            return true;
        }
    }
    STREAM_PATH_MARKERS.iter().any(|marker| path.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_stream_content_type_is_recognized() {
        assert!(is_sse_response(
            Some("text/event-stream"),
            Some("/anything"),
            None
        ));
    }

    #[test]
    fn nil_request_path_never_recognized() {
        assert!(!is_sse_response(Some("text/event-stream"), None, None));
    }

    #[test]
    fn json_stream_path_is_recognized() {
        assert!(is_sse_response(
            Some("application/json"),
            Some("/v1/stream"),
            None
        ));
    }

    #[test]
    fn json_completions_requires_stream_query_flag() {
        assert!(is_sse_response(
            Some("application/json"),
            Some("/v1/chat/completions"),
            Some("stream=true")
        ));
        assert!(!is_sse_response(
            Some("application/json"),
            Some("/v1/chat/completions"),
            Some("stream=false")
        ));
        assert!(!is_sse_response(
            Some("application/json"),
            Some("/v1/chat/completions"),
            None
        ));
    }

    #[test]
    fn plain_json_without_stream_markers_is_not_sse() {
        assert!(!is_sse_response(
            Some("application/json"),
            Some("/v1/users"),
            None
        ));
    }

    #[test]
    fn predictive_recognition_from_accept_header() {
        assert!(is_predicted_sse(Some("text/event-stream"), "/anything"));
    }

    #[test]
    fn predictive_recognition_from_path_markers() {
        for path in ["/v1/chat/completions", "/events/feed", "/api/sse"] {
            assert!(is_predicted_sse(None, path), "expected {path} to predict SSE");
        }
        assert!(!is_predicted_sse(None, "/v1/users/42"));
    }
}
