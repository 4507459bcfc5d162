//! SSE Relay — streams an upstream event-stream response to the client
//! line-by-line while recording a full copy for the Traffic Store.

use crate::events::EventBus;
use crate::model::Event;
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use std::convert::Infallible;
use tracing::debug;

pub type RespBody = BoxBody<Bytes, Infallible>;

/// Wraps `upstream` as a streaming response body. Lines are forwarded to
/// the client as they complete and, simultaneously, published as
/// `Event::SSELine` on `events`. When the upstream body ends, a terminal
/// `Event::ResponseObserved` carries the fully assembled capture.
pub fn relay_sse(
    id: String,
    upstream: Incoming,
    events: EventBus,
    response_headers: crate::model::HeaderMultiMap,
    content_type: Option<String>,
    started_at: std::time::Instant,
) -> RespBody {
    let stream = async_stream_lines(id, upstream, events, response_headers, content_type, started_at);
    BoxBody::new(StreamBody::new(stream).map_err(|never: Infallible| match never {}))
}

fn async_stream_lines(
    id: String,
    upstream: Incoming,
    events: EventBus,
    response_headers: crate::model::HeaderMultiMap,
    content_type: Option<String>,
    started_at: std::time::Instant,
) -> impl futures::Stream<Item = Result<Frame<Bytes>, Infallible>> {
    struct State {
        id: String,
        upstream: Incoming,
        events: EventBus,
        response_headers: crate::model::HeaderMultiMap,
        content_type: Option<String>,
        started_at: std::time::Instant,
        leftover: BytesMut,
        capture: Vec<u8>,
        done: bool,
    }

    let state = State {
        id,
        upstream,
        events,
        response_headers,
        content_type,
        started_at,
        leftover: BytesMut::new(),
        capture: Vec::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            if let Some(pos) = state.leftover.iter().position(|&b| b == b'\n') {
                let line_bytes = state.leftover.split_to(pos + 1);
                state.capture.extend_from_slice(&line_bytes);
                let trimmed = String::from_utf8_lossy(&line_bytes)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if !trimmed.is_empty() {
                    state.events.emit(Event::SSELine {
                        id: state.id.clone(),
                        line: trimmed,
                    });
                }
                return Some((Ok(Frame::data(Bytes::from(line_bytes.to_vec()))), state));
            }

            match state.upstream.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        state.leftover.extend_from_slice(&data);
                        continue;
                    }
                    continue;
                }
                Some(Err(e)) => {
                    debug!(id = %state.id, "sse upstream read error: {e}");
                    state.events.emit(Event::Error {
                        id: state.id.clone(),
                        message: e.to_string(),
                        is_timeout: false,
                    });
                    state.done = true;
                    continue;
                }
                None => {
                    if !state.leftover.is_empty() {
                        let remainder = state.leftover.split_to(state.leftover.len());
                        state.capture.extend_from_slice(&remainder);
                        state.done = true;
                        return Some((Ok(Frame::data(Bytes::from(remainder.to_vec()))), state));
                    }

                    state.events.emit(Event::ResponseObserved {
                        id: state.id.clone(),
                        status_code: 200,
                        headers: state.response_headers.clone(),
                        content_type: state.content_type.clone(),
                        body: state.capture.clone(),
                        is_binary: false,
                        duration_ms: state.started_at.elapsed().as_millis() as i64,
                        terminal: true,
                    });
                    state.done = true;
                    continue;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeaderMultiMap;

    #[tokio::test]
    async fn emits_sse_line_events_for_each_line() {
        let bus = EventBus::new();
        struct Collector(std::sync::Mutex<Vec<Event>>);
        impl crate::events::EventObserver for Collector {
            fn on_event(&self, event: &Event) {
                self.0.lock().unwrap().push(event.clone());
            }
        }
        let collector = std::sync::Arc::new(Collector(std::sync::Mutex::new(Vec::new())));
        bus.register(collector.clone());

        // Directly exercise the line-splitting state machine over an
        // in-memory buffer rather than a live `Incoming` body, since
        // constructing one outside of a real connection isn't possible.
        let mut leftover = BytesMut::from(&b"data: one\ndata: two\n"[..]);
        let mut lines = Vec::new();
        while let Some(pos) = leftover.iter().position(|&b| b == b'\n') {
            let line_bytes = leftover.split_to(pos + 1);
            let trimmed = String::from_utf8_lossy(&line_bytes)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            bus.emit(Event::SSELine {
                id: "x".into(),
                line: trimmed.clone(),
            });
            lines.push(trimmed);
        }

        assert_eq!(lines, vec!["data: one", "data: two"]);
        assert_eq!(collector.0.lock().unwrap().len(), 2);
        let _ = HeaderMultiMap::new();
    }

    #[tokio::test]
    async fn blank_separator_lines_are_not_emitted_as_sse_line_events() {
        let bus = EventBus::new();
        struct Collector(std::sync::Mutex<Vec<Event>>);
        impl crate::events::EventObserver for Collector {
            fn on_event(&self, event: &Event) {
                self.0.lock().unwrap().push(event.clone());
            }
        }
        let collector = std::sync::Arc::new(Collector(std::sync::Mutex::new(Vec::new())));
        bus.register(collector.clone());

        // Real `data: …\n\n` SSE framing: every event is followed by a
        // blank line, which must still reach the client but must not be
        // published as an `Event::SSELine`.
        let mut leftover = BytesMut::from(&b"data: one\n\ndata: two\n\n"[..]);
        let mut emitted = Vec::new();
        while let Some(pos) = leftover.iter().position(|&b| b == b'\n') {
            let line_bytes = leftover.split_to(pos + 1);
            let trimmed = String::from_utf8_lossy(&line_bytes)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if !trimmed.is_empty() {
                bus.emit(Event::SSELine {
                    id: "x".into(),
                    line: trimmed.clone(),
                });
                emitted.push(trimmed);
            }
        }

        assert_eq!(emitted, vec!["data: one", "data: two"]);
        let seen = collector.0.lock().unwrap();
        assert_eq!(seen.len(), 2, "blank separator lines must not produce SSELine events");
        for event in seen.iter() {
            if let Event::SSELine { line, .. } = event {
                assert!(!line.is_empty());
            }
        }
    }
}
