//! Traffic Store — the capped, insertion-ordered record of observed
//! exchanges backing both the inspection UI's snapshot and its live
//! deltas.

use crate::config::DEFAULT_STORE_CAPACITY;
use crate::events::EventObserver;
use crate::model::{Event, HeaderMultiMap, TrafficEntry};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

/// Single-mutex, insertion-ordered ring of traffic entries. Oldest
/// entries are evicted once `capacity` is exceeded.
pub struct TrafficStore {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }

    pub fn insert(&self, entry: TrafficEntry) {
        let mut entries = self.entries.lock().expect("traffic store lock poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn with_entry_mut<F: FnOnce(&mut TrafficEntry)>(&self, id: &str, f: F) {
        let mut entries = self.entries.lock().expect("traffic store lock poisoned");
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => f(entry),
            None => warn!(id, "traffic store update for unknown entry id"),
        }
    }

    pub fn update_response(
        &self,
        id: &str,
        status_code: u16,
        headers: HeaderMultiMap,
        content_type: Option<String>,
        body: Vec<u8>,
        is_binary: bool,
        duration_ms: i64,
        terminal: bool,
    ) {
        self.with_entry_mut(id, |entry| {
            entry.status_code = Some(status_code);
            entry.response_headers = headers;
            entry.content_size = body.len();
            entry.content_type = content_type;
            entry.response_body = body;
            entry.response_is_binary = is_binary;
            if terminal {
                entry.duration_ms = Some(duration_ms);
                entry.end_time = Some(entry.start_time + chrono::Duration::milliseconds(duration_ms.max(0)));
                if entry.flags.is_sse {
                    entry.flags.is_sse_completed = true;
                }
            }
        });
    }

    pub fn append_sse_line(&self, id: &str, line: &str) {
        self.with_entry_mut(id, |entry| {
            entry.flags.is_sse = true;
            if !entry.response_body.is_empty() {
                entry.response_body.push(b'\n');
            }
            entry.response_body.extend_from_slice(line.as_bytes());
            entry.content_size = entry.response_body.len();
        });
    }

    pub fn complete_sse(&self, id: &str) {
        self.with_entry_mut(id, |entry| {
            entry.flags.is_sse_completed = true;
        });
    }

    pub fn mark_error(&self, id: &str, message: &str, is_timeout: bool) {
        self.with_entry_mut(id, |entry| {
            entry.error = Some(message.to_string());
            entry.flags.is_timeout = is_timeout;
            if entry.end_time.is_none() {
                entry.finish(chrono::Utc::now());
            }
        });
    }

    /// Merge provider-annotator tags into an existing entry.
    pub fn add_tags(&self, id: &str, tags: impl IntoIterator<Item = String>) {
        self.with_entry_mut(id, |entry| {
            entry.tags.extend(tags);
        });
    }

    pub fn get(&self, id: &str) -> Option<TrafficEntry> {
        self.entries
            .lock()
            .expect("traffic store lock poisoned")
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<TrafficEntry> {
        self.entries
            .lock()
            .expect("traffic store lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("traffic store lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("traffic store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wires the store up as an Event Bus observer: every event is folded
/// into the corresponding entry update.
impl EventObserver for TrafficStore {
    fn on_event(&self, event: &Event) {
        match event {
            Event::RequestObserved { entry, .. } => self.insert(entry.clone()),
            Event::ResponseObserved {
                id,
                status_code,
                headers,
                content_type,
                body,
                is_binary,
                duration_ms,
                terminal,
            } => self.update_response(
                id,
                *status_code,
                headers.clone(),
                content_type.clone(),
                body.clone(),
                *is_binary,
                *duration_ms,
                *terminal,
            ),
            Event::SSELine { id, line } => self.append_sse_line(id, line),
            Event::Error {
                id,
                message,
                is_timeout,
            } => self.mark_error(id, message, *is_timeout),
            Event::TunnelEstablished { .. } => {}
        }
    }
}
