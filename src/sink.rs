//! Archival Sink & Provider Hook — pluggable extension points for
//! persisting traffic and annotating entries with higher-level metadata.
//! Only generic, no-op-by-default implementations ship here; a concrete
//! heuristic annotator is left to whoever embeds this crate.

use crate::events::EventObserver;
use crate::model::{Event, TrafficEntry};
use crate::store::TrafficStore;
use std::sync::Arc;
use tracing::info;

/// Receives finished traffic entries for archival. Implementations are
/// called after an entry is marked terminal and must not block the
/// calling task for long.
pub trait ArchivalSink: Send + Sync {
    fn add_entry(&self, entry: &TrafficEntry);
}

/// Discards everything. The default when no `-output-file` is set.
pub struct NullSink;

impl ArchivalSink for NullSink {
    fn add_entry(&self, _entry: &TrafficEntry) {}
}

/// Emits a one-line `tracing` record per entry. Useful for piping
/// archival through whatever log aggregation already exists rather than
/// maintaining a bespoke file format.
pub struct LoggingSink;

impl ArchivalSink for LoggingSink {
    fn add_entry(&self, entry: &TrafficEntry) {
        info!(
            id = %entry.id,
            method = %entry.method,
            url = %entry.url,
            status = ?entry.status_code,
            duration_ms = ?entry.duration_ms,
            "traffic entry archived"
        );
    }
}

/// Read-only hook for annotating entries with provider-specific metadata
/// (e.g. recognizing a particular upstream API and tagging its request
/// shape). No concrete heuristic ships in this crate; embedders supply
/// their own.
pub trait ProviderAnnotator: Send + Sync {
    fn annotate(&self, entry: &TrafficEntry) -> Vec<String>;
}

/// Adds no tags. The default when no annotator is configured.
pub struct NoopAnnotator;

impl ProviderAnnotator for NoopAnnotator {
    fn annotate(&self, _entry: &TrafficEntry) -> Vec<String> {
        Vec::new()
    }
}

/// Bridges `ProviderAnnotator` onto the Event Bus: on a terminal
/// `ResponseObserved`, looks the finished entry up in the Traffic Store
/// and merges whatever tags the annotator attaches. Registered ahead of
/// `SinkObserver` so archival sees the annotated tags.
pub struct AnnotatorObserver {
    store: Arc<TrafficStore>,
    annotator: Arc<dyn ProviderAnnotator>,
}

impl AnnotatorObserver {
    pub fn new(store: Arc<TrafficStore>, annotator: Arc<dyn ProviderAnnotator>) -> Self {
        Self { store, annotator }
    }
}

impl EventObserver for AnnotatorObserver {
    fn on_event(&self, event: &Event) {
        let Event::ResponseObserved { id, terminal: true, .. } = event else {
            return;
        };
        let Some(entry) = self.store.get(id) else {
            return;
        };
        let tags = self.annotator.annotate(&entry);
        if !tags.is_empty() {
            self.store.add_tags(id, tags);
        }
    }
}

/// Bridges `ArchivalSink` onto the Event Bus: on a terminal
/// `ResponseObserved`, looks the finished entry up in the Traffic Store
/// (post-annotation, if `AnnotatorObserver` is registered first) and
/// hands it to the sink exactly once.
pub struct SinkObserver {
    store: Arc<TrafficStore>,
    sink: Arc<dyn ArchivalSink>,
}

impl SinkObserver {
    pub fn new(store: Arc<TrafficStore>, sink: Arc<dyn ArchivalSink>) -> Self {
        Self { store, sink }
    }
}

impl EventObserver for SinkObserver {
    fn on_event(&self, event: &Event) {
        let Event::ResponseObserved { id, terminal: true, .. } = event else {
            return;
        };
        if let Some(entry) = self.store.get(id) {
            self.sink.add_entry(&entry);
        }
    }
}
