use std::collections::{BTreeSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use weft_types::{CategoryFilter, EventsJson, TraceOptions, WatchSpec};

/// Signal from the local collector back onto the coordinating queue.
///
/// `record_event` runs on whatever thread produced the event; nothing here
/// is processed in place.
pub(crate) enum LocalSignal {
    WatchMatched(WatchSpec),
}

struct Inner {
    enabled: bool,
    continuous: bool,
    capacity: usize,
    events: VecDeque<String>,
    seen_categories: BTreeSet<String>,
    watch: Option<WatchSpec>,
    signal: Option<mpsc::UnboundedSender<LocalSignal>>,
}

/// The coordinator process's own trace buffer, the "+1" participant of
/// every ack-counted round.
///
/// Callable from any thread. `continuous` capture overwrites the oldest
/// buffered event once full; otherwise new events are dropped.
pub struct LocalTraceLog {
    inner: Mutex<Inner>,
}

impl LocalTraceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled: false,
                continuous: false,
                capacity,
                events: VecDeque::new(),
                seen_categories: BTreeSet::new(),
                watch: None,
                signal: None,
            }),
        }
    }

    pub(crate) fn attach_signal(&self, tx: mpsc::UnboundedSender<LocalSignal>) {
        self.inner.lock().signal = Some(tx);
    }

    /// Record one pre-serialized trace event.
    ///
    /// `json` is a single event object, embedded verbatim into flushed
    /// chunks. Filter match semantics belong to the instrumentation layer
    /// that calls this; everything handed over while collection is enabled
    /// is buffered.
    pub fn record_event(&self, category: &str, name: &str, json: impl Into<String>) {
        let mut inner = self.inner.lock();

        if let Some(watch) = &inner.watch {
            if watch.category == category && watch.name == name {
                let matched = watch.clone();
                if let Some(signal) = &inner.signal {
                    let _ = signal.send(LocalSignal::WatchMatched(matched));
                }
            }
        }

        if !inner.enabled {
            return;
        }
        inner.seen_categories.insert(category.to_string());
        if inner.events.len() >= inner.capacity {
            if !inner.continuous {
                return;
            }
            inner.events.pop_front();
        }
        inner.events.push_back(json.into());
    }

    pub fn begin(&self, _filter: &CategoryFilter, options: TraceOptions) {
        let mut inner = self.inner.lock();
        inner.enabled = true;
        inner.continuous = options.continuous;
        inner.events.clear();
    }

    pub fn percent_full(&self) -> f32 {
        let inner = self.inner.lock();
        if inner.capacity == 0 {
            return 100.0;
        }
        (inner.events.len() as f32 / inner.capacity as f32) * 100.0
    }

    pub fn set_watch(&self, spec: Option<WatchSpec>) {
        self.inner.lock().watch = spec;
    }

    /// Stop collecting; the buffered events stay put until drained.
    pub fn stop(&self) {
        self.inner.lock().enabled = false;
    }

    /// Drain the buffer into comma-joined chunks of at most `chunk_events`
    /// events, plus the locally-known category set. A monitoring snapshot
    /// drains without stopping; an end-recording round stops first.
    pub fn drain_chunks(&self, chunk_events: usize) -> (Vec<EventsJson>, BTreeSet<String>) {
        let mut inner = self.inner.lock();
        let events = std::mem::take(&mut inner.events);
        let categories = inner.seen_categories.clone();
        (chunk(events, chunk_events), categories)
    }
}

fn chunk(events: VecDeque<String>, chunk_events: usize) -> Vec<EventsJson> {
    let per_chunk = chunk_events.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for event in events {
        current.push(event);
        if current.len() == per_chunk {
            chunks.push(EventsJson::new(current.join(",")));
            current.clear();
        }
    }
    if !current.is_empty() {
        chunks.push(EventsJson::new(current.join(",")));
    }
    chunks
}
