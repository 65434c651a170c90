use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "index.file.start")]
    IndexFileStart,
    #[serde(rename = "index.file.end")]
    IndexFileEnd,
    #[serde(rename = "index.file.failed")]
    IndexFileFailed,
    #[serde(rename = "index.repo.start")]
    IndexRepoStart,
    #[serde(rename = "index.repo.progress")]
    IndexRepoProgress,
    #[serde(rename = "index.repo.end")]
    IndexRepoEnd,
    #[serde(rename = "index.repo.failed")]
    IndexRepoFailed,
    #[serde(rename = "cache.hit")]
    CacheHit,
    #[serde(rename = "cache.miss")]
    CacheMiss,
    #[serde(rename = "cache.evict")]
    CacheEvict,
    #[serde(rename = "graph.upsert.node")]
    GraphUpsertNode,
    #[serde(rename = "graph.upsert.edge")]
    GraphUpsertEdge,
    #[serde(rename = "lock.acquired")]
    LockAcquired,
    #[serde(rename = "lock.released")]
    LockReleased,
    #[serde(rename = "lock.denied")]
    LockDenied,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IndexFileStart => "index.file.start",
            EventKind::IndexFileEnd => "index.file.end",
            EventKind::IndexFileFailed => "index.file.failed",
            EventKind::IndexRepoStart => "index.repo.start",
            EventKind::IndexRepoProgress => "index.repo.progress",
            EventKind::IndexRepoEnd => "index.repo.end",
            EventKind::IndexRepoFailed => "index.repo.failed",
            EventKind::CacheHit => "cache.hit",
            EventKind::CacheMiss => "cache.miss",
            EventKind::CacheEvict => "cache.evict",
            EventKind::GraphUpsertNode => "graph.upsert.node",
            EventKind::GraphUpsertEdge => "graph.upsert.edge",
            EventKind::LockAcquired => "lock.acquired",
            EventKind::LockReleased => "lock.released",
            EventKind::LockDenied => "lock.denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreEvent {
    pub sequence: u64,
    pub kind: EventKind,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

impl CoreEvent {
    pub fn new(kind: EventKind, trace_id: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            kind,
            trace_id: trace_id.into(),
            repository: None,
            file_path: None,
            detail: BTreeMap::new(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event sink lock poisoned")]
    LockPoisoned,
}

/// Transport-agnostic observability hook. Adapters decide where events go;
/// the core only guarantees they are emitted with a trace id.
pub trait EventSink: Send + Sync {
    fn record(&self, event: CoreEvent) -> Result<(), EventError>;
}

/// Default sink: structured tracing lines.
#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: CoreEvent) -> Result<(), EventError> {
        tracing::info!(
            event = event.kind.as_str(),
            trace_id = %event.trace_id,
            repository = event.repository.as_deref().unwrap_or(""),
            file_path = event.file_path.as_deref().unwrap_or(""),
            "core event"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<CoreEvent>>,
    sequence: AtomicU64,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Result<Vec<CoreEvent>, EventError> {
        let events = self.events.lock().map_err(|_| EventError::LockPoisoned)?;
        Ok(events.clone())
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|event| event.kind == kind).count())
            .unwrap_or(0)
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, mut event: CoreEvent) -> Result<(), EventError> {
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut events = self.events.lock().map_err(|_| EventError::LockPoisoned)?;
        events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_assigns_monotonic_sequence() {
        let sink = InMemoryEventSink::default();
        let trace = new_trace_id();
        sink.record(CoreEvent::new(EventKind::CacheHit, &trace))
            .unwrap();
        sink.record(CoreEvent::new(EventKind::CacheMiss, &trace))
            .unwrap();

        let events = sink.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[1].sequence, 2);
        assert_eq!(events[0].trace_id, trace);
    }

    #[test]
    fn event_kind_serializes_to_dotted_names() {
        let json = serde_json::to_string(&EventKind::IndexFileStart).unwrap();
        assert_eq!(json, "\"index.file.start\"");
    }
}
