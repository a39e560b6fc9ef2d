//! # Lifecycle Events
//!
//! One-way stream of migration lifecycle events for external logging and CLI
//! layers. The engine emits into an [`EventBus`] that fans out to attached
//! [`EventSink`]s; correctness never depends on a sink being present.
//!
//! Events are plain data (no handles, no closures) so sinks can serialize
//! them wholesale.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default capacity of the in-memory sink's ring buffer.
const DEFAULT_SINK_CAPACITY: usize = 1000;

/// A migration lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum MigrationEvent {
    /// A plan was computed and approved
    PlanCreated {
        current_version: u64,
        target_version: u64,
        steps: usize,
        risk_level: String,
    },
    /// A migration step began executing
    StepStarted { version: u64, description: String },
    /// A migration step finished successfully
    StepCompleted { version: u64, duration_ms: u64 },
    /// A migration step failed
    StepFailed { version: u64, error: String },
    /// A failed step is being retried after backoff
    StepRetried {
        version: u64,
        attempt: u32,
        delay_ms: u64,
    },
    /// A rollback point was created
    RollbackPointCreated { id: String, version: u64 },
    /// A rollback sequence began
    RollbackStarted { from_version: u64, to_version: u64 },
    /// One rollback step finished; `applied_via` is "script" or "snapshot"
    RollbackStep {
        version: u64,
        applied_via: String,
        success: bool,
    },
    /// The rollback sequence finished
    RollbackCompleted {
        to_version: u64,
        steps_executed: usize,
        success: bool,
    },
    /// A transformation rule began executing
    RuleStarted { rule_id: String, table: String },
    /// A transformation batch committed or failed
    BatchCompleted {
        rule_id: String,
        batch: usize,
        total_batches: usize,
    },
    /// A transformation rule finished
    RuleCompleted {
        rule_id: String,
        processed: u64,
        successful: u64,
        failed: u64,
    },
    /// Old rollback points were cleaned up
    CleanupCompleted { deleted: usize },
    /// An analysis or status report was produced
    ReportGenerated { kind: String },
}

/// A timestamped event as delivered to sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: MigrationEvent,
}

/// Receiver of lifecycle events.
///
/// Implementations must not block: the engine emits on its own flow and a
/// slow sink would stall migration execution.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Fan-out bus for lifecycle events.
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink. Sinks cannot be detached; drop the bus instead.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().unwrap().push(sink);
    }

    /// Emit an event to every attached sink. A bus with no sinks is a no-op.
    pub fn emit(&self, event: MigrationEvent) {
        let sinks = self.sinks.read().unwrap();
        if sinks.is_empty() {
            return;
        }
        let envelope = EventEnvelope {
            at: Utc::now(),
            event,
        };
        for sink in sinks.iter() {
            sink.emit(&envelope);
        }
    }
}

/// Bounded in-memory sink, primarily for tests and status reporting.
///
/// Oldest entries are evicted once the ring is full.
pub struct MemorySink {
    entries: RwLock<VecDeque<EventEnvelope>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SINK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// All recorded events, oldest first.
    pub fn entries(&self) -> Vec<EventEnvelope> {
        self.entries.read().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, envelope: &EventEnvelope) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(envelope.clone());
    }
}
