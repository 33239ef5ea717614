//! GC Logging and Tracing
//!
//! Every collection and thread lifecycle change is recorded as a
//! [`GcEvent`]. The runtime's [`GcLogger`] keeps the most recent events in
//! a bounded ring for inspection and forwards each one to the `log` facade,
//! either human readable or as one JSON object per line.
//!
//! Log Levels:
//! - ERROR: allocation failures that end in out-of-memory
//! - INFO: cycle start/end, heap resizing
//! - DEBUG: safepoints, phases, thread attach/detach

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Events kept by default
pub const DEFAULT_CAPACITY: usize = 1024;

/// GC event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    /// Coordinator picked up a collection request
    CycleStart {
        cycle: u64,
        heap_used: usize,
        threads: usize,
    },

    /// Every other thread is paused
    SafepointReached {
        cycle: u64,
        threads: usize,
        wait_us: u64,
    },

    /// One collection phase finished
    PhaseComplete {
        cycle: u64,
        phase: String,
        duration_us: u64,
    },

    /// Collection finished and threads released
    CycleEnd {
        cycle: u64,
        pause_us: u64,
        live_bytes: usize,
        reclaimed_bytes: usize,
    },

    /// Soft limit of the active semispace changed
    HeapResized { old_limit: usize, new_limit: usize },

    /// Allocation failed even after a collection
    AllocationFailure { requested: usize, available: usize },

    ThreadAttached { thread_id: u64, name: Option<String> },

    ThreadDetached { thread_id: u64 },
}

impl GcEvent {
    fn level(&self) -> log::Level {
        match self {
            GcEvent::AllocationFailure { .. } => log::Level::Error,
            GcEvent::CycleStart { .. } | GcEvent::CycleEnd { .. } | GcEvent::HeapResized { .. } => {
                log::Level::Info
            },
            GcEvent::SafepointReached { .. }
            | GcEvent::PhaseComplete { .. }
            | GcEvent::ThreadAttached { .. }
            | GcEvent::ThreadDetached { .. } => log::Level::Debug,
        }
    }

    /// Human-readable one-line rendering
    pub fn describe(&self) -> String {
        match self {
            GcEvent::CycleStart {
                cycle,
                heap_used,
                threads,
            } => format!(
                "cycle {} started ({} bytes in use, {} threads)",
                cycle, heap_used, threads
            ),
            GcEvent::SafepointReached {
                cycle,
                threads,
                wait_us,
            } => format!(
                "cycle {}: {} threads reached safepoint in {} us",
                cycle, threads, wait_us
            ),
            GcEvent::PhaseComplete {
                cycle,
                phase,
                duration_us,
            } => format!("cycle {}: {} complete ({} us)", cycle, phase, duration_us),
            GcEvent::CycleEnd {
                cycle,
                pause_us,
                live_bytes,
                reclaimed_bytes,
            } => format!(
                "cycle {} complete: paused {} us, {} bytes live, {} reclaimed",
                cycle, pause_us, live_bytes, reclaimed_bytes
            ),
            GcEvent::HeapResized {
                old_limit,
                new_limit,
            } => format!("semispace limit {} -> {} bytes", old_limit, new_limit),
            GcEvent::AllocationFailure {
                requested,
                available,
            } => format!(
                "allocation of {} bytes failed ({} available)",
                requested, available
            ),
            GcEvent::ThreadAttached { thread_id, name } => match name {
                Some(name) => format!("thread {} ({}) attached", thread_id, name),
                None => format!("thread {} attached", thread_id),
            },
            GcEvent::ThreadDetached { thread_id } => format!("thread {} detached", thread_id),
        }
    }
}

/// A recorded event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GcEvent,
}

/// GC Logger - bounded event ring plus `log` output
pub struct GcLogger {
    events: Mutex<VecDeque<LoggedEvent>>,
    capacity: usize,
    enabled: AtomicBool,
    json: bool,
}

impl GcLogger {
    pub fn new(enabled: bool, json: bool) -> Self {
        Self::with_capacity(enabled, json, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(enabled: bool, json: bool, capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            enabled: AtomicBool::new(enabled),
            json,
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record an event and emit it through `log`
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() {
            return;
        }
        let logged = LoggedEvent {
            timestamp: Utc::now(),
            event,
        };
        self.emit(&logged);

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(logged);
    }

    fn emit(&self, logged: &LoggedEvent) {
        let level = logged.event.level();
        if !log::log_enabled!(target: "sgc", level) {
            return;
        }
        if self.json {
            match serde_json::to_string(logged) {
                Ok(line) => log::log!(target: "sgc", level, "{}", line),
                Err(err) => log::warn!(target: "sgc", "unserializable gc event: {}", err),
            }
        } else {
            log::log!(target: "sgc", level, "[GC] {}", logged.event.describe());
        }
    }

    /// Snapshot of the recorded events, oldest first
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Recorded events as a JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.events.lock())
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl std::fmt::Debug for GcLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcLogger")
            .field("events", &self.event_count())
            .field("capacity", &self.capacity)
            .field("enabled", &self.is_enabled())
            .field("json", &self.json)
            .finish()
    }
}
