//! Stats Module - Collection Statistics
//!
//! Collected by the coordinator at the end of every cycle:
//! - Pause time (total, last, max, distribution)
//! - Bytes and objects copied
//! - Live bytes after the last cycle

pub mod histogram;
pub mod timer;

pub use histogram::Histogram;
pub use timer::GcTimer;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Outcome of one completed collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleRecord {
    pub pause: Duration,
    pub bytes_copied: usize,
    pub objects_relocated: usize,
    pub live_bytes: usize,
}

/// GcStats - statistics collector for the coordinator
pub struct GcStats {
    cycles: AtomicU64,
    total_pause_ns: AtomicU64,
    last_pause_ns: AtomicU64,
    max_pause_ns: AtomicU64,
    bytes_copied: AtomicUsize,
    objects_relocated: AtomicUsize,
    live_bytes: AtomicUsize,
    pauses: Histogram,
    start_time: Instant,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            total_pause_ns: AtomicU64::new(0),
            last_pause_ns: AtomicU64::new(0),
            max_pause_ns: AtomicU64::new(0),
            bytes_copied: AtomicUsize::new(0),
            objects_relocated: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            pauses: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a completed collection
    pub fn record_cycle(&self, record: &CycleRecord) {
        let pause = record.pause.as_nanos() as u64;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.total_pause_ns.fetch_add(pause, Ordering::Relaxed);
        self.last_pause_ns.store(pause, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(pause, Ordering::Relaxed);
        self.bytes_copied
            .fetch_add(record.bytes_copied, Ordering::Relaxed);
        self.objects_relocated
            .fetch_add(record.objects_relocated, Ordering::Relaxed);
        self.live_bytes.store(record.live_bytes, Ordering::Relaxed);
        self.pauses.record(pause);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Pause time distribution, in nanoseconds
    pub fn pause_histogram(&self) -> &Histogram {
        &self.pauses
    }

    pub fn summary(&self) -> GcSummary {
        let to_ms = |ns: u64| ns as f64 / 1_000_000.0;
        GcSummary {
            cycles: self.cycles(),
            total_pause_ms: to_ms(self.total_pause_ns.load(Ordering::Relaxed)),
            last_pause_ms: to_ms(self.last_pause_ns.load(Ordering::Relaxed)),
            max_pause_ms: to_ms(self.max_pause_ns.load(Ordering::Relaxed)),
            p99_pause_ms: to_ms(self.pauses.p99()),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            objects_relocated: self.objects_relocated.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn reset(&self) {
        self.cycles.store(0, Ordering::Relaxed);
        self.total_pause_ns.store(0, Ordering::Relaxed);
        self.last_pause_ns.store(0, Ordering::Relaxed);
        self.max_pause_ns.store(0, Ordering::Relaxed);
        self.bytes_copied.store(0, Ordering::Relaxed);
        self.objects_relocated.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.pauses.clear();
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcSummary {
    pub cycles: u64,
    pub total_pause_ms: f64,
    pub last_pause_ms: f64,
    pub max_pause_ms: f64,
    /// Upper bound of the p99 pause bucket
    pub p99_pause_ms: f64,
    pub bytes_copied: usize,
    pub objects_relocated: usize,
    /// Bytes surviving the most recent cycle
    pub live_bytes: usize,
    pub uptime_secs: u64,
}

impl GcSummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
