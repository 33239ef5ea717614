//! Histogram - Pause Time Histogram
//!
//! Logarithmic buckets (bucket `n` holds values in `[2^(n-1), 2^n)`), used
//! for pause time percentiles.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram - value distribution with lock-free count/sum/min/max
pub struct Histogram {
    buckets: Mutex<BTreeMap<u32, u64>>,
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record one value
    pub fn record(&self, value: u64) {
        *self.buckets.lock().entry(Self::bucket(value)).or_insert(0) += 1;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    #[inline]
    fn bucket(value: u64) -> u32 {
        64 - value.leading_zeros()
    }

    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> u64 {
        let buckets = self.buckets.lock();
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (&bucket, &count) in buckets.iter() {
            cumulative += count;
            if cumulative >= target {
                return Self::upper_bound(bucket);
            }
        }
        buckets
            .last_key_value()
            .map(|(&bucket, _)| Self::upper_bound(bucket))
            .unwrap_or(0)
    }

    fn upper_bound(bucket: u32) -> u64 {
        match bucket {
            0 => 0,
            64 => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    pub fn mean(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.sum.load(Ordering::Relaxed) / count
    }

    pub fn min(&self) -> u64 {
        match self.min.load(Ordering::Relaxed) {
            u64::MAX => 0,
            min => min,
        }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.buckets.lock().clear();
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let histogram = Histogram::new();
        assert_eq!(histogram.count(), 0);
        assert_eq!(histogram.mean(), 0);
        assert_eq!(histogram.min(), 0);
        assert_eq!(histogram.p50(), 0);
    }

    #[test]
    fn test_record() {
        let histogram = Histogram::new();
        for value in [1, 2, 3, 100, 1000] {
            histogram.record(value);
        }
        assert_eq!(histogram.count(), 5);
        assert_eq!(histogram.min(), 1);
        assert_eq!(histogram.max(), 1000);
        assert_eq!(histogram.mean(), 221);
        // 3 of 5 values are <= 3, bucket [2, 4).
        assert_eq!(histogram.p50(), 3);
        assert_eq!(histogram.p99(), 1023);

        histogram.clear();
        assert_eq!(histogram.count(), 0);
        assert_eq!(histogram.max(), 0);
    }
}
