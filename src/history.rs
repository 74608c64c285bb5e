use heapless::Deque;
use serde::{Deserialize, Serialize};

/// Samples retained per wheel for velocity smoothing.
pub const WHEEL_HISTORY_CAPACITY: usize = 5;

/// One timestamped distance reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HistorySample {
    pub timestamp_ms: u32,
    pub distance: f32,
}

/// Fixed-capacity ring of samples, oldest at the tail, newest at the head.
///
/// Pushing into a full ring silently evicts the oldest entry. Reads of an
/// empty ring return the configured default.
#[derive(Debug, Clone)]
pub struct RingHistory<T: Copy, const N: usize> {
    samples: Deque<T, N>,
    default: T,
}

impl<T: Copy, const N: usize> RingHistory<T, N> {
    pub fn new(default: T) -> Self {
        Self {
            samples: Deque::new(),
            default,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.samples.is_full() {
            self.samples.pop_front();
        }
        // Room was made above
        let _ = self.samples.push_back(value);
    }

    /// Most recently pushed value.
    pub fn head(&self) -> T {
        self.samples.back().copied().unwrap_or(self.default)
    }

    /// Oldest retained value.
    pub fn tail(&self) -> T {
        self.samples.front().copied().unwrap_or(self.default)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    /// Discard everything except the `n` most recent entries.
    pub fn truncate_to(&mut self, n: usize) {
        while self.samples.len() > n {
            self.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }
}

/// Smoothed velocity in distance units per second between the oldest and
/// newest samples. Zero until two samples span a non-zero interval.
pub fn sample_velocity<const N: usize>(history: &RingHistory<HistorySample, N>) -> f32 {
    if history.count() < 2 {
        return 0.0;
    }

    let newest = history.head();
    let oldest = history.tail();
    let elapsed_ms = newest.timestamp_ms.wrapping_sub(oldest.timestamp_ms);
    if elapsed_ms == 0 {
        return 0.0;
    }

    (newest.distance - oldest.distance) * 1000.0 / elapsed_ms as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut history: RingHistory<i32, 3> = RingHistory::new(0);
        for value in 1..=4 {
            history.push(value);
        }

        assert_eq!(history.tail(), 2);
        assert_eq!(history.head(), 4);
        assert_eq!(history.count(), 3);
        assert!(history.is_full());
    }

    #[test]
    fn test_empty_history_returns_default() {
        let history: RingHistory<i32, 3> = RingHistory::new(-7);
        assert!(history.is_empty());
        assert_eq!(history.head(), -7);
        assert_eq!(history.tail(), -7);
        assert_eq!(history.capacity(), 3);
    }

    #[test]
    fn test_truncate_keeps_most_recent() {
        let mut history: RingHistory<i32, 5> = RingHistory::new(0);
        for value in 10..15 {
            history.push(value);
        }

        history.truncate_to(1);
        assert_eq!(history.count(), 1);
        assert_eq!(history.head(), 14);
        assert_eq!(history.tail(), 14);

        // Truncating to a larger size is a no-op
        history.truncate_to(3);
        assert_eq!(history.count(), 1);
    }

    #[test]
    fn test_iter_is_oldest_first() {
        let mut history: RingHistory<u8, 3> = RingHistory::new(0);
        for value in [5, 6, 7, 8] {
            history.push(value);
        }
        let values: heapless::Vec<u8, 3> = history.iter().copied().collect();
        assert_eq!(values.as_slice(), &[6, 7, 8]);
    }

    #[test]
    fn test_sample_velocity() {
        let mut history: RingHistory<HistorySample, WHEEL_HISTORY_CAPACITY> =
            RingHistory::new(HistorySample::default());
        assert_eq!(sample_velocity(&history), 0.0);

        history.push(HistorySample { timestamp_ms: 1000, distance: 0.0 });
        assert_eq!(sample_velocity(&history), 0.0);

        history.push(HistorySample { timestamp_ms: 1250, distance: 0.5 });
        history.push(HistorySample { timestamp_ms: 1500, distance: 1.0 });
        assert!((sample_velocity(&history) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_velocity_same_timestamp() {
        let mut history: RingHistory<HistorySample, 3> = RingHistory::new(HistorySample::default());
        history.push(HistorySample { timestamp_ms: 10, distance: 0.0 });
        history.push(HistorySample { timestamp_ms: 10, distance: 1.0 });
        assert_eq!(sample_velocity(&history), 0.0);
    }
}
