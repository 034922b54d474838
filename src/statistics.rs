//! Acquisition counters.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NO_FRAME: u64 = u64::MAX;

/// Snapshot of an acquirer's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcquisitionStatistics {
    /// Payloads pushed into the delivery queue.
    pub delivered: u64,
    /// Payloads discarded by the drop-oldest and newest-only policies.
    pub dropped: u64,
    /// Payloads the producer flagged incomplete.
    pub incomplete: u64,
    /// Native waits that ended without a buffer.
    pub wait_timeouts: u64,
    /// `fetch` calls that ended without a payload.
    pub fetch_timeouts: u64,
    /// Frame id of the most recent delivered payload.
    pub last_frame_id: Option<u64>,
    /// Time spent acquiring since the last reset.
    pub elapsed: Duration,
    /// Delivered payloads per second of `elapsed`.
    pub frame_rate: f64,
}

#[derive(Debug, Default)]
struct Timing {
    started: Option<Instant>,
    accumulated: Duration,
}

impl Timing {
    fn elapsed(&self) -> Duration {
        self.accumulated + self.started.map_or(Duration::ZERO, |t| t.elapsed())
    }
}

#[derive(Debug)]
pub(crate) struct StatisticsRecorder {
    delivered: AtomicU64,
    dropped: AtomicU64,
    incomplete: AtomicU64,
    wait_timeouts: AtomicU64,
    fetch_timeouts: AtomicU64,
    last_frame_id: AtomicU64,
    timing: Mutex<Timing>,
}

impl Default for StatisticsRecorder {
    fn default() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            incomplete: AtomicU64::new(0),
            wait_timeouts: AtomicU64::new(0),
            fetch_timeouts: AtomicU64::new(0),
            last_frame_id: AtomicU64::new(NO_FRAME),
            timing: Mutex::new(Timing::default()),
        }
    }
}

impl StatisticsRecorder {
    pub(crate) fn record_delivered(&self, frame_id: u64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.last_frame_id.store(frame_id, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_incomplete(&self) {
        self.incomplete.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_timeout(&self) {
        self.fetch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn acquisition_started(&self) {
        let mut timing = self.timing.lock();
        if timing.started.is_none() {
            timing.started = Some(Instant::now());
        }
    }

    pub(crate) fn acquisition_stopped(&self) {
        let mut timing = self.timing.lock();
        if let Some(started) = timing.started.take() {
            timing.accumulated += started.elapsed();
        }
    }

    /// Zero every counter; a running clock restarts now.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.delivered,
            &self.dropped,
            &self.incomplete,
            &self.wait_timeouts,
            &self.fetch_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_frame_id.store(NO_FRAME, Ordering::Relaxed);
        let mut timing = self.timing.lock();
        timing.accumulated = Duration::ZERO;
        if timing.started.is_some() {
            timing.started = Some(Instant::now());
        }
    }

    pub(crate) fn snapshot(&self) -> AcquisitionStatistics {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let elapsed = self.timing.lock().elapsed();
        let frame_rate = if elapsed.is_zero() {
            0.0
        } else {
            delivered as f64 / elapsed.as_secs_f64()
        };
        let last = self.last_frame_id.load(Ordering::Relaxed);
        AcquisitionStatistics {
            delivered,
            dropped: self.dropped.load(Ordering::Relaxed),
            incomplete: self.incomplete.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            fetch_timeouts: self.fetch_timeouts.load(Ordering::Relaxed),
            last_frame_id: (last != NO_FRAME).then_some(last),
            elapsed,
            frame_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = StatisticsRecorder::default();
        stats.acquisition_started();
        stats.record_delivered(7);
        stats.record_delivered(8);
        stats.record_dropped(2);
        stats.record_wait_timeout();

        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.dropped, 2);
        assert_eq!(snap.wait_timeouts, 1);
        assert_eq!(snap.last_frame_id, Some(8));

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 0);
        assert_eq!(snap.last_frame_id, None);
    }

    #[test]
    fn test_elapsed_freezes_when_stopped() {
        let stats = StatisticsRecorder::default();
        assert_eq!(stats.snapshot().elapsed, Duration::ZERO);
        stats.acquisition_started();
        std::thread::sleep(Duration::from_millis(5));
        stats.acquisition_stopped();
        let first = stats.snapshot().elapsed;
        assert!(first >= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.snapshot().elapsed, first);
    }
}
