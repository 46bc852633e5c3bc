//! Session Statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tracing::info;

use super::Direction;

/// Byte counters for one relay session
#[derive(Debug)]
pub struct SessionStats {
    start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    mirrored_output: AtomicU64,
    mirrored_input: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub mirrored_output: u64,
    pub mirrored_input: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            mirrored_output: AtomicU64::new(0),
            mirrored_input: AtomicU64::new(0),
        }
    }

    /// Count bytes relayed in `direction`
    pub fn add_relayed(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::Upstream => &self.bytes_up,
            Direction::Downstream => &self.bytes_down,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count bytes written to the duplication endpoint of `direction`
    pub fn add_mirrored(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::Upstream => &self.mirrored_output,
            Direction::Downstream => &self.mirrored_input,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes relayed client to target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes relayed target to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn mirrored_output(&self) -> u64 {
        self.mirrored_output.load(Ordering::Relaxed)
    }

    pub fn mirrored_input(&self) -> u64 {
        self.mirrored_input.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let duration = self.duration();
        StatsSnapshot {
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            mirrored_output: self.mirrored_output(),
            mirrored_input: self.mirrored_input(),
        }
    }

    /// Log the counters as one structured event
    pub fn log(&self, session: &str) {
        let snapshot = self.snapshot();
        info!(
            session = %session,
            duration_ms = snapshot.duration_ms,
            bytes_up = snapshot.bytes_up,
            bytes_down = snapshot.bytes_down,
            mirrored_output = snapshot.mirrored_output,
            mirrored_input = snapshot.mirrored_input,
            "[{}] session stats",
            session
        );
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_direction() {
        let stats = SessionStats::new();
        stats.add_relayed(Direction::Upstream, 4);
        stats.add_relayed(Direction::Upstream, 6);
        stats.add_relayed(Direction::Downstream, 3);
        stats.add_mirrored(Direction::Upstream, 10);

        assert_eq!(stats.bytes_up(), 10);
        assert_eq!(stats.bytes_down(), 3);
        assert_eq!(stats.mirrored_output(), 10);
        assert_eq!(stats.mirrored_input(), 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_up, 10);
        assert_eq!(snapshot.bytes_down, 3);
    }
}
