//! # throttle
//!
//! why: snapshot copies must not starve log replication of disk and network bandwidth
//! relations: consulted chunk by chunk by LocalSnapshotCopier
//! what: SnapshotThrottle trait, ThroughputSnapshotThrottle

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use raft_core::ThrottleOptions;

pub trait SnapshotThrottle: Send + Sync {
    /// how many of `bytes` may be transferred now, possibly 0
    fn throttled_by_throughput(&self, bytes: u64) -> u64;

    /// reserve a copy slot, false when all are taken
    fn add_one_more_task(&self) -> bool;

    fn finish_one_task(&self);

    /// how long a copier waits after being granted nothing
    fn check_interval(&self) -> Duration;
}

#[derive(Debug)]
struct ThrottleState {
    cycle_start: Instant,
    cycle_bytes: u64,
    tasks: u32,
}

/// grants at most `throughput / check_cycle` bytes per `1s / check_cycle`
#[derive(Debug)]
pub struct ThroughputSnapshotThrottle {
    bytes_per_cycle: u64,
    cycle: Duration,
    max_tasks: u32,
    state: Mutex<ThrottleState>,
}

impl ThroughputSnapshotThrottle {
    /// a `throughput_bytes_per_s` of 0 disables the byte limit, a `max_tasks` of 0 the task limit
    pub fn new(throughput_bytes_per_s: u64, check_cycle: u32, max_tasks: u32) -> Self {
        let check_cycle = check_cycle.max(1);
        let bytes_per_cycle = match throughput_bytes_per_s {
            0 => 0,
            // a throughput below check_cycle still grants a byte per cycle
            bytes => (bytes / u64::from(check_cycle)).max(1),
        };
        Self {
            bytes_per_cycle,
            cycle: Duration::from_secs(1) / check_cycle,
            max_tasks,
            state: Mutex::new(ThrottleState {
                cycle_start: Instant::now(),
                cycle_bytes: 0,
                tasks: 0,
            }),
        }
    }

    pub fn from_options(options: &ThrottleOptions) -> Self {
        Self::new(options.throughput_bytes_per_s, options.check_cycle, options.max_tasks)
    }

    pub fn running_tasks(&self) -> u32 {
        self.state.lock().tasks
    }
}

impl SnapshotThrottle for ThroughputSnapshotThrottle {
    fn throttled_by_throughput(&self, bytes: u64) -> u64 {
        if self.bytes_per_cycle == 0 {
            return bytes;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.cycle_start) >= self.cycle {
            state.cycle_start = now;
            state.cycle_bytes = 0;
        }
        let allowed = bytes.min(self.bytes_per_cycle.saturating_sub(state.cycle_bytes));
        state.cycle_bytes += allowed;
        allowed
    }

    fn add_one_more_task(&self) -> bool {
        let mut state = self.state.lock();
        if self.max_tasks > 0 && state.tasks >= self.max_tasks {
            return false;
        }
        state.tasks += 1;
        true
    }

    fn finish_one_task(&self) {
        let mut state = self.state.lock();
        state.tasks = state.tasks.saturating_sub(1);
    }

    fn check_interval(&self) -> Duration {
        self.cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_bytes_within_one_cycle() {
        // one cycle per hour keeps the window from rolling over mid-test
        let throttle = ThroughputSnapshotThrottle {
            bytes_per_cycle: 100,
            cycle: Duration::from_secs(3600),
            max_tasks: 0,
            state: Mutex::new(ThrottleState { cycle_start: Instant::now(), cycle_bytes: 0, tasks: 0 }),
        };
        assert_eq!(throttle.throttled_by_throughput(60), 60);
        assert_eq!(throttle.throttled_by_throughput(60), 40);
        assert_eq!(throttle.throttled_by_throughput(60), 0);
    }

    #[test]
    fn zero_throughput_is_unlimited() {
        let throttle = ThroughputSnapshotThrottle::new(0, 10, 0);
        assert_eq!(throttle.throttled_by_throughput(1 << 30), 1 << 30);
    }

    #[test]
    fn tiny_throughput_still_throttles() {
        let throttle = ThroughputSnapshotThrottle::new(5, 10, 0);
        assert_eq!(throttle.bytes_per_cycle, 1);
        assert!(throttle.throttled_by_throughput(1 << 20) <= 1);
    }

    #[test]
    fn task_slots_are_bounded() {
        let throttle = ThroughputSnapshotThrottle::new(1024, 10, 1);
        assert!(throttle.add_one_more_task());
        assert!(!throttle.add_one_more_task());
        throttle.finish_one_task();
        assert!(throttle.add_one_more_task());
        assert_eq!(throttle.running_tasks(), 1);
    }
}
