//! # timer
//!
//! why: elections, heartbeats and snapshots all need a periodic callback that can be
//! stopped, re-armed and torn down without racing the callback itself
//! relations: drives SnapshotTimer; runs on the tokio runtime it was created in
//! what: TimerTask, RepeatedTimerTask, random_timeout
//!
//! state machine, every transition under one mutex:
//!
//! ```text
//! stopped --start--> running(pending) --fires--> running(invoking) --run returns--> pending | settled
//!    ^                    |                                                               |
//!    +------stop----------+ (cancel wins) / deferred to the running callback otherwise ---+
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::error;
use parking_lot::Mutex;
use rand::Rng;
use raft_core::{RaftError, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// behaviour plugged into a RepeatedTimerTask
pub trait TimerTask: Send + Sync + 'static {
    /// one firing; runs on a blocking worker, never under the timer lock
    fn run(&self);

    /// called exactly once after `destroy`, never while `run` is executing
    fn on_destroy(&self) {}

    /// per-firing timeout, e.g. to add jitter
    fn adjust_timeout(&self, timeout: Duration) -> Duration {
        timeout
    }
}

/// election-style jitter: `timeout_ms` plus up to `max_delay_ms`
pub fn random_timeout(timeout_ms: u64, max_delay_ms: u64) -> Duration {
    let delay = if max_delay_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_delay_ms)
    };
    Duration::from_millis(timeout_ms + delay)
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// one armed sleep; firing and cancelling race on `state` and exactly one wins
struct ScheduledTimer {
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

impl ScheduledTimer {
    /// true if the callback will not be dispatched for this arm
    fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.handle.abort();
        }
        won
    }
}

struct TimerState {
    timeout: Duration,
    stopped: bool,
    running: bool,
    destroyed: bool,
    invoking: bool,
    timer: Option<ScheduledTimer>,
}

struct Shared<T: TimerTask> {
    task: T,
    runtime: Handle,
    state: Mutex<TimerState>,
}

impl<T: TimerTask> Shared<T> {
    fn schedule(self: &Arc<Self>, state: &mut TimerState) {
        let timeout = self.task.adjust_timeout(state.timeout);
        let fire_state = Arc::new(AtomicU8::new(PENDING));
        let armed = fire_state.clone();
        let shared = self.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if armed
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let runtime = shared.runtime.clone();
                runtime.spawn_blocking(move || shared.run_once());
            }
        });
        state.timer = Some(ScheduledTimer { state: fire_state, handle });
    }

    fn run_once(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.timer = None;
            if state.stopped {
                state.running = false;
                let destroyed = state.destroyed;
                drop(state);
                if destroyed {
                    self.task.on_destroy();
                }
                return;
            }
            state.invoking = true;
        }

        if panic::catch_unwind(AssertUnwindSafe(|| self.task.run())).is_err() {
            error!("timer task panicked, the timer keeps its schedule");
        }

        let mut state = self.state.lock();
        state.invoking = false;
        if state.stopped {
            state.running = false;
            let destroyed = state.destroyed;
            drop(state);
            if destroyed {
                self.task.on_destroy();
            }
            return;
        }
        self.schedule(&mut state);
    }
}

/// a cancellable periodic task on a tokio runtime
///
/// `run` is dispatched onto a blocking worker each time the timeout elapses.
/// dropping the handle destroys the timer.
pub struct RepeatedTimerTask<T: TimerTask> {
    shared: Arc<Shared<T>>,
}

impl<T: TimerTask> RepeatedTimerTask<T> {
    /// a stopped timer bound to the current runtime
    pub fn new(task: T, timeout_ms: u64) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RaftError::InvalidArgument(format!("timer needs a tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(task, timeout_ms, runtime))
    }

    pub fn with_runtime(task: T, timeout_ms: u64, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                task,
                runtime,
                state: Mutex::new(TimerState {
                    timeout: Duration::from_millis(timeout_ms),
                    stopped: true,
                    running: false,
                    destroyed: false,
                    invoking: false,
                    timer: None,
                }),
            }),
        }
    }

    pub fn task(&self) -> &T {
        &self.shared.task
    }

    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.destroyed || !state.stopped {
            return;
        }
        state.stopped = false;
        if state.running {
            // a callback is still in flight and will re-arm on return
            return;
        }
        state.running = true;
        self.shared.schedule(&mut state);
    }

    /// takes effect immediately unless the callback already fired,
    /// in which case it stops once the callback returns
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        if let Some(timer) = state.timer.take() {
            if timer.cancel() {
                state.running = false;
            }
        }
    }

    /// re-arm with the current timeout
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        self.rearm(&mut state);
    }

    /// re-arm with a new timeout
    pub fn reset_with(&self, timeout_ms: u64) {
        let mut state = self.shared.state.lock();
        state.timeout = Duration::from_millis(timeout_ms);
        self.rearm(&mut state);
    }

    fn rearm(&self, state: &mut TimerState) {
        if state.stopped {
            return;
        }
        if let Some(timer) = state.timer.take() {
            if timer.cancel() {
                self.shared.schedule(state);
            }
        }
    }

    /// stop for good; `on_destroy` runs once, immediately or after an in-flight callback
    pub fn destroy(&self) {
        let mut state = self.shared.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        if !state.running {
            drop(state);
            self.shared.task.on_destroy();
            return;
        }
        if state.stopped {
            // stopped but a callback is still in flight, it settles the destroy
            return;
        }
        state.stopped = true;
        if let Some(timer) = state.timer.take() {
            if timer.cancel() {
                state.running = false;
                drop(state);
                self.shared.task.on_destroy();
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.shared.state.lock().timeout
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn describe(&self) -> String {
        let state = self.shared.state.lock();
        format!(
            "timeout({}ms) {} {} {} {}",
            state.timeout.as_millis(),
            if state.stopped { "STOPPED" } else { "STARTED" },
            if state.running { "RUNNING" } else { "IDLE" },
            if state.destroyed { "DESTROYED" } else { "ALIVE" },
            if state.invoking { "INVOKING" } else { "WAITING" },
        )
    }
}

impl<T: TimerTask> fmt::Debug for RepeatedTimerTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<T: TimerTask> Drop for RepeatedTimerTask<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
