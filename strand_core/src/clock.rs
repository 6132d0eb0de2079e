use std::cell::Cell;
use std::time::{Duration, Instant};

/// Milliseconds since the owning clock's origin.
pub type Tick = u64;

/// Monotonic time source for the scheduler.
///
/// The timer queue never reads time itself; the scheduler feeds it ticks
/// from here, so ordering logic stays deterministic under test.
pub trait Clock {
    fn now(&self) -> Tick;

    /// Block the underlying thread until `deadline`. Called only when no
    /// coroutine is runnable; with everything parked there is nothing else
    /// the thread could do.
    fn wait_until(&self, deadline: Tick);
}

/// Wall clock backed by `Instant`.
#[derive(Debug)]
pub struct SteadyClock {
    origin: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SteadyClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SteadyClock {
    fn now(&self) -> Tick {
        self.origin.elapsed().as_millis() as Tick
    }

    fn wait_until(&self, deadline: Tick) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(Duration::from_millis(deadline - now));
        }
    }
}

/// Test clock that only moves when waited on.
///
/// `wait_until` jumps straight to the deadline, so timer-driven scenarios
/// run instantly and deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Tick>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Cell::new(0) }
    }

    pub fn advance(&self, ticks: Tick) {
        self.now.set(self.now.get() + ticks);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.now.get()
    }

    fn wait_until(&self, deadline: Tick) {
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
    }
}
