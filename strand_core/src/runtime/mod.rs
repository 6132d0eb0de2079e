mod channel;
mod coroutine;
mod scheduler;
mod stack_pool;
mod timer;

pub use channel::ChannelHandle;
pub use coroutine::{CoroutineHandle, Ctx};

use std::rc::Rc;

use crate::clock::{Clock, SteadyClock};
use crate::error::Result;
use crate::telemetry::RuntimeStats;

use scheduler::Scheduler;

/// Runtime tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Stack capacity, in bytes, for every spawned coroutine.
    pub stack_size: usize,
    /// Completed coroutines' stacks kept for reuse before freeing.
    pub max_pooled_stacks: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024,
            max_pooled_stacks: 16,
        }
    }
}

/// Owner of one scheduler and everything it manages.
///
/// `run` blocks the calling thread until the root coroutine and everything
/// it left behind have finished. The runtime is reusable: a second `run`
/// starts fresh coroutines over the same stack pool, and stats accumulate
/// across runs.
pub struct Runtime {
    sched: Scheduler,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_clock(config, Rc::new(SteadyClock::new()))
    }

    /// Build against an explicit clock. Tests pass a `ManualClock` here to
    /// make timer scenarios instantaneous.
    pub fn with_clock(config: Config, clock: Rc<dyn Clock>) -> Self {
        Self {
            sched: Scheduler::new(config, clock),
        }
    }

    /// Run `entry` as the root coroutine to completion.
    ///
    /// When the root returns, every still-blocked coroutine is woken with
    /// `Cancelled` and allowed to unwind before this returns. Errors with
    /// `Deadlock` if all live coroutines are parked with no timer pending.
    pub fn run<F>(&mut self, entry: F) -> Result<()>
    where
        F: FnOnce(&mut Ctx<'_>) + 'static,
    {
        self.sched.run(Box::new(entry))
    }

    /// Cumulative counters plus current stack-pool gauges.
    pub fn stats(&self) -> RuntimeStats {
        self.sched.snapshot()
    }

    /// Free every pooled stack.
    pub fn shrink_stack_pool(&mut self) {
        self.sched.shrink_pool();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
