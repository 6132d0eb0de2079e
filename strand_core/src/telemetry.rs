use serde::{Deserialize, Serialize};

/// Snapshot of runtime counters.
///
/// Taken via `Runtime::stats` after a run, or live from inside a coroutine
/// via `Ctx::stats`. Counters accumulate across runs of the same `Runtime`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Coroutines ever spawned (the root of each run included).
    pub spawned: u64,
    /// Coroutines whose entry function returned.
    pub completed: u64,
    /// Sleeps or channel waits abandoned through cancellation or teardown.
    pub cancelled: u64,
    /// Transfers of control into a coroutine.
    pub context_switches: u64,
    /// Timer entries that fired (as opposed to being cancelled).
    pub timers_fired: u64,
    /// Messages that reached a receiver, rendezvous or buffered.
    pub messages_passed: u64,
    /// Stacks currently assigned to live coroutines.
    pub stacks_in_use: usize,
    /// Stacks parked on the pool's free list.
    pub stacks_pooled: usize,
    /// Times a spawn was served from the free list instead of a fresh
    /// allocation.
    pub stack_reuses: u64,
}
