use std::collections::VecDeque;
use std::rc::Rc;

use corosensei::CoroutineResult;
use generational_arena::{Arena, Index};

use crate::clock::Clock;
use crate::error::{Result, RuntimeError};
use crate::telemetry::RuntimeStats;

use super::channel::{ChannelTable, RecvOutcome, SendOutcome};
use super::coroutine::{Coro, CoroState, CoroutineHandle, EntryFn, Reply, Request};
use super::stack_pool::StackPool;
use super::timer::TimerQueue;
use super::Config;

/// How one request left the running coroutine.
enum Step {
    /// The request completed synchronously; resume the same coroutine with
    /// this reply, no other coroutine runs in between.
    Continue(Reply),
    /// The coroutine yielded or parked; control stays with the dispatcher.
    Suspend,
}

/// Single-threaded cooperative scheduler.
///
/// Owns every piece of runtime state: the coroutine arena, the FIFO ready
/// queue, the timer queue, the channel registry, and the stack pool. All of
/// it is mutated only between control transfers, which is the entire
/// synchronization story. One coroutine runs at a time, so no locks.
pub(crate) struct Scheduler {
    config: Config,
    clock: Rc<dyn Clock>,
    coros: Arena<Coro>,
    ready: VecDeque<Index>,
    timers: TimerQueue,
    channels: ChannelTable,
    pool: StackPool,
    shutting_down: bool,
    stats: RuntimeStats,
}

impl Scheduler {
    pub fn new(config: Config, clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            coros: Arena::new(),
            ready: VecDeque::new(),
            timers: TimerQueue::new(),
            channels: ChannelTable::new(),
            pool: StackPool::new(config.max_pooled_stacks),
            shutting_down: false,
            stats: RuntimeStats::default(),
            config,
        }
    }

    /// Spawn `entry` as the root coroutine and dispatch until it completes,
    /// then tear down whatever it left behind.
    pub fn run(&mut self, entry: EntryFn) -> Result<()> {
        self.shutting_down = false;
        let root = self.spawn_coroutine(entry)?.0;
        let result = self.dispatch(root);
        if result.is_err() {
            self.reap_all();
        }
        result
    }

    /// Main loop: drain expired timers, run the ready queue FIFO, otherwise
    /// wait for the nearest deadline. Expired timers enter the ready queue
    /// in deadline order at the top of every iteration, ahead of any
    /// interleaving with channel wakes from the coroutines they release.
    fn dispatch(&mut self, root: Index) -> Result<()> {
        loop {
            let now = self.clock.now();
            for (_, waiter) in self.timers.pop_expired(now) {
                self.stats.timers_fired += 1;
                self.wake(waiter, Reply::Woken(Ok(())));
            }

            if let Some(idx) = self.ready.pop_front() {
                self.run_coroutine(idx);
                if !self.shutting_down && self.coros.get(root).is_none() {
                    // Root finished: fail every remaining wait instead of
                    // leaking it, then keep dispatching until the arena
                    // drains.
                    self.teardown();
                }
                if self.coros.is_empty() {
                    return Ok(());
                }
                continue;
            }

            if self.coros.is_empty() {
                return Ok(());
            }

            if let Some(deadline) = self.timers.peek_earliest() {
                // Nothing runnable; this is the one place the OS thread may
                // block.
                self.clock.wait_until(deadline);
                continue;
            }

            // Live coroutines, an empty ready queue, and no timers: everyone
            // left is parked on a channel no one can ever complete.
            return Err(RuntimeError::Deadlock);
        }
    }

    fn spawn_coroutine(&mut self, entry: EntryFn) -> Result<CoroutineHandle> {
        let (stack, size) = self.pool.acquire(self.config.stack_size)?;
        let coro = Coro::new(stack, size, Rc::clone(&self.clock), entry);
        let idx = self.coros.insert(coro);
        self.ready.push_back(idx);
        self.stats.spawned += 1;
        Ok(CoroutineHandle(idx))
    }

    /// Transfer control into `idx` and keep feeding it replies until it
    /// suspends for real or its entry function returns.
    fn run_coroutine(&mut self, idx: Index) {
        let (mut machine, mut reply) = match self.coros.get_mut(idx) {
            Some(coro) => {
                // Taken out of the slot while running so request handling
                // can borrow the scheduler freely.
                let machine = match coro.machine.take() {
                    Some(machine) => machine,
                    None => return,
                };
                coro.state = CoroState::Running;
                let reply = coro.wake.take().expect("coroutine scheduled without a wake reply");
                (machine, reply)
            }
            None => return,
        };
        self.stats.context_switches += 1;

        let finished = loop {
            match machine.resume(reply) {
                CoroutineResult::Return(()) => break true,
                CoroutineResult::Yield(request) => match self.apply(idx, request) {
                    Step::Continue(next) => reply = next,
                    Step::Suspend => break false,
                },
            }
        };

        if finished {
            drop(machine);
            if let Some(mut coro) = self.coros.remove(idx) {
                // Stack back to the pool the instant the coroutine is done.
                if let Some((stack, size)) = coro.take_stack() {
                    self.pool.release(stack, size);
                }
            }
            self.stats.completed += 1;
        } else if let Some(coro) = self.coros.get_mut(idx) {
            coro.machine = Some(machine);
        }
    }

    fn apply(&mut self, idx: Index, request: Request) -> Step {
        match request {
            Request::Yield => {
                if self.shutting_down {
                    return Step::Continue(Reply::Woken(Err(RuntimeError::Cancelled)));
                }
                self.wake(idx, Reply::Woken(Ok(())));
                Step::Suspend
            }
            Request::Sleep { deadline } => {
                if self.shutting_down {
                    return Step::Continue(Reply::Woken(Err(RuntimeError::Cancelled)));
                }
                // A past deadline still transits the queue, so it wakes in
                // deadline order with any other expired sleeper.
                let timer = self.timers.insert(deadline, idx);
                self.set_state(idx, CoroState::BlockedTimer { timer });
                Step::Suspend
            }
            Request::Spawn { entry } => {
                if self.shutting_down {
                    return Step::Continue(Reply::Spawned(Err(RuntimeError::Cancelled)));
                }
                Step::Continue(Reply::Spawned(self.spawn_coroutine(entry)))
            }
            Request::MakeChannel { msg_size, capacity } => {
                Step::Continue(Reply::ChannelMade(self.channels.create(msg_size, capacity)))
            }
            Request::Send { channel, msg } => {
                if self.shutting_down {
                    return Step::Continue(Reply::Sent(Err(RuntimeError::Cancelled)));
                }
                match self.channels.send(channel, idx, msg) {
                    Ok(SendOutcome::Rendezvous { receiver, msg }) => {
                        self.stats.messages_passed += 1;
                        self.wake(receiver, Reply::Received(Ok(msg)));
                        Step::Continue(Reply::Sent(Ok(())))
                    }
                    Ok(SendOutcome::Buffered) => Step::Continue(Reply::Sent(Ok(()))),
                    Ok(SendOutcome::Parked) => {
                        self.set_state(idx, CoroState::BlockedSend { channel });
                        Step::Suspend
                    }
                    Err(err) => Step::Continue(Reply::Sent(Err(err))),
                }
            }
            Request::Recv { channel, len } => {
                if self.shutting_down {
                    return Step::Continue(Reply::Received(Err(RuntimeError::Cancelled)));
                }
                match self.channels.recv(channel, idx, len) {
                    Ok(RecvOutcome::Delivered { msg, unparked_sender }) => {
                        self.stats.messages_passed += 1;
                        if let Some(sender) = unparked_sender {
                            self.wake(sender, Reply::Sent(Ok(())));
                        }
                        Step::Continue(Reply::Received(Ok(msg)))
                    }
                    Ok(RecvOutcome::Parked) => {
                        self.set_state(idx, CoroState::BlockedRecv { channel });
                        Step::Suspend
                    }
                    Err(err) => Step::Continue(Reply::Received(Err(err))),
                }
            }
            Request::Close { channel } => match self.channels.close(channel) {
                Ok(waiters) => {
                    for receiver in waiters.receivers {
                        self.wake(receiver, Reply::Received(Err(RuntimeError::ChannelClosed)));
                    }
                    for sender in waiters.senders {
                        self.wake(sender, Reply::Sent(Err(RuntimeError::ChannelClosed)));
                    }
                    Step::Continue(Reply::Closed(Ok(())))
                }
                Err(err) => Step::Continue(Reply::Closed(Err(err))),
            },
            Request::Cancel { target } => {
                Step::Continue(Reply::CancelDone(self.cancel_coroutine(target.0)))
            }
            Request::Stats => Step::Continue(Reply::Stats(self.snapshot())),
        }
    }

    /// Move a parked coroutine back to the ready queue with the reply it
    /// will see on resume.
    fn wake(&mut self, idx: Index, reply: Reply) {
        if let Some(coro) = self.coros.get_mut(idx) {
            coro.state = CoroState::Ready;
            coro.wake = Some(reply);
            self.ready.push_back(idx);
        }
    }

    fn set_state(&mut self, idx: Index, state: CoroState) {
        if let Some(coro) = self.coros.get_mut(idx) {
            coro.state = state;
        }
    }

    /// Abandon whatever single wait structure holds `target` and reschedule
    /// it with `Err(Cancelled)`. False if it wasn't blocked (no-op for
    /// waits that already fired).
    fn cancel_coroutine(&mut self, target: Index) -> bool {
        let state = match self.coros.get(target) {
            Some(coro) => coro.state,
            None => return false,
        };
        match state {
            CoroState::BlockedTimer { .. }
            | CoroState::BlockedSend { .. }
            | CoroState::BlockedRecv { .. } => {
                self.abandon_wait(target, state);
                true
            }
            _ => false,
        }
    }

    fn abandon_wait(&mut self, idx: Index, state: CoroState) {
        match state {
            CoroState::BlockedTimer { timer } => {
                self.timers.cancel(timer);
                self.stats.cancelled += 1;
                self.wake(idx, Reply::Woken(Err(RuntimeError::Cancelled)));
            }
            CoroState::BlockedSend { channel } => {
                self.channels.remove_waiter(channel, idx);
                self.stats.cancelled += 1;
                self.wake(idx, Reply::Sent(Err(RuntimeError::Cancelled)));
            }
            CoroState::BlockedRecv { channel } => {
                self.channels.remove_waiter(channel, idx);
                self.stats.cancelled += 1;
                self.wake(idx, Reply::Received(Err(RuntimeError::Cancelled)));
            }
            CoroState::Ready | CoroState::Running => {}
        }
    }

    /// Fail every blocked coroutine with `Cancelled`. From here on any
    /// suspension request is answered with `Cancelled` instead of parking,
    /// so the ready queue drains to nothing.
    fn teardown(&mut self) {
        self.shutting_down = true;
        let blocked: Vec<(Index, CoroState)> = self
            .coros
            .iter()
            .filter(|(_, coro)| !matches!(coro.state, CoroState::Ready | CoroState::Running))
            .map(|(idx, coro)| (idx, coro.state))
            .collect();
        for (idx, state) in blocked {
            self.abandon_wait(idx, state);
        }
    }

    /// Unwind and destroy every live coroutine, reclaiming stacks and
    /// leaving no waiter entries behind. Deadlock recovery path.
    fn reap_all(&mut self) {
        self.ready.clear();
        let entries: Vec<(Index, CoroState)> = self
            .coros
            .iter()
            .map(|(idx, coro)| (idx, coro.state))
            .collect();
        for (idx, state) in entries {
            match state {
                CoroState::BlockedTimer { timer } => {
                    self.timers.cancel(timer);
                }
                CoroState::BlockedSend { channel } | CoroState::BlockedRecv { channel } => {
                    self.channels.remove_waiter(channel, idx);
                }
                CoroState::Ready | CoroState::Running => {}
            }
            if let Some(mut coro) = self.coros.remove(idx) {
                if let Some((stack, size)) = coro.take_stack() {
                    self.pool.release(stack, size);
                }
            }
        }
    }

    pub fn snapshot(&self) -> RuntimeStats {
        let mut stats = self.stats;
        stats.stacks_in_use = self.pool.in_use();
        stats.stacks_pooled = self.pool.pooled();
        stats.stack_reuses = self.pool.reuses();
        stats
    }

    pub fn shrink_pool(&mut self) {
        self.pool.shrink();
    }
}
