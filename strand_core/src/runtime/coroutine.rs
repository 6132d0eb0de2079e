use std::rc::Rc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};
use generational_arena::Index;

use crate::clock::{Clock, Tick};
use crate::error::Result;
use crate::telemetry::RuntimeStats;

use super::channel::ChannelHandle;
use super::timer::TimerId;

/// Identifies a spawned coroutine. Arena-backed, so a handle to a completed
/// coroutine never aliases a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineHandle(pub(crate) Index);

pub(crate) type EntryFn = Box<dyn FnOnce(&mut Ctx<'_>) + 'static>;

/// What a suspended coroutine asks of the scheduler. The suspension itself
/// is the only way a coroutine ever gives up the thread.
pub(crate) enum Request {
    Yield,
    Sleep { deadline: Tick },
    Spawn { entry: EntryFn },
    MakeChannel { msg_size: usize, capacity: usize },
    Send { channel: ChannelHandle, msg: Box<[u8]> },
    Recv { channel: ChannelHandle, len: usize },
    Close { channel: ChannelHandle },
    Cancel { target: CoroutineHandle },
    Stats,
}

/// What the scheduler answers when it next resumes the coroutine. Each
/// request has exactly one matching reply shape.
pub(crate) enum Reply {
    /// First resume after spawn; there is no pending request yet.
    Begin,
    Woken(Result<()>),
    Spawned(Result<CoroutineHandle>),
    ChannelMade(ChannelHandle),
    Sent(Result<()>),
    Received(Result<Box<[u8]>>),
    Closed(Result<()>),
    CancelDone(bool),
    Stats(RuntimeStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoroState {
    Ready,
    Running,
    BlockedTimer { timer: TimerId },
    BlockedSend { channel: ChannelHandle },
    BlockedRecv { channel: ChannelHandle },
}

type Machine = Coroutine<Reply, Request, (), &'static mut DefaultStack>;

/// One live coroutine: its suspended execution state, the pooled stack it
/// runs on, and the scheduler-side bookkeeping.
///
/// The stack is loaned to the machine as `&'static mut` while the box lives
/// here as a raw pointer; `take_stack`/`Drop` reconstitute the box only
/// after the machine (the sole borrower) is dropped.
pub(crate) struct Coro {
    pub machine: Option<Machine>,
    stack: *mut DefaultStack,
    stack_size: usize,
    pub state: CoroState,
    /// Reply delivered on the next resume. Set when the coroutine is woken.
    pub wake: Option<Reply>,
}

impl Coro {
    pub fn new(stack: Box<DefaultStack>, stack_size: usize, clock: Rc<dyn Clock>, entry: EntryFn) -> Self {
        let stack = Box::into_raw(stack);
        let loan: &'static mut DefaultStack = unsafe { &mut *stack };
        let machine = Machine::with_stack(loan, move |yielder, _begin: Reply| {
            let mut ctx = Ctx::new(yielder, clock);
            entry(&mut ctx);
        });
        Self {
            machine: Some(machine),
            stack,
            stack_size,
            state: CoroState::Ready,
            wake: Some(Reply::Begin),
        }
    }

    /// Drop the machine and reclaim the stack so the pool can recycle it.
    /// Returns `None` if the stack was already taken.
    pub fn take_stack(&mut self) -> Option<(Box<DefaultStack>, usize)> {
        // Machine first: dropping a mid-flight coroutine unwinds on its own
        // stack, which must still be alive at that point.
        drop(self.machine.take());
        if self.stack.is_null() {
            return None;
        }
        let stack = unsafe { Box::from_raw(self.stack) };
        self.stack = std::ptr::null_mut();
        Some((stack, self.stack_size))
    }
}

impl Drop for Coro {
    fn drop(&mut self) {
        drop(self.machine.take());
        if !self.stack.is_null() {
            unsafe { drop(Box::from_raw(self.stack)) };
            self.stack = std::ptr::null_mut();
        }
    }
}

/// Guest-side handle to the runtime, passed to every coroutine entry.
///
/// Each method that can suspend sends one `Request` across the control
/// transfer and decodes the scheduler's `Reply`; no scheduler state is ever
/// touched from a coroutine's stack.
pub struct Ctx<'y> {
    yielder: &'y Yielder<Reply, Request>,
    clock: Rc<dyn Clock>,
}

impl<'y> Ctx<'y> {
    pub(crate) fn new(yielder: &'y Yielder<Reply, Request>, clock: Rc<dyn Clock>) -> Self {
        Self { yielder, clock }
    }

    /// Monotonic clock read, in milliseconds since the runtime's origin.
    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Hand the processor to the next ready coroutine and resume once
    /// rescheduled. Fails only with `Cancelled` during teardown.
    pub fn yield_now(&mut self) -> Result<()> {
        match self.yielder.suspend(Request::Yield) {
            Reply::Woken(res) => res,
            _ => unreachable!("scheduler replied out of protocol to yield"),
        }
    }

    /// Suspend until `now() >= deadline`. `Err(Cancelled)` if the sleep is
    /// abandoned first.
    pub fn sleep(&mut self, deadline: Tick) -> Result<()> {
        match self.yielder.suspend(Request::Sleep { deadline }) {
            Reply::Woken(res) => res,
            _ => unreachable!("scheduler replied out of protocol to sleep"),
        }
    }

    /// Sleep for a relative duration in ticks.
    pub fn sleep_for(&mut self, ticks: Tick) -> Result<()> {
        let deadline = self.now() + ticks;
        self.sleep(deadline)
    }

    /// Queue a new coroutine as ready and return its handle. The spawned
    /// coroutine runs no code until the caller yields or blocks.
    pub fn spawn<F>(&mut self, entry: F) -> Result<CoroutineHandle>
    where
        F: FnOnce(&mut Ctx<'_>) + 'static,
    {
        match self.yielder.suspend(Request::Spawn { entry: Box::new(entry) }) {
            Reply::Spawned(res) => res,
            _ => unreachable!("scheduler replied out of protocol to spawn"),
        }
    }

    /// Create a channel carrying fixed-size messages. `capacity` 0 makes
    /// every send a synchronous rendezvous.
    pub fn channel(&mut self, msg_size: usize, capacity: usize) -> ChannelHandle {
        match self.yielder.suspend(Request::MakeChannel { msg_size, capacity }) {
            Reply::ChannelMade(handle) => handle,
            _ => unreachable!("scheduler replied out of protocol to channel"),
        }
    }

    /// Send `msg` (copied by value). Blocks until a receiver takes it when
    /// the channel has no free buffer space.
    pub fn send(&mut self, channel: ChannelHandle, msg: &[u8]) -> Result<()> {
        let msg = msg.to_vec().into_boxed_slice();
        match self.yielder.suspend(Request::Send { channel, msg }) {
            Reply::Sent(res) => res,
            _ => unreachable!("scheduler replied out of protocol to send"),
        }
    }

    /// Receive one message into `buf`, blocking until a sender provides it.
    /// `buf` must be exactly the channel's message size.
    pub fn recv(&mut self, channel: ChannelHandle, buf: &mut [u8]) -> Result<()> {
        match self.yielder.suspend(Request::Recv { channel, len: buf.len() }) {
            Reply::Received(Ok(msg)) => {
                buf.copy_from_slice(&msg);
                Ok(())
            }
            Reply::Received(Err(err)) => Err(err),
            _ => unreachable!("scheduler replied out of protocol to recv"),
        }
    }

    /// Close the channel, waking every blocked sender and receiver with
    /// `ChannelClosed`. Closing twice is a no-op.
    pub fn close(&mut self, channel: ChannelHandle) -> Result<()> {
        match self.yielder.suspend(Request::Close { channel }) {
            Reply::Closed(res) => res,
            _ => unreachable!("scheduler replied out of protocol to close"),
        }
    }

    /// Abandon `target`'s pending sleep or channel wait; it resumes with
    /// `Err(Cancelled)`. Returns false (a no-op) if the target isn't
    /// blocked; cancelling an already-fired wait never double-wakes.
    pub fn cancel(&mut self, target: CoroutineHandle) -> bool {
        match self.yielder.suspend(Request::Cancel { target }) {
            Reply::CancelDone(hit) => hit,
            _ => unreachable!("scheduler replied out of protocol to cancel"),
        }
    }

    /// Live counter snapshot.
    pub fn stats(&mut self) -> RuntimeStats {
        match self.yielder.suspend(Request::Stats) {
            Reply::Stats(stats) => stats,
            _ => unreachable!("scheduler replied out of protocol to stats"),
        }
    }
}
