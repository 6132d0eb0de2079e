use std::fmt::{self, Display};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures surfaced by runtime operations.
///
/// Every suspension point returns one of these rather than swallowing the
/// condition: a coroutine always observes how its wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// No recycled stack was available and a fresh allocation failed.
    /// Fatal to the requesting operation only.
    OutOfMemory,
    /// A channel operation used a buffer whose length disagrees with the
    /// channel's fixed message size.
    SizeMismatch { expected: usize, got: usize },
    /// The channel was closed (or its handle is stale) while the operation
    /// was pending or attempted.
    ChannelClosed,
    /// A sleep or channel wait was abandoned: either another coroutine
    /// cancelled it, or the runtime is tearing down.
    Cancelled,
    /// Every live coroutine is blocked on a channel and no timer is pending,
    /// so no wakeup can ever occur.
    Deadlock,
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::OutOfMemory => write!(f, "out of memory: no stack could be provisioned"),
            RuntimeError::SizeMismatch { expected, got } => {
                write!(f, "message size mismatch: channel carries {} bytes, got {}", expected, got)
            }
            RuntimeError::ChannelClosed => write!(f, "channel is closed"),
            RuntimeError::Cancelled => write!(f, "wait was cancelled"),
            RuntimeError::Deadlock => {
                write!(f, "deadlock: all coroutines blocked on channels with no pending timer")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}
