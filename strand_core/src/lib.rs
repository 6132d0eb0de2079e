//! Single-threaded cooperative coroutine runtime.
//!
//! Coroutines run on private pooled stacks and hand the processor to each
//! other explicitly: `yield_now`, `sleep`, and blocking channel operations
//! are the only suspension points. Exactly one coroutine runs at a time, so
//! coroutine code shares data through channels (or plain `Rc`) without any
//! locking.
//!
//! ```no_run
//! use strand_core::Runtime;
//!
//! let mut rt = Runtime::new();
//! rt.run(|ctx| {
//!     let ch = ctx.channel(4, 0);
//!     ctx.spawn(move |ctx| {
//!         ctx.send(ch, &42i32.to_le_bytes()).unwrap();
//!     })
//!     .unwrap();
//!     let mut buf = [0u8; 4];
//!     ctx.recv(ch, &mut buf).unwrap();
//!     assert_eq!(i32::from_le_bytes(buf), 42);
//! })
//! .unwrap();
//! ```

pub mod clock;
pub mod error;
pub mod runtime;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SteadyClock, Tick};
pub use error::{Result, RuntimeError};
pub use runtime::{ChannelHandle, Config, CoroutineHandle, Ctx, Runtime};
pub use telemetry::RuntimeStats;
