// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative in-process active-object scheduler.
//!
//! Long-lived stateful agents ("active objects") register with a
//! [`Controller`], which coordinates a potentially large population of them
//! on a single logical thread. On every tick the controller answers "which
//! object runs next, and when must I wake up again?" using three structures:
//!
//! - a **time index** (AVL tree ordered by deadline) of objects waiting for
//!   a wall-clock or emulated instant,
//! - an **identity index** (AVL tree ordered by `(kind, id)`) for lookup and
//!   ordered traversal,
//! - per-priority FIFO **ready queues** of signaled objects.
//!
//! An object's hook runs when its deadline arrives or when something else
//! (another object, an I/O completion, an external thread) signals it.
//! Above the scheduler sits a small signaling vocabulary ([`Signaler`],
//! [`Listener`], [`Flag`], [`SignalPub`]/[`SignalSub`]) and a tasks layer
//! ([`AsyncTask`], [`SystemTask`]) for computations that finish with an
//! exit code.
//!
//! All scheduler state is confined to the loop thread. Foreign threads get
//! exactly two operations, both on [`Handle`]: `wakeup` and `async_call`.
//!
//! # Example
//!
//! ```
//! use active_objects::{Context, Controller, Instant, emulate_asap};
//!
//! let mut controller = Controller::new(1);
//! let mut remaining = 3u32;
//! controller.build_object().spawn(move |cx: &mut Context<'_>| {
//!     remaining -= 1;
//!     if remaining == 0 {
//!         cx.close();
//!     } else {
//!         cx.schedule_seconds(1);
//!     }
//!     Ok(())
//! });
//!
//! // virtual time jumps deadline to deadline; no real sleeping involved
//! emulate_asap(&mut controller, Instant::from_secs(0))?;
//! # Ok::<(), active_objects::DriveError>(())
//! ```

mod controller;
mod drive;
mod error;
mod object;
mod retry;
mod signal;
mod slab;
mod task;
#[cfg(test)]
mod test_util;
mod time;

pub use controller::{Controller, Handle, ProcessOptions};
pub use drive::{async_loop, emulate_asap, simple_loop};
pub use error::{DriveError, HookError};
pub use object::{ActiveObject, Context, Kind, ObjectBuilder, ObjectRef};
pub use retry::WithRetries;
pub use signal::{Flag, FlagListener, Listener, SignalPub, SignalSub, Signaler};
pub use task::{AsyncTask, SystemTask, TaskCore};
pub use time::Instant;
