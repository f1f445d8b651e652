//! In-process actor runtime.
//!
//! `drover` dispatches typed messages to a potentially very large
//! population of actors while keeping the physical thread count small and
//! self-tuning. Actors are plain user values implementing [`Actor`],
//! bound to stable [`Address`]es inside a [`Framework`] that owns a pool
//! of worker threads, a mailbox directory, and a per-size-class message
//! allocation fast path.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: spinlock, allocator, address           (no internal deps)
//! Layer 1: pool, cache, envelope                  (allocation fast path)
//! Layer 2: mailbox, queue, directory, counters    (scheduling substrate)
//! Layer 3: actor, fallback, sender, processor     (dispatch)
//! Layer 4: threadpool, registry, framework        (lifecycle)
//! ```
//!
//! Message flow: `Framework::send` (or a handler's
//! [`DispatchContext::send`]) wraps the value into a type-erased
//! [`Envelope`] from the caching allocator, resolves the target mailbox
//! through the directory, pushes under the mailbox spinlock, and — on the
//! mailbox's empty→non-empty transition — schedules the mailbox on a work
//! queue and wakes a worker. The worker drains one message per visit
//! under a pin that serializes handlers per mailbox, then returns the
//! envelope block to the cache.
//!
//! # Guarantees
//!
//! - Messages from one sender to one target are handled in send order.
//! - Handlers for one mailbox never run concurrently.
//! - Every delivered envelope is destroyed exactly once.
//! - Unroutable and unhandled messages reach the framework's fallback
//!   handler.
//!
//! # Example
//!
//! ```no_run
//! use std::ptr::NonNull;
//! use drover::{Actor, Address, DispatchContext, Envelope, Framework};
//!
//! struct Echo;
//!
//! impl Actor for Echo {
//!     fn dispatch(&mut self, ctx: &mut DispatchContext<'_>, message: &Envelope) -> bool {
//!         if let Some(text) = message.get::<&'static str>() {
//!             println!("{text}");
//!             ctx.send(*text, message.sender());
//!             return true;
//!         }
//!         false
//!     }
//! }
//!
//! let framework = Framework::new();
//! let mut echo = Echo;
//! // SAFETY: `echo` outlives its deregistration below.
//! let address = unsafe {
//!     framework
//!         .register_actor(NonNull::from(&mut echo as &mut dyn Actor), Some("echo"))
//!         .expect("mailbox available")
//! };
//!
//! framework.send("hello", Address::NULL, address);
//!
//! framework.deregister_actor(address);
//! ```

pub mod actor;
pub mod address;
pub mod allocator;
pub mod cache;
pub mod counters;
pub mod envelope;
pub mod framework;
pub mod pool;
pub mod spinlock;

mod directory;
mod fallback;
mod mailbox;
mod processor;
mod queue;
mod registry;
mod sender;
mod threadpool;

pub use actor::{Actor, DispatchContext};
pub use address::Address;
pub use allocator::{Allocator, AllocatorManager, SystemAllocator, CACHE_LINE};
pub use cache::CachingAllocator;
pub use counters::Counter;
pub use envelope::Envelope;
pub use framework::{Framework, Parameters, RegisterError, YieldStrategy};
pub use sender::NetworkEndpoint;
pub use spinlock::{NullLock, RawLock, SpinLock};
