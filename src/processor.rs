//! Mailbox processing: per-worker context, the drain protocol, and the
//! idle yield strategies.
//!
//! Each worker owns a cache-line-isolated [`Context`]: a private local
//! queue of runnable mailboxes, an unlocked per-worker message cache, and
//! event counters. The drain protocol visits one message per mailbox
//! visit — pin the mailbox, dispatch the front envelope with the mailbox
//! unlocked, then pop, unpin, and re-enqueue if messages remain — so no
//! mailbox can monopolize a worker and handlers for one mailbox are never
//! concurrent.

use std::ptr;
use std::thread;

use crate::actor::DispatchContext;
use crate::address::Address;
use crate::allocator::Allocator;
use crate::cache::CachingAllocator;
use crate::counters::{Counter, CounterSet};
use crate::envelope::Envelope;
use crate::framework::FrameworkCore;
use crate::mailbox::Mailbox;
use crate::queue::WorkQueue;
use crate::spinlock::NullLock;

// ── Worker context ──────────────────────────────────────────────────────

/// Per-worker scheduling state.
///
/// Cache-line aligned and isolated: the local queue and message cache are
/// touched only by the owning worker; other threads read nothing but the
/// atomic counters and the queue's emptiness peek.
#[repr(align(64))]
pub(crate) struct Context {
    /// Private LIFO of runnable mailboxes. Owner thread only.
    pub(crate) local: WorkQueue,
    /// Per-worker cache of free message blocks. Owner thread only, so the
    /// pools carry the null lock.
    cache: CachingAllocator<NullLock>,
    /// Event counters, summed across workers on query.
    pub(crate) counters: CounterSet,
    /// Whether a worker thread is currently attached to this context.
    pub(crate) running: std::sync::atomic::AtomicBool,
}

// SAFETY: `local` and `cache` are only mutated by the owning worker
// thread; cross-thread access is limited to the atomic counters, the
// atomic `running` flag, and the queue's atomic emptiness peek.
unsafe impl Sync for Context {}
// SAFETY: ownership of the context moves to the worker before it starts.
unsafe impl Send for Context {}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            local: WorkQueue::new(),
            cache: CachingAllocator::default(),
            counters: CounterSet::default(),
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// The worker's message cache as the allocator capability.
    pub(crate) fn cache(&self) -> &dyn Allocator {
        &self.cache
    }

    pub(crate) fn bump(&self, counter: Counter) {
        self.counters.bump(counter);
    }
}

// ── Mailbox drain protocol ──────────────────────────────────────────────

/// Processes one message of `mailbox` on the calling worker.
///
/// The mailbox was popped from a work queue, so it is in no queue now and
/// this worker is its only processor.
pub(crate) fn process_mailbox(core: &FrameworkCore, ctx: &Context, mailbox: &Mailbox) {
    ctx.bump(Counter::MessagesProcessed);

    // Pin the mailbox and read the registered actor and front envelope.
    // Pinning freezes the registration until the dispatch completes, and
    // the single-enqueue invariant keeps other workers away entirely.
    mailbox.lock();
    let envelope = mailbox.front();
    if envelope.is_null() {
        // Benign race: the mailbox was drained through another path.
        mailbox.unlock();
        return;
    }
    // SAFETY: mailbox lock held.
    let actor = unsafe { mailbox.actor() };
    // SAFETY: mailbox lock held.
    unsafe { mailbox.pin() };
    mailbox.unlock();

    // Dispatch with the mailbox unlocked: handlers run user code and may
    // send recursively, including back to this mailbox.
    // SAFETY: the envelope stays front of the queue for the whole
    // dispatch — only this worker pops, and senders only append.
    let envelope_ref = unsafe { &*envelope };
    match actor {
        Some(mut actor) => {
            let mut dispatch_ctx = DispatchContext {
                core,
                worker: ctx,
                address: Address::new(core.index(), mailbox.index()),
            };
            // SAFETY: the pin taken above freezes the registration, so the
            // pointer stays valid (deregistration spins while pinned), and
            // per-mailbox exclusion makes this the only live `&mut`.
            let actor = unsafe { actor.as_mut() };
            let handled = actor.dispatch(&mut dispatch_ctx, envelope_ref)
                || actor.default_handler(&mut dispatch_ctx, envelope_ref);
            if !handled {
                core.fallback().handle(envelope_ref);
            }
        }
        // No actor is registered: the queued message goes to the
        // framework's fallback handler.
        None => core.fallback().handle(envelope_ref),
    }

    // Pop the just-dispatched envelope, release the pin, and re-enqueue
    // the mailbox if messages remain. Locking here and in the send path
    // ensures a non-empty mailbox is always queued somewhere, exactly
    // once.
    mailbox.lock();
    // SAFETY: mailbox lock held; non-empty (the dispatched envelope is
    // still front).
    let popped = unsafe { mailbox.pop() };
    debug_assert!(ptr::eq(popped, envelope));
    // SAFETY: mailbox lock held; pin taken above.
    unsafe { mailbox.unpin() };
    if !mailbox.is_empty() {
        // SAFETY: local queue is owned by this worker; the mailbox is in
        // no other queue.
        unsafe { ctx.local.push_front(ptr::from_ref(mailbox).cast_mut()) };
        ctx.bump(Counter::LocalPushes);
    }
    mailbox.unlock();

    // Destroy only after the pop, so the mailbox never references a dead
    // envelope.
    // SAFETY: popped above; this is the single destruction point for
    // dispatched envelopes.
    unsafe { Envelope::destroy(ctx.cache(), envelope) };
    core.message_retired();
}

// ── Yield strategies ────────────────────────────────────────────────────

/// Idle-policy entry point: one miss step, given the consecutive-miss
/// counter.
pub(crate) type YieldFn = fn(&FrameworkCore, &Context, &mut u32);

fn spin(iterations: u32) {
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
}

/// Escalates from pauses through OS yields to parking on the framework's
/// wait primitive. A shared-queue push notifies one parked worker.
pub(crate) fn yield_polite(core: &FrameworkCore, ctx: &Context, counter: &mut u32) {
    ctx.bump(Counter::Yields);
    *counter = counter.saturating_add(1);
    if *counter < 10 {
        spin(1);
    } else if *counter < 20 {
        spin(50);
    } else if *counter < 22 {
        thread::yield_now();
    } else {
        core.park_worker(ctx);
    }
}

/// Yields the time slice once the spin phases are exhausted; never
/// sleeps.
pub(crate) fn yield_strong(_core: &FrameworkCore, ctx: &Context, counter: &mut u32) {
    ctx.bump(Counter::Yields);
    *counter = counter.saturating_add(1);
    if *counter < 10 {
        spin(1);
    } else if *counter < 20 {
        spin(50);
    } else {
        thread::yield_now();
    }
}

/// Busy-spins with widening pause batches; never yields or sleeps.
pub(crate) fn yield_aggressive(_core: &FrameworkCore, ctx: &Context, counter: &mut u32) {
    ctx.bump(Counter::Yields);
    *counter = counter.saturating_add(1);
    if *counter < 10 {
        spin(1);
    } else if *counter < 20 {
        spin(50);
    } else if *counter < 22 {
        spin(100);
    } else {
        spin(200);
    }
}
