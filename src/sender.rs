//! Message delivery: resolve the target mailbox, enqueue, wake.
//!
//! `send` owns the envelope it is given and guarantees it ends up in
//! exactly one of three places: a mailbox FIFO (delivered), an endpoint
//! (routed out of process), or destroyed after one fallback invocation
//! (unroutable). A `true` return means delivered to a mailbox, not
//! handled.

use crate::address::Address;
use crate::envelope::Envelope;
use crate::framework::FrameworkCore;
use crate::mailbox::Mailbox;
use crate::processor::Context;
use crate::registry;

/// Transport capability for addresses outside this process.
///
/// Consulted only when a target framework index is not registered in the
/// local process. On a `true` return the runtime destroys the envelope
/// after the call — the endpoint must have serialized whatever it needs.
pub trait NetworkEndpoint: Send + Sync {
    /// Routes an envelope towards a remote framework.
    ///
    /// Returns `true` if the message was accepted for remote delivery.
    fn route(&self, message: &Envelope, to: Address) -> bool;
}

/// Delivers `envelope` to `to`, consuming it.
///
/// `worker` is the calling worker's context when the send originates on a
/// worker thread of `core`'s framework; scheduling then prefers that
/// worker's local queue.
pub(crate) fn send(
    core: &FrameworkCore,
    worker: Option<&Context>,
    envelope: *mut Envelope,
    to: Address,
) -> bool {
    debug_assert!(!envelope.is_null());

    if to.framework_index() == core.index() {
        return deliver_local(core, worker, envelope, to);
    }

    // The target lives in another framework of this process: hand the
    // envelope over through the registry. The upgraded Arc keeps the
    // target core alive for the duration of the handoff.
    if let Some(target) = registry::lookup(to.framework_index()) {
        return deliver_local(&target, None, envelope, to);
    }

    // Not in this process: try the endpoint, if one is attached.
    if let Some(endpoint) = core.endpoint() {
        // SAFETY: the envelope is live and exclusively owned here.
        let routed = endpoint.route(unsafe { &*envelope }, to);
        if routed {
            // SAFETY: ownership retained; destroyed exactly once.
            unsafe { Envelope::destroy(cache_for(core, worker), envelope) };
            return true;
        }
    }

    undeliverable(core, worker, envelope);
    false
}

/// Pushes `envelope` into a mailbox of `core`'s own directory and
/// schedules the mailbox if it just became non-empty.
pub(crate) fn deliver_local(
    core: &FrameworkCore,
    worker: Option<&Context>,
    envelope: *mut Envelope,
    to: Address,
) -> bool {
    let Some(mailbox) = core.directory().lookup(to.mailbox_index()) else {
        undeliverable(core, worker, envelope);
        return false;
    };

    mailbox.lock();
    let schedule = mailbox.is_empty();
    // Counted before the push so the teardown drain can never miss a
    // just-delivered envelope.
    core.message_queued();
    // SAFETY: mailbox lock held; the envelope is exclusively owned and
    // unlinked.
    unsafe { mailbox.push(envelope) };
    if schedule {
        // Empty → non-empty: the mailbox is in no queue, enqueue it. Done
        // under the mailbox lock so the single-enqueue invariant holds.
        schedule_mailbox(core, worker, mailbox);
    }
    mailbox.unlock();
    true
}

fn schedule_mailbox(core: &FrameworkCore, worker: Option<&Context>, mailbox: &Mailbox) {
    let mailbox = std::ptr::from_ref(mailbox).cast_mut();
    match worker {
        Some(ctx) => {
            // The local queue is only ever touched by the owning worker.
            // SAFETY: `worker` is the calling thread's own context.
            unsafe { ctx.local.push_front(mailbox) };
            ctx.bump(crate::counters::Counter::LocalPushes);
        }
        None => {
            core.push_shared(mailbox);
            // One parked worker is enough: the mailbox carries one
            // runnable unit of work.
            core.notify_one();
        }
    }
}

/// Fallback plus destruction for an envelope that cannot be delivered.
fn undeliverable(core: &FrameworkCore, worker: Option<&Context>, envelope: *mut Envelope) {
    // SAFETY: the envelope is live and exclusively owned here.
    unsafe {
        core.fallback().handle(&*envelope);
        Envelope::destroy(cache_for(core, worker), envelope);
    }
}

fn cache_for<'a>(
    core: &'a FrameworkCore,
    worker: Option<&'a Context>,
) -> &'a dyn crate::allocator::Allocator {
    worker.map_or_else(|| core.cache(), Context::cache)
}
