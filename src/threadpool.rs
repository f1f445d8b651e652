//! Worker thread lifecycle.
//!
//! Workers are spawned by the framework's manager thread, each bound to a
//! heap-pinned [`Context`]. A worker loops over its scheduling points —
//! local pop, shared pop, idle policy — and self-retires the moment the
//! pool is over target; the manager joins retired threads lazily and
//! re-uses their contexts when the pool grows again, so event counters
//! survive shrink/grow cycles.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::counters::Counter;
use crate::framework::FrameworkCore;
use crate::processor::{self, Context};

/// A worker slot owned by the framework: the context plus the thread
/// currently attached to it, if any.
pub(crate) struct WorkerSlot {
    /// Heap-pinned so the worker thread can hold a stable pointer.
    pub(crate) ctx: Box<Context>,
    /// Join handle of the attached thread. Manager thread only.
    pub(crate) handle: Option<JoinHandle<()>>,
}

/// Stable context pointer handed to the worker thread.
struct ContextPtr(*const Context);
// SAFETY: the context is heap-pinned and outlives the worker thread (the
// framework joins all workers before dropping its slots).
unsafe impl Send for ContextPtr {}

/// Spawns a worker thread attached to `slot`'s context.
///
/// Returns `false` if thread creation failed. The caller must have
/// verified that no thread is currently attached (`handle.is_none()` and
/// `ctx.running` false).
pub(crate) fn spawn_worker(core: &Arc<FrameworkCore>, slot: &mut WorkerSlot, id: usize) -> bool {
    debug_assert!(slot.handle.is_none());
    slot.ctx.running.store(true, Ordering::Release);

    let core = Arc::clone(core);
    let ctx = ContextPtr(&raw const *slot.ctx);
    let spawned = std::thread::Builder::new()
        .name(format!("drover-worker-{id}"))
        .spawn(move || {
            let ctx = ctx;
            // SAFETY: the context outlives the thread, see `ContextPtr`.
            worker_entry(&core, unsafe { &*ctx.0 });
        });

    match spawned {
        Ok(handle) => {
            slot.handle = Some(handle);
            true
        }
        Err(error) => {
            slot.ctx.running.store(false, Ordering::Release);
            tracing::warn!(%error, "failed to spawn worker thread");
            false
        }
    }
}

/// Main loop executed by each worker thread.
fn worker_entry(core: &Arc<FrameworkCore>, ctx: &Context) {
    set_thread_affinity(core.node_mask(), core.processor_mask());
    tracing::debug!(framework = core.index(), "worker started");

    let yield_fn = core.yield_fn();
    let mut backoff = 0u32;

    loop {
        // Retirement check at every scheduling point: when the pool is
        // over target this worker bows out and the manager reaps it.
        if try_retire(core) {
            break;
        }

        // 1. Local LIFO.
        // SAFETY: the local queue is owned by this thread.
        let mailbox = unsafe { ctx.local.pop_front() };
        if !mailbox.is_null() {
            ctx.bump(Counter::LocalPops);
            // SAFETY: queued mailboxes live in the directory, which
            // outlives the workers.
            processor::process_mailbox(core, ctx, unsafe { &*mailbox });
            backoff = 0;
            continue;
        }

        // 2. Shared FIFO: peek without the lock, then pop under it.
        if !core.shared_is_empty() {
            let mailbox = core.pop_shared();
            if !mailbox.is_null() {
                ctx.bump(Counter::SharedPops);
                // SAFETY: as above.
                processor::process_mailbox(core, ctx, unsafe { &*mailbox });
                backoff = 0;
                continue;
            }
        }

        // 3. Nothing runnable: idle per the configured strategy.
        yield_fn(core, ctx, &mut backoff);
    }

    ctx.running.store(false, Ordering::Release);
    tracing::debug!(framework = core.index(), "worker retired");
}

/// Decides whether this worker should exit: the thread count is driven
/// down by the workers themselves whenever it exceeds the target.
fn try_retire(core: &FrameworkCore) -> bool {
    let target = core.target_threads();
    let mut count = core.thread_count_raw().load(Ordering::Acquire);
    while count > target {
        match core.thread_count_raw().compare_exchange(
            count,
            count - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => count = actual,
        }
    }
    false
}

// ── Thread affinity ─────────────────────────────────────────────────────

/// Best-effort CPU affinity for a worker thread.
///
/// The processor mask is applied with `sched_setaffinity` when it
/// restricts anything; the node mask is advisory and not interpreted
/// beyond that. Failure is ignored — affinity never affects correctness.
#[cfg(target_os = "linux")]
pub(crate) fn set_thread_affinity(_node_mask: u32, processor_mask: u32) {
    if processor_mask == u32::MAX || processor_mask == 0 {
        return;
    }
    // SAFETY: a zeroed cpu_set_t is a valid empty set; CPU_SET writes
    // within its bounds for cpu < CPU_SETSIZE.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..32 {
            if processor_mask & (1 << cpu) != 0 {
                libc::CPU_SET(cpu as usize, &mut set);
            }
        }
        let _ = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_thread_affinity(_node_mask: u32, _processor_mask: u32) {}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_starts_not_running() {
        let slot = WorkerSlot {
            ctx: Box::new(Context::new()),
            handle: None,
        };
        assert!(!slot.ctx.running.load(Ordering::Acquire));
        assert!(slot.handle.is_none());
    }

    #[test]
    fn affinity_with_full_mask_is_noop() {
        // Must not panic or restrict anything.
        set_thread_affinity(0x1, u32::MAX);
        set_thread_affinity(0x1, 0);
    }
}
