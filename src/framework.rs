//! Framework: hosts mailboxes, the worker pool, and the manager thread.
//!
//! A [`Framework`] owns a mailbox [`Directory`], a shared work queue, a
//! framework-wide message cache, and a pool of worker threads driven
//! towards a single target count by a dedicated manager thread. Actors
//! registered with the framework run their handlers on its workers and
//! nowhere else.
//!
//! # Lifecycle
//!
//! Construction registers the framework in the process-wide registry
//! (assigning its non-zero index), starts the manager, and waits for the
//! initial worker complement. Drop is teardown: the framework waits for
//! every delivered message to finish, drives the thread target to zero,
//! wakes workers until they have all retired, then stops and joins the
//! manager. Actors must be deregistered (and outlive their
//! deregistration) before the framework is dropped.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::actor::Actor;
use crate::address::Address;
use crate::allocator::Allocator;
use crate::cache::CachingAllocator;
use crate::counters::Counter;
use crate::directory::Directory;
use crate::envelope::Envelope;
use crate::fallback::FallbackHandlerCollection;
use crate::mailbox::Mailbox;
use crate::processor::{self, Context, YieldFn};
use crate::queue::WorkQueue;
use crate::registry;
use crate::sender::{self, NetworkEndpoint};
use crate::spinlock::{self, SpinLock};
use crate::threadpool::{self, WorkerSlot};

/// Park timeout — idle and manager threads recheck their conditions at
/// this interval, which also bounds convergence after a target change.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

// ── Configuration ───────────────────────────────────────────────────────

/// What an idle worker does when it finds no runnable mailbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum YieldStrategy {
    /// Escalate to parking on a wait primitive; lowest CPU use, small
    /// wake latency.
    #[default]
    Polite,
    /// Yield the time slice but never sleep.
    Strong,
    /// Busy-spin; lowest latency, a core per worker.
    Aggressive,
}

/// Framework construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct Parameters {
    /// Initial worker-thread target.
    pub thread_count: u32,
    /// Advisory NUMA node affinity bitset.
    pub node_mask: u32,
    /// Advisory CPU affinity bitset within the selected nodes.
    pub processor_mask: u32,
    /// Idle policy for the worker threads.
    pub yield_strategy: YieldStrategy,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            thread_count: 16,
            node_mask: 0x1,
            processor_mask: u32::MAX,
            yield_strategy: YieldStrategy::Polite,
        }
    }
}

/// Failure to register an actor.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// The mailbox directory has no free slots left.
    #[error("mailbox directory is full")]
    DirectoryFull,
}

// ── Shared core ─────────────────────────────────────────────────────────

/// State shared between the framework handle, the manager, and the
/// workers. Heap-pinned behind an `Arc` so worker contexts can hold
/// plain references for the framework's lifetime.
pub(crate) struct FrameworkCore {
    params: Parameters,
    /// Non-zero process-unique index, set right after registration.
    index: AtomicU32,
    mailboxes: Directory,
    fallback: FallbackHandlerCollection,
    /// Framework-wide message cache used by non-worker senders.
    message_cache: CachingAllocator<SpinLock>,
    shared_lock: SpinLock,
    shared_queue: WorkQueue,
    yield_fn: YieldFn,
    /// Wait primitive for politely idling workers.
    sleep_mutex: Mutex<()>,
    sleep_cond: Condvar,
    /// Manager parking: flag plus condvar so nudges are never lost.
    manager_mutex: Mutex<bool>,
    manager_cond: Condvar,
    running: AtomicBool,
    target_threads: AtomicU32,
    thread_count: AtomicU32,
    peak_threads: AtomicU32,
    /// Shared-queue pushes. Counted here because they originate from
    /// non-worker senders, which have no per-worker counter block.
    shared_pushes: AtomicU32,
    /// Envelopes delivered to mailboxes but not yet destroyed. Zero means
    /// the queues are drained and nothing is mid-dispatch.
    pending_messages: AtomicUsize,
    /// Worker slots; retired contexts are retained so their counters
    /// survive pool shrink and their allocations are reused on growth.
    workers: Mutex<Vec<WorkerSlot>>,
    endpoint: Option<Box<dyn NetworkEndpoint>>,
}

impl FrameworkCore {
    pub(crate) fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.mailboxes
    }

    pub(crate) fn fallback(&self) -> &FallbackHandlerCollection {
        &self.fallback
    }

    pub(crate) fn cache(&self) -> &dyn Allocator {
        &self.message_cache
    }

    pub(crate) fn endpoint(&self) -> Option<&dyn NetworkEndpoint> {
        self.endpoint.as_deref()
    }

    pub(crate) fn yield_fn(&self) -> YieldFn {
        self.yield_fn
    }

    pub(crate) fn node_mask(&self) -> u32 {
        self.params.node_mask
    }

    pub(crate) fn processor_mask(&self) -> u32 {
        self.params.processor_mask
    }

    pub(crate) fn target_threads(&self) -> u32 {
        self.target_threads.load(Ordering::Acquire)
    }

    pub(crate) fn thread_count_raw(&self) -> &AtomicU32 {
        &self.thread_count
    }

    // ── Shared queue ────────────────────────────────────────────────────

    pub(crate) fn shared_is_empty(&self) -> bool {
        self.shared_queue.is_empty()
    }

    pub(crate) fn push_shared(&self, mailbox: *mut Mailbox) {
        self.shared_lock.lock();
        // SAFETY: shared-queue spinlock held; the mailbox is in no queue.
        unsafe { self.shared_queue.push_back(mailbox) };
        self.shared_lock.unlock();
        self.shared_pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pop_shared(&self) -> *mut Mailbox {
        self.shared_lock.lock();
        // SAFETY: shared-queue spinlock held.
        let mailbox = unsafe { self.shared_queue.pop_front() };
        self.shared_lock.unlock();
        mailbox
    }

    // ── Message accounting ──────────────────────────────────────────────

    /// Records an envelope successfully pushed into one of this
    /// framework's mailboxes.
    pub(crate) fn message_queued(&self) {
        self.pending_messages.fetch_add(1, Ordering::AcqRel);
    }

    /// Records the destruction of a previously queued envelope.
    pub(crate) fn message_retired(&self) {
        let previous = self.pending_messages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "message accounting underflow");
    }

    /// True when no delivered message is queued or mid-dispatch.
    pub(crate) fn queues_empty(&self) -> bool {
        self.pending_messages.load(Ordering::Acquire) == 0 && self.shared_queue.is_empty()
    }

    // ── Worker parking ──────────────────────────────────────────────────

    /// Parks the calling worker until notified or `PARK_TIMEOUT` elapses.
    ///
    /// The shared queue is rechecked under the sleep mutex, so a
    /// notification racing with the decision to park is never lost: the
    /// notifier takes the same mutex before signalling.
    pub(crate) fn park_worker(&self, ctx: &Context) {
        let guard = lock_ignore_poison(&self.sleep_mutex);
        if !self.shared_queue.is_empty()
            || !self.running.load(Ordering::Acquire)
            || self.thread_count.load(Ordering::Acquire) > self.target_threads()
        {
            return;
        }
        let result = self.sleep_cond.wait_timeout(guard, PARK_TIMEOUT);
        let timed_out = match result {
            Ok((_, wait)) => wait.timed_out(),
            Err(_) => true,
        };
        if !timed_out {
            ctx.bump(Counter::Wakeups);
        }
    }

    /// Wakes one parked worker. No-op when no worker parks (the Strong
    /// and Aggressive strategies never sleep).
    pub(crate) fn notify_one(&self) {
        if self.params.yield_strategy == YieldStrategy::Polite {
            let _guard = lock_ignore_poison(&self.sleep_mutex);
            self.sleep_cond.notify_one();
        }
    }

    fn notify_all(&self) {
        let _guard = lock_ignore_poison(&self.sleep_mutex);
        self.sleep_cond.notify_all();
    }

    // ── Manager parking ─────────────────────────────────────────────────

    fn manager_park(&self) {
        let mut nudged = lock_ignore_poison(&self.manager_mutex);
        if !*nudged {
            if let Ok((guard, _)) = self.manager_cond.wait_timeout(nudged, PARK_TIMEOUT) {
                nudged = guard;
            } else {
                return;
            }
        }
        *nudged = false;
    }

    fn wake_manager(&self) {
        let mut nudged = lock_ignore_poison(&self.manager_mutex);
        *nudged = true;
        self.manager_cond.notify_one();
    }

    pub(crate) fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        lock_ignore_poison(&self.workers)
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Manager thread ──────────────────────────────────────────────────────

/// Grows the pool towards the target and lazily joins retired workers.
/// Shrinking is cooperative: over-target workers retire themselves at
/// their next scheduling point.
fn manager_proc(core: &Arc<FrameworkCore>) {
    tracing::debug!(framework = core.index(), "manager started");

    loop {
        {
            let mut workers = core.lock_workers();

            // Join threads that have already retired.
            for slot in workers.iter_mut() {
                if slot.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                    if let Some(handle) = slot.handle.take() {
                        let _ = handle.join();
                    }
                }
            }

            // Spawn workers while the pool is under target, re-using
            // retired contexts first.
            while core.thread_count.load(Ordering::Acquire) < core.target_threads() {
                let reusable = workers
                    .iter()
                    .position(|slot| slot.handle.is_none() && !slot.ctx.running.load(Ordering::Acquire));
                let slot_index = match reusable {
                    Some(index) => index,
                    None => {
                        workers.push(WorkerSlot {
                            ctx: Box::new(Context::new()),
                            handle: None,
                        });
                        workers.len() - 1
                    }
                };
                if !threadpool::spawn_worker(core, &mut workers[slot_index], slot_index) {
                    break;
                }
                let count = core.thread_count.fetch_add(1, Ordering::AcqRel) + 1;
                core.peak_threads.fetch_max(count, Ordering::AcqRel);
            }
        }

        if !core.running.load(Ordering::Acquire) {
            break;
        }
        core.manager_park();
    }

    // Final reap: the target is zero and every worker has retired.
    let mut workers = core.lock_workers();
    for slot in workers.iter_mut() {
        if let Some(handle) = slot.handle.take() {
            let _ = handle.join();
        }
    }
    tracing::debug!(framework = core.index(), "manager stopped");
}

// ── Framework ───────────────────────────────────────────────────────────

/// Hosts, schedules, and executes actors.
pub struct Framework {
    core: Arc<FrameworkCore>,
    manager: Option<JoinHandle<()>>,
}

impl Framework {
    /// Creates a framework with default [`Parameters`].
    #[must_use]
    pub fn new() -> Self {
        Self::build(Parameters::default(), None)
    }

    /// Creates a framework with explicit parameters.
    #[must_use]
    pub fn with_parameters(params: Parameters) -> Self {
        Self::build(params, None)
    }

    /// Creates a framework tied to a network endpoint, enabling delivery
    /// to addresses outside this process.
    #[must_use]
    pub fn with_endpoint(params: Parameters, endpoint: Box<dyn NetworkEndpoint>) -> Self {
        Self::build(params, Some(endpoint))
    }

    fn build(params: Parameters, endpoint: Option<Box<dyn NetworkEndpoint>>) -> Self {
        let yield_fn: YieldFn = match params.yield_strategy {
            YieldStrategy::Polite => processor::yield_polite,
            YieldStrategy::Strong => processor::yield_strong,
            YieldStrategy::Aggressive => processor::yield_aggressive,
        };

        let core = Arc::new(FrameworkCore {
            params,
            index: AtomicU32::new(0),
            mailboxes: Directory::new(),
            fallback: FallbackHandlerCollection::new(),
            message_cache: CachingAllocator::default(),
            shared_lock: SpinLock::new(),
            shared_queue: WorkQueue::new(),
            yield_fn,
            sleep_mutex: Mutex::new(()),
            sleep_cond: Condvar::new(),
            manager_mutex: Mutex::new(false),
            manager_cond: Condvar::new(),
            running: AtomicBool::new(true),
            target_threads: AtomicU32::new(params.thread_count),
            thread_count: AtomicU32::new(0),
            peak_threads: AtomicU32::new(0),
            shared_pushes: AtomicU32::new(0),
            pending_messages: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            endpoint,
        });

        let index = registry::register(&core);
        core.index.store(index, Ordering::Release);

        let manager_core = Arc::clone(&core);
        let manager = std::thread::Builder::new()
            .name("drover-manager".into())
            .spawn(move || manager_proc(&manager_core))
            .expect("failed to spawn manager thread");

        // Wait for the initial worker complement before handing the
        // framework to the caller.
        let mut step = 0;
        while core.thread_count.load(Ordering::Acquire) < core.target_threads() {
            spinlock::backoff(&mut step);
        }

        tracing::debug!(framework = index, threads = params.thread_count, "framework started");
        Self {
            core,
            manager: Some(manager),
        }
    }

    /// This framework's non-zero, process-unique index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.core.index()
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Sends `value` from `from` to the entity at `to`.
    ///
    /// Returns `true` if the message was delivered to a mailbox — not
    /// necessarily handled. Returns `false` on allocation failure or when
    /// the address resolves nowhere, in which case the fallback handler
    /// has been invoked.
    ///
    /// Used for sends from non-actor code; handlers send through their
    /// [`DispatchContext`](crate::actor::DispatchContext) instead, which
    /// schedules onto the calling worker.
    pub fn send<T: Send + 'static>(&self, value: T, from: Address, to: Address) -> bool {
        let envelope = Envelope::create(self.core.cache(), value, from);
        if envelope.is_null() {
            return false;
        }
        sender::send(&self.core, None, envelope, to)
    }

    // ── Actor registration ──────────────────────────────────────────────

    /// Registers an actor, claiming a mailbox and returning its address.
    ///
    /// The runtime stores the pointer; it never owns the actor.
    ///
    /// # Errors
    ///
    /// [`RegisterError::DirectoryFull`] when no mailbox slot is free.
    ///
    /// # Safety
    ///
    /// `actor` must stay valid and otherwise untouched until a matching
    /// [`Framework::deregister_actor`] call returns. The framework must
    /// outlive the registration.
    pub unsafe fn register_actor<'a>(
        &self,
        actor: NonNull<dyn Actor + 'a>,
        name: Option<&str>,
    ) -> Result<Address, RegisterError> {
        let (index, mailbox) = self
            .core
            .mailboxes
            .allocate()
            .ok_or(RegisterError::DirectoryFull)?;

        mailbox.lock();
        // SAFETY: mailbox lock held; the slot is fresh or fully recycled
        // (drained, vacant, unpinned), and the caller guarantees the
        // actor's validity. The lifetime erasure below mirrors the raw
        // `Actor*` this is modeled on: validity is caller-managed via the
        // unsafe contract, not tracked by the borrow checker.
        unsafe {
            let actor: NonNull<dyn Actor> = std::mem::transmute(actor);
            mailbox.set_name(name.map(Into::into));
            let registered = mailbox.register_actor(actor);
            debug_assert!(registered, "allocated mailbox was not registrable");
        }
        mailbox.unlock();

        Ok(Address::new(self.core.index(), index))
    }

    /// Deregisters the actor at `address`, blocking while its mailbox is
    /// pinned by an in-progress dispatch. After this returns the runtime
    /// holds no reference to the actor.
    ///
    /// Messages still queued at the mailbox are delivered to the fallback
    /// handler by the worker pool.
    pub fn deregister_actor(&self, address: Address) -> bool {
        debug_assert_eq!(address.framework_index(), self.core.index());
        let Some(mailbox) = self.core.mailboxes.lookup(address.mailbox_index()) else {
            return false;
        };

        let mut step = 0;
        loop {
            mailbox.lock();
            if !mailbox.is_pinned() {
                // SAFETY: mailbox lock held and unpinned.
                let deregistered = unsafe {
                    let deregistered = mailbox.deregister_actor();
                    mailbox.set_name(None);
                    deregistered
                };
                mailbox.unlock();
                if deregistered {
                    self.core.mailboxes.free(address.mailbox_index());
                }
                return deregistered;
            }
            mailbox.unlock();
            spinlock::backoff(&mut step);
        }
    }

    /// The name the actor at `address` was registered under, if any.
    #[must_use]
    pub fn address_name(&self, address: Address) -> Option<String> {
        let mailbox = self.core.mailboxes.lookup(address.mailbox_index())?;
        mailbox.lock();
        // SAFETY: mailbox lock held.
        let name = unsafe { mailbox.name() };
        mailbox.unlock();
        name
    }

    // ── Fallback handlers ───────────────────────────────────────────────

    /// Installs an address-only fallback handler, replacing any previous
    /// handler of either shape.
    pub fn set_fallback_handler<F>(&self, handler: F)
    where
        F: Fn(Address) + Send + Sync + 'static,
    {
        self.core.fallback.set_address_handler(Box::new(handler));
    }

    /// Installs a blind fallback handler (payload pointer, size, origin),
    /// replacing any previous handler of either shape.
    pub fn set_blind_fallback_handler<F>(&self, handler: F)
    where
        F: Fn(*const u8, usize, Address) + Send + Sync + 'static,
    {
        self.core.fallback.set_blind_handler(Box::new(handler));
    }

    // ── Thread-pool control ─────────────────────────────────────────────

    /// Raises the worker target to at least `count` and wakes the
    /// manager. Never reduces the target.
    pub fn set_min_threads(&self, count: u32) {
        self.core.target_threads.fetch_max(count, Ordering::AcqRel);
        self.core.wake_manager();
    }

    /// Lowers the worker target to at most `count`. Never raises the
    /// target; surplus workers retire at their next scheduling point.
    pub fn set_max_threads(&self, count: u32) {
        self.core.target_threads.fetch_min(count, Ordering::AcqRel);
    }

    /// Current thread target. Min and max collapse to the single target
    /// negotiated by [`Framework::set_min_threads`] and
    /// [`Framework::set_max_threads`].
    #[must_use]
    pub fn min_threads(&self) -> u32 {
        self.core.target_threads()
    }

    /// Current thread target; see [`Framework::min_threads`].
    #[must_use]
    pub fn max_threads(&self) -> u32 {
        self.core.target_threads()
    }

    /// Actual number of live worker threads.
    #[must_use]
    pub fn num_threads(&self) -> u32 {
        self.core.thread_count.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously live workers seen so far.
    #[must_use]
    pub fn peak_threads(&self) -> u32 {
        self.core.peak_threads.load(Ordering::Acquire)
    }

    // ── Counters ────────────────────────────────────────────────────────

    /// Zeroes every counter: the per-worker blocks and the framework-wide
    /// shared-push count.
    pub fn reset_counters(&self) {
        for slot in self.core.lock_workers().iter() {
            slot.ctx.counters.reset();
        }
        self.core.shared_pushes.store(0, Ordering::Relaxed);
    }

    /// Value of `counter` aggregated over all workers, including retired
    /// ones. Shared-queue pushes happen on non-worker sends, so that kind
    /// also folds in the framework-wide count.
    #[must_use]
    pub fn counter_value(&self, counter: Counter) -> u32 {
        let per_worker: u32 = self
            .core
            .lock_workers()
            .iter()
            .map(|slot| slot.ctx.counters.value(counter))
            .sum();
        if counter == Counter::SharedPushes {
            per_worker + self.core.shared_pushes.load(Ordering::Relaxed)
        } else {
            per_worker
        }
    }

    /// Per-worker values of `counter` for currently running workers.
    ///
    /// Fills `out` in slot order and returns the number of values
    /// written. [`Counter::SharedPushes`] is tracked framework-wide, not
    /// per worker, so it reports zero here; query it through
    /// [`Framework::counter_value`].
    pub fn per_thread_counter_values(&self, counter: Counter, out: &mut [u32]) -> usize {
        let workers = self.core.lock_workers();
        let mut written = 0;
        for slot in workers.iter() {
            if written == out.len() {
                break;
            }
            if slot.ctx.running.load(Ordering::Acquire) {
                out[written] = slot.ctx.counters.value(counter);
                written += 1;
            }
        }
        written
    }
}

impl Default for Framework {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Framework {
    /// Tears the framework down: deregisters it, waits for delivered
    /// messages to drain, retires the workers, and joins the manager.
    ///
    /// Blocks until any in-progress handler returns. Actors must have
    /// been deregistered; dropping a framework with live registrations is
    /// a contract violation.
    fn drop(&mut self) {
        let index = self.core.index();
        tracing::debug!(framework = index, "framework shutting down");
        registry::deregister(index);

        // Wait for every delivered message to be dispatched or fall back.
        let mut step = 0;
        while !self.core.queues_empty() {
            spinlock::backoff(&mut step);
        }

        // Drive the pool to zero; workers retire at their next scheduling
        // point, parked ones are notified until none remain.
        self.core.target_threads.store(0, Ordering::Release);
        let mut step = 0;
        while self.core.thread_count.load(Ordering::Acquire) > 0 {
            self.core.notify_all();
            spinlock::backoff(&mut step);
        }

        self.core.running.store(false, Ordering::Release);
        self.core.wake_manager();
        if let Some(manager) = self.manager.take() {
            let _ = manager.join();
        }
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("index", &self.core.index())
            .field("threads", &self.num_threads())
            .field("target", &self.core.target_threads())
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
