//! Thread-pool lifecycle scenarios.
//!
//! Drives the manager/worker protocol end to end: shrinking under load,
//! growing while messages are in flight, peak tracking, and the counter
//! query surface.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drover::{Actor, Address, Counter, DispatchContext, Envelope, Framework, Parameters};

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Counts every message it receives.
struct Tally {
    hits: Arc<AtomicU32>,
}

impl Actor for Tally {
    fn dispatch(&mut self, _ctx: &mut DispatchContext<'_>, message: &Envelope) -> bool {
        if message.is::<u32>() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }
}

#[test]
fn pool_shrinks_to_lowered_target_after_load() {
    const MESSAGES: u32 = 10_000;

    let fw = Framework::with_parameters(Parameters {
        thread_count: 8,
        ..Default::default()
    });
    assert_eq!(fw.num_threads(), 8);

    let hits = Arc::new(AtomicU32::new(0));
    let mut tally = Tally {
        hits: Arc::clone(&hits),
    };
    // SAFETY: `tally` outlives its deregistration below.
    let address = unsafe {
        fw.register_actor(NonNull::from(&mut tally as &mut dyn Actor), None)
            .expect("mailbox available")
    };

    for i in 0..MESSAGES {
        assert!(fw.send(i, Address::NULL, address));
    }
    fw.set_max_threads(2);

    assert!(
        wait_until(Duration::from_secs(30), || {
            hits.load(Ordering::Relaxed) == MESSAGES
        }),
        "processed only {} of {MESSAGES}",
        hits.load(Ordering::Relaxed)
    );
    assert!(
        wait_until(Duration::from_secs(30), || fw.num_threads() == 2),
        "pool stuck at {} threads",
        fw.num_threads()
    );
    assert!(fw.peak_threads() >= 8);

    assert!(fw.deregister_actor(address));
}

#[test]
fn pool_grows_to_raised_target_with_messages_in_flight() {
    const MESSAGES: u32 = 100_000;

    let fw = Framework::with_parameters(Parameters {
        thread_count: 1,
        ..Default::default()
    });
    assert_eq!(fw.num_threads(), 1);

    let hits = Arc::new(AtomicU32::new(0));
    let mut tally = Tally {
        hits: Arc::clone(&hits),
    };
    // SAFETY: `tally` outlives its deregistration below.
    let address = unsafe {
        fw.register_actor(NonNull::from(&mut tally as &mut dyn Actor), None)
            .expect("mailbox available")
    };

    for i in 0..MESSAGES {
        assert!(fw.send(i, Address::NULL, address));
        if i == MESSAGES / 2 {
            fw.set_min_threads(16);
        }
    }

    assert!(
        wait_until(Duration::from_secs(60), || fw.num_threads() == 16),
        "pool stuck at {} threads",
        fw.num_threads()
    );
    // Every message processed, none duplicated.
    assert!(
        wait_until(Duration::from_secs(60), || {
            hits.load(Ordering::Relaxed) == MESSAGES
        }),
        "processed {} of {MESSAGES}",
        hits.load(Ordering::Relaxed)
    );
    assert!(fw.peak_threads() >= 16);

    assert!(fw.deregister_actor(address));
}

#[test]
fn counters_track_processing_and_reset() {
    const MESSAGES: u32 = 500;

    let fw = Framework::with_parameters(Parameters {
        thread_count: 4,
        ..Default::default()
    });

    let hits = Arc::new(AtomicU32::new(0));
    let mut tally = Tally {
        hits: Arc::clone(&hits),
    };
    // SAFETY: `tally` outlives its deregistration below.
    let address = unsafe {
        fw.register_actor(NonNull::from(&mut tally as &mut dyn Actor), None)
            .expect("mailbox available")
    };

    for i in 0..MESSAGES {
        assert!(fw.send(i, Address::NULL, address));
    }
    assert!(wait_until(Duration::from_secs(30), || {
        hits.load(Ordering::Relaxed) == MESSAGES
    }));

    // One visit per dispatched message, at minimum.
    assert!(fw.counter_value(Counter::MessagesProcessed) >= MESSAGES);
    // Every processed message was popped from one of the queues.
    let pops =
        fw.counter_value(Counter::LocalPops) + fw.counter_value(Counter::SharedPops);
    assert!(pops >= MESSAGES);
    // External sends schedule through the shared queue: at least the
    // first send found the mailbox empty and pushed it there.
    assert!(fw.counter_value(Counter::SharedPushes) >= 1);

    // Per-thread query covers at most the running workers.
    let mut per_thread = [0u32; 32];
    let reported = fw.per_thread_counter_values(Counter::MessagesProcessed, &mut per_thread);
    assert!(reported <= fw.num_threads() as usize);
    let sum: u32 = per_thread[..reported].iter().sum();
    assert!(sum <= fw.counter_value(Counter::MessagesProcessed));

    fw.reset_counters();
    assert_eq!(fw.counter_value(Counter::MessagesProcessed), 0);
    assert_eq!(fw.counter_value(Counter::SharedPops), 0);
    assert_eq!(fw.counter_value(Counter::SharedPushes), 0);

    assert!(fw.deregister_actor(address));
}

#[test]
fn retired_worker_counters_survive_shrink() {
    const MESSAGES: u32 = 2_000;

    let fw = Framework::with_parameters(Parameters {
        thread_count: 4,
        ..Default::default()
    });

    let hits = Arc::new(AtomicU32::new(0));
    let mut tally = Tally {
        hits: Arc::clone(&hits),
    };
    // SAFETY: `tally` outlives its deregistration below.
    let address = unsafe {
        fw.register_actor(NonNull::from(&mut tally as &mut dyn Actor), None)
            .expect("mailbox available")
    };

    for i in 0..MESSAGES {
        assert!(fw.send(i, Address::NULL, address));
    }
    assert!(wait_until(Duration::from_secs(30), || {
        hits.load(Ordering::Relaxed) == MESSAGES
    }));
    let processed_before = fw.counter_value(Counter::MessagesProcessed);

    fw.set_max_threads(1);
    assert!(wait_until(Duration::from_secs(30), || fw.num_threads() == 1));

    // Aggregation includes retired contexts: nothing was lost.
    assert!(fw.counter_value(Counter::MessagesProcessed) >= processed_before);

    assert!(fw.deregister_actor(address));
}
