//! Process-wide framework registry.
//!
//! Assigns each framework its non-zero, process-unique index and resolves
//! indices back to live frameworks for in-process cross-framework
//! delivery. Entries are weak: a framework being torn down stops
//! resolving as soon as it deregisters, and a racing delivery that has
//! already upgraded its entry keeps the core alive until the handoff
//! completes.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::framework::FrameworkCore;

type Slots = Mutex<Vec<Option<Weak<FrameworkCore>>>>;

static REGISTRY: OnceLock<Slots> = OnceLock::new();

fn slots() -> &'static Slots {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

fn lock() -> std::sync::MutexGuard<'static, Vec<Option<Weak<FrameworkCore>>>> {
    match slots().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registers a framework and returns its 1-based index.
///
/// Vacant slots left by deregistered frameworks are reused, lowest
/// index first.
pub(crate) fn register(core: &Arc<FrameworkCore>) -> u32 {
    let mut slots = lock();
    let weak = Arc::downgrade(core);
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(weak);
            return i as u32 + 1;
        }
    }
    slots.push(Some(weak));
    slots.len() as u32
}

/// Clears a previously registered index.
pub(crate) fn deregister(index: u32) {
    debug_assert!(index != 0);
    let mut slots = lock();
    if let Some(slot) = slots.get_mut(index as usize - 1) {
        *slot = None;
    }
}

/// Resolves an index to a live framework, if one is registered.
pub(crate) fn lookup(index: u32) -> Option<Arc<FrameworkCore>> {
    if index == 0 {
        return None;
    }
    let slots = lock();
    slots
        .get(index as usize - 1)?
        .as_ref()
        .and_then(Weak::upgrade)
}
