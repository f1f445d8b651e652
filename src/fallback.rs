//! Fallback handlers for undelivered and unhandled messages.
//!
//! A framework carries exactly one fallback handler in one of two shapes:
//! address-only, or "blind" (raw payload bytes plus originator address).
//! Setting either shape replaces the other. The default handler,
//! installed at framework creation, records an error-level diagnostic —
//! an unhandled message is almost always a programming error.

use std::sync::RwLock;

use crate::address::Address;
use crate::envelope::Envelope;

type AddressHandler = Box<dyn Fn(Address) + Send + Sync>;
type BlindHandler = Box<dyn Fn(*const u8, usize, Address) + Send + Sync>;

enum Handler {
    Address(AddressHandler),
    Blind(BlindHandler),
}

/// The framework's registered fallback handler.
pub(crate) struct FallbackHandlerCollection {
    handler: RwLock<Handler>,
}

impl FallbackHandlerCollection {
    /// Creates the collection with the default diagnostic handler.
    pub(crate) fn new() -> Self {
        Self {
            handler: RwLock::new(Handler::Blind(Box::new(|_, size, from| {
                tracing::error!(%from, size, "message undelivered or unhandled");
            }))),
        }
    }

    /// Installs an address-only handler, replacing any previous handler.
    pub(crate) fn set_address_handler(&self, handler: AddressHandler) {
        *self.write() = Handler::Address(handler);
    }

    /// Installs a blind handler, replacing any previous handler.
    pub(crate) fn set_blind_handler(&self, handler: BlindHandler) {
        *self.write() = Handler::Blind(handler);
    }

    /// Runs the registered handler for an undelivered or unhandled
    /// envelope.
    pub(crate) fn handle(&self, envelope: &Envelope) {
        let guard = match self.handler.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*guard {
            Handler::Address(handler) => handler(envelope.sender()),
            Handler::Blind(handler) => {
                let (payload, size) = envelope.payload_bytes();
                handler(payload, size, envelope.sender());
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Handler> {
        match self.handler.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for FallbackHandlerCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackHandlerCollection")
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Allocator, AllocatorManager};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn backing() -> &'static dyn Allocator {
        AllocatorManager::instance().allocator()
    }

    #[test]
    fn address_handler_receives_originator() {
        let collection = FallbackHandlerCollection::new();
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);

        let from = Address::new(2, 9);
        collection.set_address_handler(Box::new(move |address| {
            assert_eq!(address, from);
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        let envelope = Envelope::create(backing(), 5_u32, from);
        // SAFETY: freshly created, exclusively owned.
        unsafe {
            collection.handle(&*envelope);
            Envelope::destroy(backing(), envelope);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn blind_handler_sees_payload_bytes() {
        let collection = FallbackHandlerCollection::new();
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&hits);

        collection.set_blind_handler(Box::new(move |payload, size, _from| {
            assert_eq!(size, 4);
            // SAFETY: the runtime passes the envelope's live payload.
            let value = unsafe { *payload.cast::<u32>() };
            assert_eq!(value, 0xDEAD_BEEF);
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        let envelope = Envelope::create(backing(), 0xDEAD_BEEF_u32, Address::NULL);
        // SAFETY: freshly created, exclusively owned.
        unsafe {
            collection.handle(&*envelope);
            Envelope::destroy(backing(), envelope);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn setting_one_shape_replaces_the_other() {
        let collection = FallbackHandlerCollection::new();
        let address_hits = Arc::new(AtomicU32::new(0));
        let blind_hits = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&address_hits);
        collection.set_address_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        let counter = Arc::clone(&blind_hits);
        collection.set_blind_handler(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let envelope = Envelope::create(backing(), (), Address::NULL);
        // SAFETY: freshly created, exclusively owned.
        unsafe {
            collection.handle(&*envelope);
            Envelope::destroy(backing(), envelope);
        }

        assert_eq!(address_hits.load(Ordering::Relaxed), 0);
        assert_eq!(blind_hits.load(Ordering::Relaxed), 1);
    }
}
