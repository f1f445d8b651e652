//! The actor capability consumed by the scheduler.
//!
//! The runtime never allocates or destroys actor storage — an actor is
//! any user value implementing [`Actor`], registered with a framework
//! under a raw pointer whose validity is the caller's obligation. The
//! scheduler guarantees that `dispatch` runs on one worker at a time per
//! mailbox (exclusion by pin + mailbox lock), so handlers take `&mut
//! self` without further synchronization.

use crate::address::Address;
use crate::envelope::Envelope;
use crate::framework::FrameworkCore;
use crate::processor::Context;
use crate::sender;

/// A message-handling entity bound to a mailbox.
pub trait Actor: Send {
    /// Dispatches one message.
    ///
    /// Returns `true` if a handler consumed the message. On `false` the
    /// runtime falls through to [`Actor::default_handler`], and from
    /// there to the framework's fallback handler.
    fn dispatch(&mut self, ctx: &mut DispatchContext<'_>, message: &Envelope) -> bool;

    /// Catch-all invoked when [`Actor::dispatch`] declines a message.
    fn default_handler(&mut self, _ctx: &mut DispatchContext<'_>, _message: &Envelope) -> bool {
        false
    }
}

/// Per-dispatch view of the runtime handed to message handlers.
///
/// Sends issued through the context are stamped with the handling actor's
/// own address and scheduled onto the calling worker's local queue,
/// keeping actor-to-actor conversations on a warm thread.
pub struct DispatchContext<'a> {
    pub(crate) core: &'a FrameworkCore,
    pub(crate) worker: &'a Context,
    pub(crate) address: Address,
}

impl DispatchContext<'_> {
    /// The handling actor's own address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sends `value` to `to`, originating from this actor.
    ///
    /// Returns `true` if the message was delivered to a mailbox (not
    /// necessarily handled), `false` on allocation failure or an
    /// unroutable address.
    pub fn send<T: Send + 'static>(&mut self, value: T, to: Address) -> bool {
        let envelope = Envelope::create(self.worker.cache(), value, self.address);
        if envelope.is_null() {
            return false;
        }
        sender::send(self.core, Some(self.worker), envelope, to)
    }
}
