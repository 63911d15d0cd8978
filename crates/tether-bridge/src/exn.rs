//! The error channel.
//!
//! Host operations invoked by the guest never unwind into guest frames. A
//! failing operation is captured, its exception is stored in the handle
//! table, and the handle is parked in the [`ErrorSlot`] (or handed to the
//! guest's own exception register) for the guest to pick up.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tether_types::{BridgeResult, Handle, HostException};
use tracing::debug;

use crate::guest::Guest;
use crate::heap::HandleTable;
use crate::value::HostValue;

/// Register holding the most recent captured exception until the guest reads it.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    pending: Option<Handle>,
}

impl ErrorSlot {
    /// Park `handle`. An exception the guest never read is released.
    pub fn store(&mut self, heap: &mut HandleTable, handle: Handle) {
        if let Some(stale) = self.pending.replace(handle) {
            debug!(handle = stale.0, "discarding unread exception");
            heap.release(stale);
        }
    }

    /// Consume the parked exception.
    pub fn take(&mut self) -> Option<Handle> {
        self.pending.take()
    }

    pub fn peek(&self) -> Option<Handle> {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

/// Run a host operation on behalf of the guest.
///
/// Returns `Ok(Some(value))` on success and `Ok(None)` after a host
/// exception or panic was captured. Errors that are not host exceptions
/// (guest traps, guest throws) are returned unchanged.
pub fn capture<G, T, F>(guest: &mut G, call: F) -> BridgeResult<Option<T>>
where
    G: Guest + ?Sized,
    F: FnOnce(&mut G) -> BridgeResult<T>,
{
    let exn = match panic::catch_unwind(AssertUnwindSafe(|| call(&mut *guest))) {
        Ok(Ok(value)) => return Ok(Some(value)),
        Ok(Err(err)) if err.is_catchable() => HostException::from(err),
        Ok(Err(err)) => return Err(err),
        Err(payload) => HostException::new("PanicError", panic_message(payload.as_ref())),
    };
    raise(guest, exn)?;
    Ok(None)
}

/// Store `exn` as the pending exception and return its handle.
pub fn raise<G: Guest + ?Sized>(guest: &mut G, exn: HostException) -> BridgeResult<Handle> {
    debug!(%exn, "captured host exception");
    let handle = guest.bridge().heap.allocate(HostValue::error(exn));
    if !guest.exn_store(handle)? {
        let bridge = guest.bridge();
        bridge.exn.store(&mut bridge.heap, handle);
    }
    Ok(handle)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "host operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_consumed_by_one_read() {
        let mut heap = HandleTable::new();
        let mut slot = ErrorSlot::default();
        let h = heap.allocate(HostValue::error(HostException::error("x")));
        slot.store(&mut heap, h);
        assert_eq!(slot.peek(), Some(h));
        assert_eq!(slot.take(), Some(h));
        assert_eq!(slot.take(), None);
        assert!(heap.is_live(h));
    }

    #[test]
    fn overwriting_unread_exception_releases_it() {
        let mut heap = HandleTable::new();
        let mut slot = ErrorSlot::default();
        let first = heap.allocate(HostValue::error(HostException::error("first")));
        let second = heap.allocate(HostValue::error(HostException::error("second")));
        slot.store(&mut heap, first);
        slot.store(&mut heap, second);
        assert!(!heap.is_live(first));
        assert_eq!(slot.take(), Some(second));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(boxed.as_ref()), "host operation panicked");
    }
}
