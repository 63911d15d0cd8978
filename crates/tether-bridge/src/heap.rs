//! The handle table.
//!
//! A slot array with an intrusive free list. Each slot either holds a live
//! [`HostValue`] or the index of the next free slot; `next_free` points at the
//! head of that list, and equals `slots.len()` when the list is empty.
//!
//! ```text
//! slot:  0          1     2     3      4        5        6
//!        undefined  null  true  false  "hello"  Free(7)  Free(5)
//!                                                        ^ next_free = 6
//! ```
//!
//! Slots `0..4` are the reserved sentinels and are never freed.

use tether_types::{Handle, RESERVED_HANDLES};
use tracing::trace;

use crate::value::HostValue;

#[derive(Debug)]
enum Slot {
    Occupied(HostValue),
    Free(u32),
}

/// Growable mapping from small integer handles to host values.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    next_free: u32,
    live: usize,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// A table with room for `capacity` values before the backing store grows.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(RESERVED_HANDLES as usize + capacity);
        slots.push(Slot::Occupied(HostValue::Undefined));
        slots.push(Slot::Occupied(HostValue::Null));
        slots.push(Slot::Occupied(HostValue::Bool(true)));
        slots.push(Slot::Occupied(HostValue::Bool(false)));
        Self {
            slots,
            next_free: RESERVED_HANDLES,
            live: 0,
        }
    }

    /// Store `value` and return a fresh or recycled handle.
    ///
    /// Reuses the most recently released slot before appending a new one.
    pub fn allocate(&mut self, value: HostValue) -> Handle {
        if self.next_free as usize == self.slots.len() {
            self.slots.push(Slot::Free(self.next_free + 1));
        }
        let idx = self.next_free;
        let slot = &mut self.slots[idx as usize];
        self.next_free = match *slot {
            Slot::Free(next) => next,
            // `next_free` only ever names free slots.
            Slot::Occupied(_) => unreachable!("free list points at a live slot"),
        };
        *slot = Slot::Occupied(value);
        self.live += 1;
        trace!(handle = idx, "allocated handle");
        Handle(idx)
    }

    /// The value named by `handle`, if it is live.
    #[inline]
    pub fn resolve(&self, handle: Handle) -> Option<&HostValue> {
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    /// Whether `handle` currently names a value.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.resolve(handle).is_some()
    }

    /// A second, independently releasable handle to the same value.
    pub fn clone_ref(&mut self, handle: Handle) -> Option<Handle> {
        let value = self.resolve(handle)?.clone();
        Some(self.allocate(value))
    }

    /// Free `handle`'s slot and push it on the free list.
    ///
    /// Reserved handles are ignored. Releasing a handle that is not live is a
    /// caller bug; it is reported in debug builds and otherwise ignored.
    pub fn release(&mut self, handle: Handle) {
        self.remove(handle);
    }

    /// Resolve and release in one step, handing ownership of the value to the caller.
    ///
    /// Taking a reserved handle returns its sentinel without freeing anything.
    pub fn take(&mut self, handle: Handle) -> Option<HostValue> {
        if handle.is_reserved() {
            return self.resolve(handle).cloned();
        }
        self.remove(handle)
    }

    fn remove(&mut self, handle: Handle) -> Option<HostValue> {
        if handle.is_reserved() {
            return None;
        }
        let next_free = self.next_free;
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            debug_assert!(false, "released out-of-range handle {handle}");
            return None;
        };
        match std::mem::replace(slot, Slot::Free(next_free)) {
            Slot::Occupied(value) => {
                self.next_free = handle.0;
                self.live -= 1;
                trace!(handle = handle.0, "released handle");
                Some(value)
            }
            free @ Slot::Free(_) => {
                *slot = free;
                debug_assert!(false, "double release of handle {handle}");
                None
            }
        }
    }

    /// Number of live, non-reserved values.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots, reserved ones included. Never decreases.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
