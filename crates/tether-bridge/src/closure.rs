//! Guest closures exposed to the host.
//!
//! A guest closure is two state words `a` and `b` plus two table indices in
//! the guest: the body (`shim`) and the destructor (`dtor`). The host wraps
//! them in a reference-counted [`Closure`]. The count starts at one for the
//! guest's own reference; every invocation holds one more for its duration.
//! When the count reaches zero the destructor runs exactly once with the
//! original state words and the record becomes inert.
//!
//! If every host reference to a closure disappears before the count reached
//! zero, the record enqueues a [`FinalizeTask`] on the instance's
//! [`FinalizationRegistry`]. The runtime drains that queue at safe points,
//! because a guest call cannot be made from inside `Drop`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tether_types::abi::{CLOSURE_MUT, CLOSURE_SHARED};
use tether_types::{BridgeError, BridgeResult};
use tracing::{debug, warn};

use crate::guest::Guest;
use crate::value::HostValue;

/// How a closure's state behaves while a call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    /// `FnMut`-like: `a` reads as zero during a call, so a re-entrant call
    /// sees a busy closure.
    Mut,
    /// `Fn`-like: state stays visible to re-entrant calls.
    Shared,
}

impl ClosureKind {
    pub fn from_abi(code: i32) -> Option<Self> {
        match code {
            CLOSURE_MUT => Some(Self::Mut),
            CLOSURE_SHARED => Some(Self::Shared),
            _ => None,
        }
    }
}

/// A destructor call owed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeTask {
    pub dtor: u32,
    pub a: u32,
    pub b: u32,
}

/// Destructor calls for closures the host dropped without a terminal release.
#[derive(Debug, Clone, Default)]
pub struct FinalizationRegistry {
    pending: Rc<RefCell<VecDeque<FinalizeTask>>>,
}

impl FinalizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, task: FinalizeTask) {
        self.pending.borrow_mut().push_back(task);
    }

    pub fn pop(&self) -> Option<FinalizeTask> {
        self.pending.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

struct ClosureRecord {
    a: Cell<u32>,
    b: Cell<u32>,
    count: Cell<u32>,
    destroyed: Cell<bool>,
    dtor: u32,
    shim: u32,
    kind: ClosureKind,
    registry: FinalizationRegistry,
}

impl Drop for ClosureRecord {
    fn drop(&mut self) {
        if !self.destroyed.get() {
            self.registry.enqueue(FinalizeTask {
                dtor: self.dtor,
                a: self.a.get(),
                b: self.b.get(),
            });
        }
    }
}

/// A host-callable wrapper around a guest closure. Clones share the record.
#[derive(Clone)]
pub struct Closure(Rc<ClosureRecord>);

impl Closure {
    pub fn wrap(
        registry: &FinalizationRegistry,
        a: u32,
        b: u32,
        dtor: u32,
        shim: u32,
        kind: ClosureKind,
    ) -> Self {
        Self(Rc::new(ClosureRecord {
            a: Cell::new(a),
            b: Cell::new(b),
            count: Cell::new(1),
            destroyed: Cell::new(false),
            dtor,
            shim,
            kind,
            registry: registry.clone(),
        }))
    }

    pub fn count(&self) -> u32 {
        self.0.count.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    pub fn kind(&self) -> ClosureKind {
        self.0.kind
    }

    /// Current state words as the guest would observe them.
    pub fn state(&self) -> (u32, u32) {
        (self.0.a.get(), self.0.b.get())
    }

    /// Add one owner.
    pub fn retain(&self) -> BridgeResult<()> {
        if self.is_destroyed() {
            return Err(BridgeError::ClosureDestroyed);
        }
        self.0.count.set(self.count() + 1);
        Ok(())
    }

    /// Drop one owner. Returns the destructor call when this was the last one.
    ///
    /// Releasing a destroyed closure does nothing.
    pub fn release(&self) -> Option<FinalizeTask> {
        if self.is_destroyed() {
            return None;
        }
        let count = self.count().saturating_sub(1);
        self.0.count.set(count);
        if count > 0 {
            return None;
        }
        let task = FinalizeTask {
            dtor: self.0.dtor,
            a: self.0.a.replace(0),
            b: self.0.b.replace(0),
        };
        self.0.destroyed.set(true);
        Some(task)
    }

    /// Begin a call: take one count and hand out the state words.
    fn enter(&self) -> BridgeResult<(u32, u32)> {
        if self.is_destroyed() {
            return Err(BridgeError::ClosureDestroyed);
        }
        self.0.count.set(self.count() + 1);
        let a = self.0.a.get();
        if self.0.kind == ClosureKind::Mut {
            self.0.a.set(0);
        }
        Ok((a, self.0.b.get()))
    }

    /// Finish a call begun with `a`, whether or not it succeeded.
    fn exit(&self, a: u32) -> Option<FinalizeTask> {
        let count = self.count().saturating_sub(1);
        self.0.count.set(count);
        if count > 0 {
            if self.0.kind == ClosureKind::Mut {
                self.0.a.set(a);
            }
            return None;
        }
        self.0.a.set(0);
        self.0.destroyed.set(true);
        Some(FinalizeTask {
            dtor: self.0.dtor,
            a,
            b: self.0.b.replace(0),
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("count", &self.count())
            .field("destroyed", &self.is_destroyed())
            .field("kind", &self.0.kind)
            .finish()
    }
}

/// Call `closure` with `arg`.
///
/// The count is held for the duration of the call and given back even when
/// the guest fails; if that was the last owner, the destructor runs before
/// this returns. The argument handle is only valid for the call.
pub fn invoke<G: Guest + ?Sized>(
    guest: &mut G,
    closure: &Closure,
    arg: HostValue,
) -> BridgeResult<HostValue> {
    let (a, b) = closure.enter()?;
    let arg = guest.bridge().heap.allocate(arg);
    let outcome = guest.invoke(closure.0.shim, a, b, arg);

    let bridge = guest.bridge();
    bridge.views.invalidate();
    bridge.heap.release(arg);
    let destroyed = match closure.exit(a) {
        Some(task) => run_destructor(guest, task),
        None => Ok(()),
    };

    let ret = outcome?;
    destroyed?;
    guest
        .bridge()
        .heap
        .take(ret)
        .ok_or(BridgeError::InvalidHandle(ret))
}

/// Drop one owner of `closure`, running the destructor if it was the last.
///
/// Returns whether this call destroyed the closure.
pub fn drop_closure<G: Guest + ?Sized>(guest: &mut G, closure: &Closure) -> BridgeResult<bool> {
    match closure.release() {
        Some(task) => {
            run_destructor(guest, task)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Run every destructor queued by dropped closures. Returns how many ran.
pub fn run_finalizers<G: Guest + ?Sized>(guest: &mut G) -> BridgeResult<usize> {
    let mut ran = 0;
    while let Some(task) = guest.bridge().finalizers().pop() {
        warn!(dtor = task.dtor, "finalizing closure the guest never released");
        run_destructor(guest, task)?;
        ran += 1;
    }
    Ok(ran)
}

fn run_destructor<G: Guest + ?Sized>(guest: &mut G, task: FinalizeTask) -> BridgeResult<()> {
    debug!(dtor = task.dtor, a = task.a, b = task.b, "destroying closure");
    let result = guest.destroy(task.dtor, task.a, task.b);
    guest.bridge().views.invalidate();
    result
}
