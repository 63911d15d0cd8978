use std::fmt;

use tether_bridge::{closure, string, Bridge, HostValue};
use tether_types::{AbiNames, BridgeConfig, BridgeError, BridgeResult, GuestStr, Handle, HostException};
use tracing::debug;
use wasmi::{Instance, Store, WasmParams, WasmResults};

use crate::context::GuestContext;
use crate::state::{from_wasmi, HostState};

/// An instantiated guest with its bridge.
///
/// Every top-level call into the guest goes through this type, so memory
/// views are revalidated and pending closure finalizers run once the call
/// has returned.
pub struct GuestInstance {
    store: Store<HostState>,
    instance: Instance,
    abi: AbiNames,
    fuel: Option<u64>,
    run_finalizers: bool,
}

impl fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestInstance")
            .field("abi", &self.abi)
            .field("fuel", &self.fuel)
            .field("run_finalizers", &self.run_finalizers)
            .field("bridge", self.bridge())
            .finish_non_exhaustive()
    }
}

impl GuestInstance {
    pub(crate) fn new(store: Store<HostState>, instance: Instance, config: &BridgeConfig) -> Self {
        Self {
            store,
            instance,
            abi: config.abi.clone(),
            fuel: config.fuel,
            run_finalizers: config.run_finalizers_after_calls,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.store.data().bridge
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge {
        &mut self.store.data_mut().bridge
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    pub fn store(&self) -> &Store<HostState> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    /// The running guest as seen by the bridge.
    pub fn guest(&mut self) -> BridgeResult<GuestContext<&mut Store<HostState>>> {
        GuestContext::new(&mut self.store)
    }

    /// Call the exported function `name`. With metering on, the guest gets
    /// a fresh fuel allowance first.
    pub fn call<P: WasmParams, R: WasmResults>(&mut self, name: &str, params: P) -> BridgeResult<R> {
        let func = self
            .instance
            .get_typed_func::<P, R>(&self.store, name)
            .map_err(|_| BridgeError::MissingExport(name.to_string()))?;
        self.refuel()?;
        let result = func.call(&mut self.store, params).map_err(from_wasmi);
        self.after_call()?;
        result
    }

    /// Run the optional start export once after instantiation.
    pub(crate) fn run_start(&mut self) -> BridgeResult<()> {
        let start = self.abi.start.clone();
        if self.instance.get_func(&self.store, &start).is_none() {
            return Ok(());
        }
        debug!(export = %start, "running guest start export");
        self.call::<(), ()>(&start, ())
    }

    /// Store `value` in the handle table for the guest.
    pub fn allocate(&mut self, value: impl Into<HostValue>) -> Handle {
        self.bridge_mut().allocate(value)
    }

    /// A copy of the value behind `handle`.
    pub fn value(&self, handle: Handle) -> BridgeResult<HostValue> {
        self.bridge().value(handle).cloned()
    }

    /// Take ownership of the value behind `handle`, releasing the handle.
    pub fn take(&mut self, handle: Handle) -> BridgeResult<HostValue> {
        self.bridge_mut()
            .heap
            .take(handle)
            .ok_or(BridgeError::InvalidHandle(handle))
    }

    /// Release `handle`.
    pub fn release(&mut self, handle: Handle) {
        self.bridge_mut().heap.release(handle);
    }

    /// Call the guest closure behind `handle` with `arg`.
    pub fn invoke_closure(&mut self, handle: Handle, arg: HostValue) -> BridgeResult<HostValue> {
        let c = self.bridge().closure(handle)?;
        self.refuel()?;
        let result = closure::invoke(&mut self.guest()?, &c, arg);
        self.after_call()?;
        result
    }

    /// Drop one owner of the closure behind `handle`. Returns whether the
    /// closure was destroyed.
    pub fn drop_closure(&mut self, handle: Handle) -> BridgeResult<bool> {
        let c = self.bridge().closure(handle)?;
        let destroyed = closure::drop_closure(&mut self.guest()?, &c);
        self.after_call()?;
        destroyed
    }

    /// Run the destructors of closures that became unreachable without a
    /// terminal release. Returns how many ran.
    pub fn run_finalizers(&mut self) -> BridgeResult<usize> {
        let ran = closure::run_finalizers(&mut self.guest()?)?;
        self.bridge_mut().views.invalidate();
        Ok(ran)
    }

    /// Consume the exception parked in the host-side error slot.
    pub fn take_exception(&mut self) -> Option<HostException> {
        let bridge = self.bridge_mut();
        let handle = bridge.exn.take()?;
        let value = bridge.heap.take(handle)?;
        value.as_error().cloned()
    }

    /// Copy `text` into guest memory.
    pub fn encode_string(&mut self, text: &str) -> BridgeResult<GuestStr> {
        let encoded = string::encode(&mut self.guest()?, text);
        self.bridge_mut().views.invalidate();
        encoded
    }

    /// Copy the guest string at `ptr..ptr+len` out of guest memory.
    pub fn decode_string(&mut self, ptr: u32, len: u32) -> BridgeResult<String> {
        string::read(&mut self.guest()?, ptr, len)
    }

    /// Current size of guest memory in bytes.
    pub fn memory_len(&self) -> usize {
        self.store
            .data()
            .exports
            .as_ref()
            .map_or(0, |e| e.memory.data(&self.store).len())
    }

    /// Remaining fuel, when metering is enabled.
    pub fn fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    fn refuel(&mut self) -> BridgeResult<()> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Guest(e.to_string()))?;
        }
        Ok(())
    }

    fn after_call(&mut self) -> BridgeResult<()> {
        self.bridge_mut().views.invalidate();
        if self.run_finalizers {
            self.run_finalizers()?;
        }
        Ok(())
    }
}
