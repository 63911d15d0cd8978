//! Host side of the intrinsic imports.
//!
//! Each intrinsic resolves handles through the bridge, touches guest memory
//! through the view cache and returns a scalar or a fresh handle. Bridge
//! faults abort the guest call; the fallible intrinsics (`reflect_get`,
//! `reflect_set`, `call`) instead capture host exceptions and report them
//! through their trailing status pointer.

use tether_bridge::memory::guest_offset;
use tether_bridge::value::{reflect_get, reflect_set};
use tether_bridge::{closure, exn, string, ArrayKind, ClosureKind, Guest, HostValue, TypedArray};
use tether_types::abi::{
    Intrinsic, STATUS_OK, STATUS_THREW, TRISTATE_FALSE, TRISTATE_TRUE, TRISTATE_UNSET,
};
use tether_types::{BridgeError, BridgeResult, GuestStr, Handle, HostException};
use wasmi::{Caller, Linker};

use crate::context::GuestContext;
use crate::state::{abort, HostState};

type Ctx<'a> = GuestContext<Caller<'a, HostState>>;

fn with_guest<'a, R>(
    caller: Caller<'a, HostState>,
    f: impl FnOnce(&mut Ctx<'a>) -> BridgeResult<R>,
) -> Result<R, wasmi::Error> {
    let mut guest = GuestContext::new(caller).map_err(abort)?;
    f(&mut guest).map_err(abort)
}

/// Run `f` with host exceptions captured; writes the outcome to `status`.
fn fallible<'a, R: Default>(
    caller: Caller<'a, HostState>,
    status: i32,
    f: impl FnOnce(&mut Ctx<'a>) -> BridgeResult<R>,
) -> Result<R, wasmi::Error> {
    with_guest(caller, |g| {
        let out = exn::capture(g, f)?;
        let code = if out.is_some() { STATUS_OK } else { STATUS_THREW };
        let (mem, bridge) = g.split();
        bridge.views.data_view_mut(mem).set_i32(guest_offset(status), code)?;
        Ok(out.unwrap_or_default())
    })
}

fn value(g: &mut impl Guest, raw: i32) -> BridgeResult<HostValue> {
    g.bridge().value(Handle::from_abi(raw)).cloned()
}

fn allocate(g: &mut impl Guest, value: HostValue) -> i32 {
    g.bridge().allocate(value).to_abi()
}

/// A host-side length as an ABI word; lengths past `i32::MAX` are out of range.
fn abi_len(len: usize) -> BridgeResult<i32> {
    i32::try_from(len).map_err(|_| BridgeError::OutOfBounds {
        offset: 0,
        len,
        memory_len: i32::MAX as usize,
    })
}

fn flag(b: bool) -> i32 {
    i32::from(b)
}

/// Encode `text` (if any) into guest memory and write `[ptr, len]` to `out`.
fn write_text(g: &mut impl Guest, out: i32, text: Option<&str>) -> BridgeResult<()> {
    let encoded = match text {
        Some(text) => string::encode(g, text)?,
        None => GuestStr::EMPTY,
    };
    string::write_out_str(g, guest_offset(out), encoded)
}

fn is<'a>(caller: Caller<'a, HostState>, h: i32, test: fn(&HostValue) -> bool) -> Result<i32, wasmi::Error> {
    with_guest(caller, |g| Ok(flag(test(&value(g, h)?))))
}

fn link_err(err: impl std::fmt::Display) -> BridgeError {
    BridgeError::Instantiate(err.to_string())
}

/// Register every intrinsic under `module`.
pub fn link(linker: &mut Linker<HostState>, module: &str) -> BridgeResult<()> {
    // ── Handles ──────────────────────────────────────────────────────────────

    linker
        .func_wrap(
            module,
            Intrinsic::ObjectDropRef.name(),
            |caller: Caller<'_, HostState>, h: i32| {
                with_guest(caller, |g| {
                    let h = Handle::from_abi(h);
                    let heap = &mut g.bridge().heap;
                    if !h.is_reserved() && !heap.is_live(h) {
                        return Err(BridgeError::InvalidHandle(h));
                    }
                    heap.release(h);
                    Ok(())
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ObjectCloneRef.name(),
            |caller: Caller<'_, HostState>, h: i32| {
                with_guest(caller, |g| {
                    let h = Handle::from_abi(h);
                    g.bridge()
                        .heap
                        .clone_ref(h)
                        .map(Handle::to_abi)
                        .ok_or(BridgeError::InvalidHandle(h))
                })
            },
        )
        .map_err(link_err)?;

    // ── Primitives ───────────────────────────────────────────────────────────

    linker
        .func_wrap(
            module,
            Intrinsic::StringNew.name(),
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                with_guest(caller, |g| {
                    let (mem, bridge) = g.split();
                    let (ptr, len) = (guest_offset(ptr), guest_offset(len));
                    let text = string::decode(&mut bridge.views, mem, ptr, len)?;
                    Ok(bridge.heap.allocate(HostValue::string(text)).to_abi())
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::StringGet.name(),
            |caller: Caller<'_, HostState>, out: i32, h: i32| {
                with_guest(caller, |g| {
                    let v = value(g, h)?;
                    write_text(g, out, v.as_str())
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::NumberNew.name(),
            |caller: Caller<'_, HostState>, n: f64| {
                with_guest(caller, |g| Ok(allocate(g, HostValue::Number(n))))
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::NumberGet.name(),
            |caller: Caller<'_, HostState>, out: i32, h: i32| {
                with_guest(caller, |g| {
                    let n = value(g, h)?.as_f64();
                    string::write_out_f64(g, guest_offset(out), n)
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::BooleanGet.name(),
            |caller: Caller<'_, HostState>, h: i32| {
                with_guest(caller, |g| {
                    Ok(match value(g, h)?.as_bool() {
                        Some(true) => TRISTATE_TRUE,
                        Some(false) => TRISTATE_FALSE,
                        None => TRISTATE_UNSET,
                    })
                })
            },
        )
        .map_err(link_err)?;

    // ── Predicates ───────────────────────────────────────────────────────────

    let predicates: [(Intrinsic, fn(&HostValue) -> bool); 5] = [
        (Intrinsic::IsUndefined, HostValue::is_undefined),
        (Intrinsic::IsNull, HostValue::is_null),
        (Intrinsic::IsFunction, HostValue::is_function),
        (Intrinsic::IsObject, HostValue::is_object),
        (Intrinsic::IsString, |v| v.as_str().is_some()),
    ];
    for (intrinsic, test) in predicates {
        linker
            .func_wrap(
                module,
                intrinsic.name(),
                move |caller: Caller<'_, HostState>, h: i32| is(caller, h, test),
            )
            .map_err(link_err)?;
    }

    linker
        .func_wrap(
            module,
            Intrinsic::JsvalEq.name(),
            |caller: Caller<'_, HostState>, a: i32, b: i32| {
                with_guest(caller, |g| {
                    let a = value(g, a)?;
                    let b = value(g, b)?;
                    Ok(flag(a.strict_eq(&b)))
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::DebugString.name(),
            |caller: Caller<'_, HostState>, out: i32, h: i32| {
                with_guest(caller, |g| {
                    let rendered = value(g, h)?.debug_string();
                    write_text(g, out, Some(&rendered))
                })
            },
        )
        .map_err(link_err)?;

    // ── Errors ───────────────────────────────────────────────────────────────

    linker
        .func_wrap(
            module,
            Intrinsic::ErrorNew.name(),
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                with_guest(caller, |g| {
                    let message = string::read(g, guest_offset(ptr), guest_offset(len))?;
                    Ok(allocate(g, HostValue::error(HostException::error(message))))
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ErrorMessage.name(),
            |caller: Caller<'_, HostState>, out: i32, h: i32| {
                with_guest(caller, |g| {
                    let v = value(g, h)?;
                    write_text(g, out, v.as_error().map(|e| e.message.as_str()))
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::Throw.name(),
            |caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                with_guest(caller, |g| -> BridgeResult<()> {
                    let message = string::read(g, guest_offset(ptr), guest_offset(len))?;
                    Err(BridgeError::GuestThrow(message))
                })
            },
        )
        .map_err(link_err)?;

    // ── Memory and typed arrays ──────────────────────────────────────────────

    linker
        .func_wrap(
            module,
            Intrinsic::Memory.name(),
            |caller: Caller<'_, HostState>| with_guest(caller, |g| Ok(allocate(g, HostValue::Memory))),
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ArrayFromGuest.name(),
            |caller: Caller<'_, HostState>, kind: i32, ptr: i32, len: i32| {
                with_guest(caller, |g| {
                    let kind = ArrayKind::from_abi(kind)
                        .ok_or_else(|| BridgeError::Guest(format!("unknown array kind {kind}")))?;
                    let (ptr, len) = (guest_offset(ptr), guest_offset(len));
                    let (mem, bridge) = g.split();
                    let views = &mut bridge.views;
                    let bytes = match kind {
                        ArrayKind::U8 => views.bytes(mem).subarray(ptr, len)?.to_vec(),
                        ArrayKind::I32 => views.words32(mem).subarray(ptr, len)?.to_vec(),
                        ArrayKind::U32 => views.uwords32(mem).subarray(ptr, len)?.to_vec(),
                        ArrayKind::F32 => views.floats32(mem).subarray(ptr, len)?.to_vec(),
                    };
                    let array = TypedArray::from_bytes(kind, bytes);
                    Ok(bridge.heap.allocate(HostValue::TypedArray(array)).to_abi())
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ArrayToGuest.name(),
            |caller: Caller<'_, HostState>, h: i32, ptr: i32| {
                with_guest(caller, |g| {
                    let array = match value(g, h)? {
                        HostValue::TypedArray(array) => array,
                        other => {
                            return Err(BridgeError::TypeMismatch {
                                handle: Handle::from_abi(h),
                                expected: "typed array",
                                found: other.type_name(),
                            })
                        }
                    };
                    let ptr = guest_offset(ptr);
                    let width = array.kind().width();
                    if ptr as usize % width != 0 {
                        return Err(BridgeError::Misaligned { ptr, width });
                    }
                    let bytes = array.bytes();
                    let (mem, bridge) = g.split();
                    bridge.views.bytes_mut(mem).write(ptr, &bytes)?;
                    abi_len(bytes.len())
                })
            },
        )
        .map_err(link_err)?;

    // ── Objects and arrays ───────────────────────────────────────────────────

    linker
        .func_wrap(
            module,
            Intrinsic::ObjectNew.name(),
            |caller: Caller<'_, HostState>| with_guest(caller, |g| Ok(allocate(g, HostValue::object()))),
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ArrayNew.name(),
            |caller: Caller<'_, HostState>| {
                with_guest(caller, |g| Ok(allocate(g, HostValue::array(Vec::new()))))
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ArrayPush.name(),
            |caller: Caller<'_, HostState>, arr: i32, val: i32| {
                with_guest(caller, |g| {
                    let item = value(g, val)?;
                    match value(g, arr)? {
                        HostValue::Array(items) => {
                            let mut items = items.borrow_mut();
                            items.push(item);
                            abi_len(items.len())
                        }
                        other => Err(BridgeError::TypeMismatch {
                            handle: Handle::from_abi(arr),
                            expected: "Array",
                            found: other.type_name(),
                        }),
                    }
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ReflectGet.name(),
            |caller: Caller<'_, HostState>, target: i32, key: i32, status: i32| {
                fallible(caller, status, |g| {
                    let target = value(g, target)?;
                    let key = value(g, key)?;
                    let found = reflect_get(&target, &key)?;
                    Ok(allocate(g, found))
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ReflectSet.name(),
            |caller: Caller<'_, HostState>, target: i32, key: i32, val: i32, status: i32| {
                fallible(caller, status, |g| {
                    let target = value(g, target)?;
                    let key = value(g, key)?;
                    let val = value(g, val)?;
                    Ok(flag(reflect_set(&target, &key, val)?))
                })
            },
        )
        .map_err(link_err)?;

    // ── Calls and closures ───────────────────────────────────────────────────

    linker
        .func_wrap(
            module,
            Intrinsic::Call.name(),
            |caller: Caller<'_, HostState>, callee: i32, arg: i32, status: i32| {
                fallible(caller, status, |g| {
                    let callee = value(g, callee)?;
                    let arg = value(g, arg)?;
                    let ret = match callee {
                        HostValue::Function(func) => func.call(&[arg])?,
                        HostValue::Closure(c) => closure::invoke(g, &c, arg)?,
                        other => {
                            return Err(HostException::type_error(format!(
                                "{} is not a function",
                                other.debug_string()
                            ))
                            .into())
                        }
                    };
                    Ok(allocate(g, ret))
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ClosureNew.name(),
            |caller: Caller<'_, HostState>, a: i32, b: i32, dtor: i32, shim: i32, kind: i32| {
                with_guest(caller, |g| {
                    let kind = ClosureKind::from_abi(kind)
                        .ok_or_else(|| BridgeError::Guest(format!("unknown closure kind {kind}")))?;
                    let (a, b) = (guest_offset(a), guest_offset(b));
                    let (dtor, shim) = (guest_offset(dtor), guest_offset(shim));
                    Ok(g.bridge().wrap_closure(a, b, dtor, shim, kind).to_abi())
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ClosureRetain.name(),
            |caller: Caller<'_, HostState>, h: i32| {
                with_guest(caller, |g| g.bridge().closure(Handle::from_abi(h))?.retain())
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::CbDrop.name(),
            |caller: Caller<'_, HostState>, h: i32| {
                with_guest(caller, |g| {
                    let h = Handle::from_abi(h);
                    let c = g.bridge().closure(h)?;
                    g.bridge().heap.release(h);
                    Ok(flag(closure::drop_closure(g, &c)?))
                })
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            module,
            Intrinsic::ExnTake.name(),
            |caller: Caller<'_, HostState>| {
                with_guest(caller, |g| {
                    Ok(g.bridge().exn.take().unwrap_or(Handle::UNDEFINED).to_abi())
                })
            },
        )
        .map_err(link_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_past_i32_range_are_rejected() {
        assert_eq!(abi_len(0).unwrap(), 0);
        assert_eq!(abi_len(i32::MAX as usize).unwrap(), i32::MAX);
        assert!(matches!(
            abi_len(i32::MAX as usize + 1),
            Err(BridgeError::OutOfBounds { len, .. }) if len == i32::MAX as usize + 1
        ));
    }
}
