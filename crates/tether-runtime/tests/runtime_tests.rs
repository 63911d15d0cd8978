//! End-to-end tests: guests assembled with `tether-guest`, run under `wasmi`.
//!
//! Tests validate:
//! - Strings cross the boundary in both directions through the intrinsics
//! - Guest memory growth is observed by the host
//! - Closures are invoked, dropped and finalized exactly once
//! - Fallible intrinsics report status and route exceptions
//! - Initialisation happens once, from bytes, files or readers
//! - Fuel metering stops runaway guests

use tether_guest::types::{EXN_LOAD_EXPORT, SCRATCH_START};
use tether_guest::{memarg, GuestBuilder};
use tether_runtime::{GuestInstance, ModuleSource, Runtime};
use tether_types::abi::{Intrinsic, CLOSURE_MUT, STATUS_OK, STATUS_THREW};
use tether_types::{BridgeConfig, BridgeError, Handle, HostException};
use tether_bridge::HostValue;
use wasm_encoder::{BlockType, Function, Instruction, ValType};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

const I32: ValType = ValType::I32;
/// Word the guest writes fallible-intrinsic status to.
const STATUS: i32 = 32;
/// Word the test destructor counts destroyed closures in.
const DESTROYED: i32 = 128;

fn body(instructions: &[Instruction<'_>]) -> Function {
    let mut f = Function::new(vec![]);
    for instruction in instructions {
        f.instruction(instruction);
    }
    f.instruction(&Instruction::End);
    f
}

fn call(builder: &GuestBuilder, intrinsic: Intrinsic) -> Instruction<'static> {
    Instruction::Call(builder.intrinsic(intrinsic))
}

/// A guest exercising every intrinsic family the tests touch.
fn fixture_with(builder: GuestBuilder) -> Vec<u8> {
    let mut b = builder;
    let greeting = b.data_str("héllo 日本").unwrap();
    let boom = b.data_str("boom").unwrap();

    // shim(a, b, arg) -> clone of arg
    let shim = b.add_shim(body(&[
        Instruction::LocalGet(2),
        call(&b, Intrinsic::ObjectCloneRef),
    ]));
    // throwing_shim(a, b, arg): throw "boom"
    let throwing_shim = b.add_shim(body(&[
        Instruction::I32Const(boom.ptr as i32),
        Instruction::I32Const(boom.len as i32),
        call(&b, Intrinsic::Throw),
        Instruction::Unreachable,
    ]));
    // dtor(a, b): *DESTROYED += 1
    let dtor = b.add_destructor(body(&[
        Instruction::I32Const(DESTROYED),
        Instruction::I32Const(DESTROYED),
        Instruction::I32Load(memarg(0, 2)),
        Instruction::I32Const(1),
        Instruction::I32Add,
        Instruction::I32Store(memarg(0, 2)),
    ]));

    let greet = body(&[
        Instruction::I32Const(greeting.ptr as i32),
        Instruction::I32Const(greeting.len as i32),
        call(&b, Intrinsic::StringNew),
    ]);
    b.export_function("greet", &[], &[I32], greet).unwrap();

    let scratch = SCRATCH_START as i32;
    let echo = body(&[
        Instruction::I32Const(scratch),
        Instruction::LocalGet(0),
        call(&b, Intrinsic::StringGet),
        Instruction::I32Const(scratch),
        Instruction::I32Load(memarg(0, 2)),
        Instruction::I32Const(scratch),
        Instruction::I32Load(memarg(4, 2)),
        call(&b, Intrinsic::StringNew),
    ]);
    b.export_function("echo", &[I32], &[I32], echo).unwrap();

    let fail = body(&[
        Instruction::I32Const(boom.ptr as i32),
        Instruction::I32Const(boom.len as i32),
        call(&b, Intrinsic::Throw),
    ]);
    b.export_function("fail", &[], &[], fail).unwrap();

    let lookup = body(&[
        Instruction::LocalGet(0),
        Instruction::LocalGet(1),
        Instruction::I32Const(STATUS),
        call(&b, Intrinsic::ReflectGet),
        Instruction::Drop,
        Instruction::I32Const(STATUS),
        Instruction::I32Load(memarg(0, 2)),
    ]);
    b.export_function("lookup", &[I32, I32], &[I32], lookup).unwrap();

    let apply = body(&[
        Instruction::LocalGet(0),
        Instruction::LocalGet(1),
        Instruction::I32Const(STATUS),
        call(&b, Intrinsic::Call),
    ]);
    b.export_function("apply", &[I32, I32], &[I32], apply).unwrap();

    let status = body(&[
        Instruction::I32Const(STATUS),
        Instruction::I32Load(memarg(0, 2)),
    ]);
    b.export_function("status", &[], &[I32], status).unwrap();

    let take = body(&[call(&b, Intrinsic::ExnTake)]);
    b.export_function("take", &[], &[I32], take).unwrap();

    let make_closure = body(&[
        Instruction::I32Const(7),
        Instruction::I32Const(9),
        Instruction::I32Const(dtor as i32),
        Instruction::I32Const(shim as i32),
        Instruction::I32Const(CLOSURE_MUT),
        call(&b, Intrinsic::ClosureNew),
    ]);
    b.export_function("make_closure", &[], &[I32], make_closure).unwrap();

    let make_thrower = body(&[
        Instruction::I32Const(0),
        Instruction::I32Const(0),
        Instruction::I32Const(dtor as i32),
        Instruction::I32Const(throwing_shim as i32),
        Instruction::I32Const(CLOSURE_MUT),
        call(&b, Intrinsic::ClosureNew),
    ]);
    b.export_function("make_thrower", &[], &[I32], make_thrower).unwrap();

    let drop_cb = body(&[Instruction::LocalGet(0), call(&b, Intrinsic::CbDrop)]);
    b.export_function("drop_cb", &[I32], &[I32], drop_cb).unwrap();

    let destroyed = body(&[
        Instruction::I32Const(DESTROYED),
        Instruction::I32Load(memarg(0, 2)),
    ]);
    b.export_function("destroyed", &[], &[I32], destroyed).unwrap();

    let answer = body(&[Instruction::I32Const(42)]);
    b.export_function("answer", &[], &[I32], answer).unwrap();

    let mut spin = Function::new(vec![]);
    spin.instruction(&Instruction::Loop(BlockType::Empty));
    spin.instruction(&Instruction::Br(0));
    spin.instruction(&Instruction::End);
    spin.instruction(&Instruction::End);
    b.export_function("spin", &[], &[], spin).unwrap();

    b.build().unwrap()
}

fn fixture() -> Vec<u8> {
    fixture_with(GuestBuilder::new())
}

fn runtime(config: BridgeConfig) -> Runtime {
    Runtime::new(config).unwrap()
}

fn with_guest<R>(wasm: &[u8], f: impl FnOnce(&mut GuestInstance) -> R) -> R {
    let mut rt = runtime(BridgeConfig::default());
    let guest = rt.init_sync(wasm).unwrap();
    f(guest)
}

fn handle(raw: i32) -> Handle {
    Handle::from_abi(raw)
}

fn text(guest: &GuestInstance, raw: i32) -> String {
    let value = guest.value(handle(raw)).unwrap();
    value.as_str().expect("string handle").to_string()
}

// ══════════════════════════════════════════════════════════════════════════════
// Strings and memory
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn guest_string_becomes_host_string() {
    with_guest(&fixture(), |guest| {
        let h: i32 = guest.call("greet", ()).unwrap();
        assert_eq!(text(guest, h), "héllo 日本");
    });
}

#[test]
fn host_string_round_trips_through_guest_memory() {
    with_guest(&fixture(), |guest| {
        for sample in ["", "plain ascii", "ünïcödé 😀", "mixed 𝄞 ascii tail"] {
            let h = guest.allocate(HostValue::string(sample));
            let echoed: i32 = guest.call("echo", (h.to_abi(),)).unwrap();
            assert_eq!(text(guest, echoed), sample);
        }
    });
}

#[test]
fn exact_encoding_round_trips_without_fast_path() {
    let config = BridgeConfig {
        string_fast_path: false,
        ..BridgeConfig::default()
    };
    let mut rt = runtime(config);
    let guest = rt.init_sync(&fixture()).unwrap();
    let h = guest.allocate(HostValue::string("naïve façade"));
    let echoed: i32 = guest.call("echo", (h.to_abi(),)).unwrap();
    assert_eq!(text(guest, echoed), "naïve façade");
}

#[test]
fn large_strings_grow_guest_memory() {
    with_guest(&fixture(), |guest| {
        let before = guest.memory_len();
        let big = "é".repeat(100_000);
        let encoded = guest.encode_string(&big).unwrap();
        assert!(guest.memory_len() > before);
        assert_eq!(guest.decode_string(encoded.ptr, encoded.len).unwrap(), big);
    });
}

#[test]
fn missing_export_is_reported() {
    with_guest(&fixture(), |guest| {
        let err = guest.call::<(), i32>("nope", ()).unwrap_err();
        assert!(matches!(err, BridgeError::MissingExport(name) if name == "nope"));
    });
}

#[test]
fn module_without_allocator_fails_to_initialise() {
    use wasm_encoder::{ExportKind, ExportSection, MemorySection, MemoryType, Module};

    let mut module = Module::new();
    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 1,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);
    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    module.section(&exports);

    let mut rt = runtime(BridgeConfig::default());
    let err = rt.init_sync(&module.finish()).unwrap_err();
    assert!(matches!(err, BridgeError::MissingExport(name) if name == "__tether_malloc"));
    assert!(rt.guest().is_none());
}

// ══════════════════════════════════════════════════════════════════════════════
// Closures
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn closure_invocation_returns_guest_result() {
    with_guest(&fixture(), |guest| {
        let c: i32 = guest.call("make_closure", ()).unwrap();
        let ret = guest.invoke_closure(handle(c), HostValue::string("ping")).unwrap();
        assert_eq!(ret.as_str(), Some("ping"));
        let ret = guest.invoke_closure(handle(c), HostValue::Number(2.5)).unwrap();
        assert_eq!(ret.as_f64(), Some(2.5));
    });
}

#[test]
fn host_drop_destroys_closure_once() {
    with_guest(&fixture(), |guest| {
        let c: i32 = guest.call("make_closure", ()).unwrap();
        assert!(guest.drop_closure(handle(c)).unwrap());
        assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 1);

        let err = guest.invoke_closure(handle(c), HostValue::Null).unwrap_err();
        assert!(matches!(err, BridgeError::ClosureDestroyed));

        guest.release(handle(c));
        assert_eq!(guest.run_finalizers().unwrap(), 0);
        assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 1);
    });
}

#[test]
fn guest_cb_drop_releases_handle_and_destroys() {
    with_guest(&fixture(), |guest| {
        let c: i32 = guest.call("make_closure", ()).unwrap();
        assert_eq!(guest.call::<i32, i32>("drop_cb", c).unwrap(), 1);
        assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 1);
        assert!(!guest.bridge().heap.is_live(handle(c)));
    });
}

#[test]
fn forgotten_closure_is_finalized() {
    let config = BridgeConfig {
        run_finalizers_after_calls: false,
        ..BridgeConfig::default()
    };
    let mut rt = runtime(config);
    let guest = rt.init_sync(&fixture()).unwrap();
    let c: i32 = guest.call("make_closure", ()).unwrap();
    guest.release(handle(c));
    assert_eq!(guest.bridge().finalizers().len(), 1);
    assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 0);

    assert_eq!(guest.run_finalizers().unwrap(), 1);
    assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 1);
}

#[test]
fn finalizers_run_after_top_level_calls_by_default() {
    with_guest(&fixture(), |guest| {
        let c: i32 = guest.call("make_closure", ()).unwrap();
        guest.release(handle(c));
        // The destructor runs once the next call has returned.
        assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 0);
        assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 1);
        assert!(guest.bridge().finalizers().is_empty());
    });
}

#[test]
fn guest_calls_closure_through_call_intrinsic() {
    with_guest(&fixture(), |guest| {
        let c: i32 = guest.call("make_closure", ()).unwrap();
        let arg = guest.allocate(HostValue::string("via call"));
        let ret: i32 = guest.call("apply", (c, arg.to_abi())).unwrap();
        assert_eq!(guest.call::<(), i32>("status", ()).unwrap(), STATUS_OK);
        assert_eq!(text(guest, ret), "via call");
    });
}

// ══════════════════════════════════════════════════════════════════════════════
// Error channel
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn throw_surfaces_as_guest_throw() {
    with_guest(&fixture(), |guest| {
        let err = guest.call::<(), ()>("fail", ()).unwrap_err();
        assert!(matches!(err, BridgeError::GuestThrow(message) if message == "boom"));
    });
}

#[test]
fn throw_inside_called_closure_is_captured() {
    let wasm = fixture_with(GuestBuilder::new().without_exn_register());
    with_guest(&wasm, |guest| {
        let c: i32 = guest.call("make_thrower", ()).unwrap();
        let arg = guest.allocate(HostValue::Null);
        let ret: i32 = guest.call("apply", (c, arg.to_abi())).unwrap();
        assert_eq!(ret, Handle::UNDEFINED.to_abi());
        assert_eq!(guest.call::<(), i32>("status", ()).unwrap(), STATUS_THREW);

        let exn: i32 = guest.call("take", ()).unwrap();
        let value = guest.value(handle(exn)).unwrap();
        assert_eq!(value.as_error(), Some(&HostException::error("boom")));

        // The closure survives its own throw.
        guest.call::<_, i32>("apply", (c, arg.to_abi())).unwrap();
        assert_eq!(guest.call::<(), i32>("status", ()).unwrap(), STATUS_THREW);
        assert!(guest.drop_closure(handle(c)).unwrap());
        assert_eq!(guest.call::<(), i32>("destroyed", ()).unwrap(), 1);
    });
}

#[test]
fn throw_from_host_invoked_closure_propagates() {
    with_guest(&fixture(), |guest| {
        let c: i32 = guest.call("make_thrower", ()).unwrap();
        // A direct host invocation has no error channel around it.
        let err = guest.invoke_closure(handle(c), HostValue::Null).unwrap_err();
        assert!(matches!(err, BridgeError::GuestThrow(message) if message == "boom"));
        assert!(guest.bridge().exn.is_empty());
    });
}

#[test]
fn instance_debug_names_its_configuration() {
    let config = BridgeConfig {
        fuel: Some(500),
        ..BridgeConfig::default()
    };
    let mut rt = runtime(config);
    let guest = rt.init_sync(&fixture()).unwrap();
    let rendered = format!("{guest:?}");
    assert!(rendered.starts_with("GuestInstance"));
    assert!(rendered.contains("fuel: Some(500)"));
    assert!(format!("{rt:?}").contains("initialised: true"));
}

#[test]
fn host_function_called_from_guest() {
    with_guest(&fixture(), |guest| {
        let double = guest.allocate(HostValue::function("double", |args| {
            let n = args.first().and_then(HostValue::as_f64).unwrap_or(0.0);
            Ok(HostValue::Number(n * 2.0))
        }));
        let arg = guest.allocate(HostValue::Number(21.0));
        let ret: i32 = guest.call("apply", (double.to_abi(), arg.to_abi())).unwrap();
        assert_eq!(guest.call::<(), i32>("status", ()).unwrap(), STATUS_OK);
        assert_eq!(guest.value(handle(ret)).unwrap().as_f64(), Some(42.0));
    });
}

#[test]
fn reflect_get_reports_status() {
    with_guest(&fixture(), |guest| {
        let object = HostValue::object();
        tether_bridge::value::reflect_set(&object, &HostValue::string("k"), HostValue::Number(1.0))
            .unwrap();
        let target = guest.allocate(object);
        let key = guest.allocate(HostValue::string("k"));
        let status: i32 = guest.call("lookup", (target.to_abi(), key.to_abi())).unwrap();
        assert_eq!(status, STATUS_OK);

        let status: i32 = guest
            .call("lookup", (Handle::UNDEFINED.to_abi(), key.to_abi()))
            .unwrap();
        assert_eq!(status, STATUS_THREW);
    });
}

#[test]
fn exception_is_forwarded_to_guest_register() {
    with_guest(&fixture(), |guest| {
        let key = guest.allocate(HostValue::string("k"));
        let status: i32 = guest.call("lookup", (Handle::NULL.to_abi(), key.to_abi())).unwrap();
        assert_eq!(status, STATUS_THREW);
        assert!(guest.bridge().exn.is_empty());

        let exn: i32 = guest.call(EXN_LOAD_EXPORT, ()).unwrap();
        let value = guest.value(handle(exn)).unwrap();
        let exn = value.as_error().expect("error value");
        assert_eq!(exn.name, "TypeError");
    });
}

#[test]
fn exception_stays_in_host_slot_without_register() {
    let wasm = fixture_with(GuestBuilder::new().without_exn_register());

    with_guest(&wasm, |guest| {
        let key = guest.allocate(HostValue::string("k"));
        let status: i32 = guest.call("lookup", (Handle::NULL.to_abi(), key.to_abi())).unwrap();
        assert_eq!(status, STATUS_THREW);

        let exn: i32 = guest.call("take", ()).unwrap();
        assert_ne!(exn, Handle::UNDEFINED.to_abi());
        let value = guest.value(handle(exn)).unwrap();
        assert_eq!(value.as_error().map(|e| e.name.as_str()), Some("TypeError"));

        // Slot is empty once taken.
        assert_eq!(guest.call::<(), i32>("take", ()).unwrap(), Handle::UNDEFINED.to_abi());
    });

    with_guest(&wasm, |guest| {
        let callee = guest.allocate(HostValue::Number(3.0));
        let status_ret: i32 = guest.call("apply", (callee.to_abi(), callee.to_abi())).unwrap();
        assert_eq!(status_ret, Handle::UNDEFINED.to_abi());
        assert_eq!(guest.call::<(), i32>("status", ()).unwrap(), STATUS_THREW);
        let exn = guest.take_exception().expect("pending exception");
        assert_eq!(exn, HostException::type_error("3 is not a function"));
    });
}

// ══════════════════════════════════════════════════════════════════════════════
// Initialisation
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn init_is_idempotent() {
    let mut rt = runtime(BridgeConfig::default());
    let marker = rt
        .init_sync(&fixture())
        .unwrap()
        .allocate(HostValue::string("first"));

    let again = rt.init_sync(&fixture()).unwrap();
    assert_eq!(again.value(marker).unwrap().as_str(), Some("first"));

    let other = GuestBuilder::new().build().unwrap();
    let still = rt.init_sync(&other).unwrap();
    assert_eq!(still.value(marker).unwrap().as_str(), Some("first"));
    assert_eq!(still.call::<(), i32>("answer", ()).unwrap(), 42);
}

#[test]
fn start_export_runs_once() {
    let mut b = GuestBuilder::new();
    // __tether_start: *200 += 1
    let start = body(&[
        Instruction::I32Const(200),
        Instruction::I32Const(200),
        Instruction::I32Load(memarg(0, 2)),
        Instruction::I32Const(1),
        Instruction::I32Add,
        Instruction::I32Store(memarg(0, 2)),
    ]);
    let name = b.abi().start.clone();
    b.export_function(&name, &[], &[], start).unwrap();
    let starts = body(&[Instruction::I32Const(200), Instruction::I32Load(memarg(0, 2))]);
    b.export_function("starts", &[], &[I32], starts).unwrap();
    let wasm = b.build().unwrap();

    let mut rt = runtime(BridgeConfig::default());
    rt.init_sync(&wasm).unwrap();
    let guest = rt.init_sync(&wasm).unwrap();
    assert_eq!(guest.call::<(), i32>("starts", ()).unwrap(), 1);
}

#[tokio::test]
async fn init_from_bytes() {
    let mut rt = runtime(BridgeConfig::default());
    let guest = rt.init(fixture()).await.unwrap();
    assert_eq!(guest.call::<(), i32>("answer", ()).unwrap(), 42);
}

#[tokio::test]
async fn init_from_path() {
    let path = std::env::temp_dir().join(format!("tether-fixture-{}.wasm", std::process::id()));
    std::fs::write(&path, fixture()).unwrap();

    let mut rt = runtime(BridgeConfig::default());
    let answer = rt
        .init(path.clone())
        .await
        .unwrap()
        .call::<(), i32>("answer", ())
        .unwrap();
    assert_eq!(answer, 42);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn init_from_missing_path_is_io_error() {
    let mut rt = runtime(BridgeConfig::default());
    let err = rt
        .init(std::path::PathBuf::from("/definitely/not/here.wasm"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Io(_)));
    assert!(rt.guest().is_none());
}

#[tokio::test]
async fn init_from_reader() {
    let reader = std::io::Cursor::new(fixture());
    let mut rt = runtime(BridgeConfig::default());
    let guest = rt.init(ModuleSource::Reader(Box::new(reader))).await.unwrap();
    let h: i32 = guest.call("greet", ()).unwrap();
    assert_eq!(text(guest, h), "héllo 日本");
}

#[tokio::test]
async fn malformed_module_fails_to_compile() {
    let mut rt = runtime(BridgeConfig::default());
    let err = rt.init(b"not wasm".to_vec()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Compile(_)));
}

// ══════════════════════════════════════════════════════════════════════════════
// Fuel
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn fuel_stops_runaway_guest_and_refills() {
    let config = BridgeConfig {
        fuel: Some(100_000),
        ..BridgeConfig::default()
    };
    let mut rt = runtime(config);
    let guest = rt.init_sync(&fixture()).unwrap();
    assert!(guest.fuel().is_some());

    let err = guest.call::<(), ()>("spin", ()).unwrap_err();
    assert!(matches!(err, BridgeError::Guest(_)));

    assert_eq!(guest.call::<(), i32>("answer", ()).unwrap(), 42);
}
