//! Memory layout and index constants of generated guest modules.
//!
//! ```text
//! 0          SCRATCH_START      DATA_START            HEAP_START
//! | null page | out-param scratch | static data segments | bump heap ...
//! ```
//!
//! Function index space: the intrinsic imports in ABI order, then any extra
//! host imports, then the runtime helpers below, then caller-defined
//! functions.

use tether_types::abi::Intrinsic;

/// Size of a WASM page in bytes.
pub const PAGE_SIZE: u32 = 64 * 1024;

/// Initial linear memory size in pages.
pub const INITIAL_MEMORY_PAGES: u64 = 1;
/// Maximum linear memory pages (16 MiB).
pub const MAX_MEMORY_PAGES: u64 = 256;

/// Start of the scratch area guest code uses for out-parameters.
pub const SCRATCH_START: u32 = 16;
/// Start of static data.
pub const DATA_START: u32 = 256;
/// First byte handed out by the allocator.
pub const HEAP_START: u32 = 4096;

// ── Globals ──────────────────────────────────────────────────────────────────
// (order must match the global section emission in builder.rs)

/// Bump pointer: next free byte in linear memory.
pub const GLOBAL_HEAP_PTR: u32 = 0;
/// Exception register written by the host.
pub const GLOBAL_EXN: u32 = 1;

// ── Runtime helpers (offsets past the imports) ───────────────────────────────

/// `reserve(end: i32)`: grow memory until `end` is addressable.
pub const RT_RESERVE: u32 = 0;
/// `malloc(size: i32, align: i32) -> i32`
pub const RT_MALLOC: u32 = 1;
/// `realloc(ptr: i32, old: i32, new: i32, align: i32) -> i32`
pub const RT_REALLOC: u32 = 2;
/// `free(ptr: i32, size: i32, align: i32)`
pub const RT_FREE: u32 = 3;
/// `exn_store(handle: i32)`
pub const RT_EXN_STORE: u32 = 4;
/// `exn_load() -> i32`: read and clear the exception register.
pub const RT_EXN_LOAD: u32 = 5;
/// `invoke(shim: i32, a: i32, b: i32, arg: i32) -> i32`
pub const RT_INVOKE: u32 = 6;
/// `destroy(dtor: i32, a: i32, b: i32)`
pub const RT_DESTROY: u32 = 7;

/// Total number of runtime helper functions.
pub const RT_FUNC_COUNT: u32 = 8;

/// Export name of the exception register reader.
pub const EXN_LOAD_EXPORT: &str = "__tether_exn_load";

/// Number of intrinsic imports every guest declares.
pub const INTRINSIC_COUNT: u32 = Intrinsic::ALL.len() as u32;

/// Function index of an intrinsic import.
#[inline]
pub fn intrinsic_idx(intrinsic: Intrinsic) -> u32 {
    intrinsic.import_index()
}
