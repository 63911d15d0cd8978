//! Runtime helper functions emitted into every guest module.
//!
//! These are the guest half of the bridge ABI: the allocator the host uses to
//! place strings, the exception register, and the trampolines through which
//! the host invokes and destroys closures stored in the function table.
//! Every helper is registered during module assembly (in `builder.rs`) at
//! `import_count + RT_*`.

use wasm_encoder::{BlockType, Function, Instruction, ValType};

use crate::types::*;

/// Absolute function index of a runtime helper.
#[inline]
pub const fn rt_func_idx(import_count: u32, rt_offset: u32) -> u32 {
    import_count + rt_offset
}

/// Emit `reserve(end: i32)`.
///
/// Grows memory by enough whole pages that byte `end - 1` is addressable.
/// Traps when the memory cannot grow.
pub fn emit_reserve() -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 1: bytes
    // bytes = memory.size * PAGE_SIZE
    f.instruction(&Instruction::MemorySize(0));
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32Shl);
    f.instruction(&Instruction::LocalSet(1));
    // if end > bytes
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32GtU);
    f.instruction(&Instruction::If(BlockType::Empty));
    // pages = (end - bytes + PAGE_SIZE - 1) >> 16
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::I32Const((PAGE_SIZE - 1) as i32));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32ShrU);
    f.instruction(&Instruction::MemoryGrow(0));
    f.instruction(&Instruction::I32Const(-1));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    f
}

/// Emit `malloc(size: i32, align: i32) -> i32`.
///
/// Bump allocator. An alignment of zero is treated as one.
pub fn emit_malloc(import_count: u32) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 2: ptr
    // if align == 0 { align = 1 }
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Eqz);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::LocalSet(1));
    f.instruction(&Instruction::End);
    // ptr = (heap_ptr + align - 1) & -align
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::LocalSet(2));
    // reserve(ptr + size)
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::Call(rt_func_idx(import_count, RT_RESERVE)));
    // heap_ptr = ptr + size
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalSet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::End);
    f
}

/// Emit `realloc(ptr: i32, old: i32, new: i32, align: i32) -> i32`.
///
/// The most recent allocation is resized in place; anything else is moved to
/// a fresh block holding `min(old, new)` bytes of the original.
pub fn emit_realloc(import_count: u32) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]); // local 4: fresh
    // if ptr + old == heap_ptr
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
    {
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::LocalGet(2));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::Call(rt_func_idx(import_count, RT_RESERVE)));
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::LocalGet(2));
        f.instruction(&Instruction::I32Add);
        f.instruction(&Instruction::GlobalSet(GLOBAL_HEAP_PTR));
        f.instruction(&Instruction::LocalGet(0));
    }
    f.instruction(&Instruction::Else);
    {
        // fresh = malloc(new, align)
        f.instruction(&Instruction::LocalGet(2));
        f.instruction(&Instruction::LocalGet(3));
        f.instruction(&Instruction::Call(rt_func_idx(import_count, RT_MALLOC)));
        f.instruction(&Instruction::LocalSet(4));
        // memory.copy(fresh, ptr, min(old, new))
        f.instruction(&Instruction::LocalGet(4));
        f.instruction(&Instruction::LocalGet(0));
        f.instruction(&Instruction::LocalGet(1));
        f.instruction(&Instruction::LocalGet(2));
        f.instruction(&Instruction::LocalGet(1));
        f.instruction(&Instruction::LocalGet(2));
        f.instruction(&Instruction::I32LtU);
        f.instruction(&Instruction::Select);
        f.instruction(&Instruction::MemoryCopy {
            src_mem: 0,
            dst_mem: 0,
        });
        f.instruction(&Instruction::LocalGet(4));
    }
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    f
}

/// Emit `free(ptr: i32, size: i32, align: i32)`.
///
/// Only the most recent allocation is reclaimed.
pub fn emit_free() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::GlobalSet(GLOBAL_HEAP_PTR));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    f
}

/// Emit `exn_store(handle: i32)`.
pub fn emit_exn_store() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::GlobalSet(GLOBAL_EXN));
    f.instruction(&Instruction::End);
    f
}

/// Emit `exn_load() -> i32`, which also clears the register.
pub fn emit_exn_load() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::GlobalGet(GLOBAL_EXN));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::GlobalSet(GLOBAL_EXN));
    f.instruction(&Instruction::End);
    f
}

/// Emit `invoke(shim: i32, a: i32, b: i32, arg: i32) -> i32`.
///
/// Calls table entry `shim` as `(a, b, arg) -> ret`.
pub fn emit_invoke(shim_type: u32) -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::CallIndirect {
        type_index: shim_type,
        table_index: 0,
    });
    f.instruction(&Instruction::End);
    f
}

/// Emit `destroy(dtor: i32, a: i32, b: i32)`.
///
/// Calls table entry `dtor` as `(a, b)`.
pub fn emit_destroy(dtor_type: u32) -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::CallIndirect {
        type_index: dtor_type,
        table_index: 0,
    });
    f.instruction(&Instruction::End);
    f
}

/// A `MemArg` for memory 0.
pub fn memarg(offset: u64, align: u32) -> wasm_encoder::MemArg {
    wasm_encoder::MemArg {
        offset,
        align,
        memory_index: 0,
    }
}
