//! Guest module assembler.
//!
//! Builds a module that imports every bridge intrinsic, carries the runtime
//! helpers from [`crate::runtime`], and exports them under the names in
//! [`AbiNames`]. Callers add their own functions, function-table entries
//! (closure bodies and destructors) and static data, then call
//! [`GuestBuilder::build`], which validates the result with `wasmparser`.

use std::borrow::Cow;
use std::collections::HashSet;

use tether_types::abi::{AbiType, Intrinsic};
use tether_types::{AbiNames, GuestStr};
use tracing::debug;
use wasm_encoder::{
    CodeSection, ConstExpr, ElementSection, Elements, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, MemorySection,
    MemoryType, Module, RefType, TableSection, TableType, TypeSection, ValType,
};

use crate::error::{GuestError, GuestResult};
use crate::runtime;
use crate::types::*;

/// Signature of a closure body in the function table: `(a, b, arg) -> ret`.
pub const SHIM_PARAMS: [ValType; 3] = [ValType::I32, ValType::I32, ValType::I32];
/// Signature of a closure destructor in the function table: `(a, b)`.
pub const DTOR_PARAMS: [ValType; 2] = [ValType::I32, ValType::I32];

fn val_type(ty: AbiType) -> ValType {
    match ty {
        AbiType::I32 => ValType::I32,
        AbiType::F64 => ValType::F64,
    }
}

/// Deduplicating function type table.
#[derive(Default)]
struct TypeTable {
    sigs: Vec<(Vec<ValType>, Vec<ValType>)>,
}

impl TypeTable {
    fn index(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        if let Some(i) = self
            .sigs
            .iter()
            .position(|(p, r)| p.as_slice() == params && r.as_slice() == results)
        {
            return i as u32;
        }
        self.sigs.push((params.to_vec(), results.to_vec()));
        (self.sigs.len() - 1) as u32
    }

    fn emit(&self) -> TypeSection {
        let mut types = TypeSection::new();
        for (params, results) in &self.sigs {
            types
                .ty()
                .function(params.iter().copied(), results.iter().copied());
        }
        types
    }
}

struct HostImport {
    module: String,
    name: String,
    type_idx: u32,
}

struct DefinedFunction {
    type_idx: u32,
    body: Function,
    export: Option<String>,
}

/// Assembles a guest module.
pub struct GuestBuilder {
    abi: AbiNames,
    types: TypeTable,
    imports: Vec<HostImport>,
    functions: Vec<DefinedFunction>,
    table: Vec<u32>,
    data: Vec<(u32, Vec<u8>)>,
    data_cursor: u32,
    exports: HashSet<String>,
    exn_register: bool,
    max_pages: Option<u64>,
    /// Set once any function index past the imports has been handed out.
    sealed: bool,
}

impl Default for GuestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestBuilder {
    pub fn new() -> Self {
        Self::with_abi(AbiNames::default())
    }

    /// A builder whose imports and exports use the given names.
    pub fn with_abi(abi: AbiNames) -> Self {
        let mut types = TypeTable::default();
        for intrinsic in Intrinsic::ALL {
            let params: Vec<ValType> = intrinsic.params().iter().copied().map(val_type).collect();
            let results: Vec<ValType> = intrinsic.results().iter().copied().map(val_type).collect();
            types.index(&params, &results);
        }
        Self {
            abi,
            types,
            imports: Vec::new(),
            functions: Vec::new(),
            table: Vec::new(),
            data: Vec::new(),
            data_cursor: DATA_START,
            exports: HashSet::new(),
            exn_register: true,
            max_pages: Some(MAX_MEMORY_PAGES),
            sealed: false,
        }
    }

    pub fn abi(&self) -> &AbiNames {
        &self.abi
    }

    /// Leave the exception register unexported, so the host keeps captured
    /// exceptions in its own slot for `exn_take`.
    pub fn without_exn_register(mut self) -> Self {
        self.exn_register = false;
        self
    }

    /// Cap linear memory at `pages` (or leave it unbounded with `None`).
    pub fn max_memory_pages(mut self, pages: Option<u64>) -> Self {
        self.max_pages = pages;
        self
    }

    /// Declare an extra host import; returns its function index.
    ///
    /// Must be called before any function index past the imports is requested.
    pub fn import(
        &mut self,
        module: &str,
        name: &str,
        params: &[ValType],
        results: &[ValType],
    ) -> GuestResult<u32> {
        if self.sealed {
            return Err(GuestError::ImportAfterFunctions {
                module: module.to_string(),
                name: name.to_string(),
            });
        }
        let type_idx = self.types.index(params, results);
        self.imports.push(HostImport {
            module: module.to_string(),
            name: name.to_string(),
            type_idx,
        });
        Ok(INTRINSIC_COUNT + self.imports.len() as u32 - 1)
    }

    /// Function index of an intrinsic import.
    pub fn intrinsic(&self, intrinsic: Intrinsic) -> u32 {
        intrinsic_idx(intrinsic)
    }

    fn import_count(&self) -> u32 {
        INTRINSIC_COUNT + self.imports.len() as u32
    }

    /// Function index of a runtime helper (`RT_*`).
    pub fn runtime(&mut self, rt_offset: u32) -> u32 {
        self.sealed = true;
        runtime::rt_func_idx(self.import_count(), rt_offset)
    }

    /// Index the next added function will get.
    pub fn next_function_index(&mut self) -> u32 {
        self.sealed = true;
        self.import_count() + RT_FUNC_COUNT + self.functions.len() as u32
    }

    /// Add an internal function; returns its function index.
    pub fn add_function(&mut self, params: &[ValType], results: &[ValType], body: Function) -> u32 {
        let idx = self.next_function_index();
        let type_idx = self.types.index(params, results);
        self.functions.push(DefinedFunction {
            type_idx,
            body,
            export: None,
        });
        idx
    }

    /// Add an exported function; returns its function index.
    pub fn export_function(
        &mut self,
        name: &str,
        params: &[ValType],
        results: &[ValType],
        body: Function,
    ) -> GuestResult<u32> {
        self.claim_export(name)?;
        let idx = self.add_function(params, results, body);
        if let Some(f) = self.functions.last_mut() {
            f.export = Some(name.to_string());
        }
        Ok(idx)
    }

    /// Add a closure body `(a, b, arg) -> ret` and place it in the function
    /// table; returns its table index.
    pub fn add_shim(&mut self, body: Function) -> u32 {
        let idx = self.add_function(&SHIM_PARAMS, &[ValType::I32], body);
        self.push_table(idx)
    }

    /// Add a closure destructor `(a, b)` and place it in the function table;
    /// returns its table index.
    pub fn add_destructor(&mut self, body: Function) -> u32 {
        let idx = self.add_function(&DTOR_PARAMS, &[], body);
        self.push_table(idx)
    }

    /// Place an existing function in the function table; returns its table index.
    pub fn add_table_function(&mut self, func_idx: u32) -> GuestResult<u32> {
        let defined_end = self.import_count() + RT_FUNC_COUNT + self.functions.len() as u32;
        if func_idx >= defined_end {
            return Err(GuestError::UnknownFunction(func_idx));
        }
        Ok(self.push_table(func_idx))
    }

    fn push_table(&mut self, func_idx: u32) -> u32 {
        self.table.push(func_idx);
        (self.table.len() - 1) as u32
    }

    /// Place `bytes` in static memory; returns their address.
    pub fn data(&mut self, bytes: &[u8]) -> GuestResult<u32> {
        let ptr = self.data_cursor.next_multiple_of(8);
        let available = HEAP_START.saturating_sub(ptr);
        if bytes.len() > available as usize {
            return Err(GuestError::DataOverflow {
                len: bytes.len(),
                available,
            });
        }
        self.data_cursor = ptr + bytes.len() as u32;
        self.data.push((ptr, bytes.to_vec()));
        Ok(ptr)
    }

    /// Place UTF-8 text in static memory.
    pub fn data_str(&mut self, text: &str) -> GuestResult<GuestStr> {
        let ptr = self.data(text.as_bytes())?;
        Ok(GuestStr {
            ptr,
            len: text.len() as u32,
        })
    }

    fn claim_export(&mut self, name: &str) -> GuestResult<()> {
        if !self.exports.insert(name.to_string()) {
            return Err(GuestError::DuplicateExport(name.to_string()));
        }
        Ok(())
    }

    /// Assemble, validate and return the module bytes.
    pub fn build(mut self) -> GuestResult<Vec<u8>> {
        let import_count = self.import_count();

        // Runtime helper signatures, in RT_* order.
        let i32x = |n: usize| vec![ValType::I32; n];
        let rt_types = [
            self.types.index(&i32x(1), &[]),
            self.types.index(&i32x(2), &i32x(1)),
            self.types.index(&i32x(4), &i32x(1)),
            self.types.index(&i32x(3), &[]),
            self.types.index(&i32x(1), &[]),
            self.types.index(&[], &i32x(1)),
            self.types.index(&i32x(4), &i32x(1)),
            self.types.index(&i32x(3), &[]),
        ];
        let shim_type = self.types.index(&SHIM_PARAMS, &[ValType::I32]);
        let dtor_type = self.types.index(&DTOR_PARAMS, &[]);

        let mut module = Module::new();

        // 1. Type section
        module.section(&self.types.emit());

        // 2. Import section
        let mut imports = ImportSection::new();
        for intrinsic in Intrinsic::ALL {
            imports.import(
                &self.abi.import_module,
                intrinsic.name(),
                EntityType::Function(intrinsic_type(&mut self.types, intrinsic)),
            );
        }
        for import in &self.imports {
            imports.import(&import.module, &import.name, EntityType::Function(import.type_idx));
        }
        module.section(&imports);

        // 3. Function + code sections
        let mut funcs = FunctionSection::new();
        let mut code = CodeSection::new();
        let helpers = [
            runtime::emit_reserve(),
            runtime::emit_malloc(import_count),
            runtime::emit_realloc(import_count),
            runtime::emit_free(),
            runtime::emit_exn_store(),
            runtime::emit_exn_load(),
            runtime::emit_invoke(shim_type),
            runtime::emit_destroy(dtor_type),
        ];
        for (type_idx, body) in rt_types.iter().zip(&helpers) {
            funcs.function(*type_idx);
            code.function(body);
        }
        for f in &self.functions {
            funcs.function(f.type_idx);
            code.function(&f.body);
        }
        module.section(&funcs);

        // 4. Table section
        let mut tables = TableSection::new();
        tables.table(TableType {
            element_type: RefType::FUNCREF,
            table64: false,
            minimum: self.table.len() as u64,
            maximum: Some(self.table.len() as u64),
            shared: false,
        });
        module.section(&tables);

        // 5. Memory section
        let mut memory = MemorySection::new();
        memory.memory(MemoryType {
            minimum: INITIAL_MEMORY_PAGES,
            maximum: self.max_pages,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memory);

        // 6. Global section (GLOBAL_HEAP_PTR, GLOBAL_EXN)
        let mut globals = GlobalSection::new();
        for init in [HEAP_START as i32, 0] {
            globals.global(
                GlobalType {
                    val_type: ValType::I32,
                    mutable: true,
                    shared: false,
                },
                &ConstExpr::i32_const(init),
            );
        }
        module.section(&globals);

        // 7. Export section
        let mut exports = ExportSection::new();
        exports.export(&self.abi.memory, ExportKind::Memory, 0);
        let mut rt_exports = vec![
            (self.abi.malloc.clone(), RT_MALLOC),
            (self.abi.realloc.clone(), RT_REALLOC),
            (self.abi.free.clone(), RT_FREE),
            (EXN_LOAD_EXPORT.to_string(), RT_EXN_LOAD),
            (self.abi.invoke.clone(), RT_INVOKE),
            (self.abi.destroy.clone(), RT_DESTROY),
        ];
        if self.exn_register {
            rt_exports.push((self.abi.exn_store.clone(), RT_EXN_STORE));
        }
        for (name, rt_offset) in &rt_exports {
            self.claim_export(name)?;
            exports.export(name, ExportKind::Func, runtime::rt_func_idx(import_count, *rt_offset));
        }
        let first_defined = import_count + RT_FUNC_COUNT;
        for (i, f) in self.functions.iter().enumerate() {
            if let Some(name) = &f.export {
                exports.export(name, ExportKind::Func, first_defined + i as u32);
            }
        }
        module.section(&exports);

        // 8. Element section
        if !self.table.is_empty() {
            let mut elements = ElementSection::new();
            elements.active(
                Some(0),
                &ConstExpr::i32_const(0),
                Elements::Functions(Cow::Borrowed(&self.table)),
            );
            module.section(&elements);
        }

        // 9. Code section
        module.section(&code);

        // 10. Data section
        let mut data = wasm_encoder::DataSection::new();
        for (offset, bytes) in &self.data {
            data.active(0, &ConstExpr::i32_const(*offset as i32), bytes.iter().copied());
        }
        module.section(&data);

        let wasm_bytes = module.finish();

        // 11. Validate
        wasmparser::validate(&wasm_bytes)
            .map_err(|e| GuestError::ValidationFailed(format!("{e}")))?;

        debug!(
            bytes = wasm_bytes.len(),
            functions = self.functions.len(),
            table = self.table.len(),
            "built guest module"
        );
        Ok(wasm_bytes)
    }
}

fn intrinsic_type(types: &mut TypeTable, intrinsic: Intrinsic) -> u32 {
    let params: Vec<ValType> = intrinsic.params().iter().copied().map(val_type).collect();
    let results: Vec<ValType> = intrinsic.results().iter().copied().map(val_type).collect();
    types.index(&params, &results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_table_deduplicates() {
        let mut types = TypeTable::default();
        let a = types.index(&[ValType::I32], &[]);
        let b = types.index(&[ValType::F64], &[ValType::I32]);
        assert_eq!(types.index(&[ValType::I32], &[]), a);
        assert_ne!(a, b);
    }

    #[test]
    fn imports_after_functions_are_rejected() {
        let mut b = GuestBuilder::new();
        b.import("env", "early", &[], &[]).unwrap();
        b.next_function_index();
        assert!(matches!(
            b.import("env", "late", &[], &[]),
            Err(GuestError::ImportAfterFunctions { .. })
        ));
    }

    #[test]
    fn data_is_aligned_and_bounded() {
        let mut b = GuestBuilder::new();
        let first = b.data(b"abc").unwrap();
        let second = b.data(b"de").unwrap();
        assert_eq!(first, DATA_START);
        assert_eq!(second, DATA_START + 8);
        let too_big = vec![0u8; HEAP_START as usize];
        assert!(matches!(b.data(&too_big), Err(GuestError::DataOverflow { .. })));
    }
}
