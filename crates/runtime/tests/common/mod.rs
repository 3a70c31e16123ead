//! Shared test support: a stub compiler/loader and IR builders.
//!
//! The stub stands in for the external codegen backend. `compile` is a
//! stable byte encoding of the IR (so the determinism law is observable),
//! and `load` hands out caller-registered host entry points for defined
//! functions. Invoke thunks are provided for the handful of signatures the
//! suites call through.

#![allow(dead_code)]

use atoll_ir as ir;
use atoll_ir::{
    CallingConvention, DataSegment, DataSegmentMode, ElementSegment, ElementSegmentMode,
    EntityIndex, Export, FunctionType, GlobalDesc, GlobalType, InitializerExpression, MemoryType,
    SizeConstraints, TableType, UntaggedValue, ValueType,
};
use atoll_runtime::{
    InvokeThunk, JitCompiler, JitFunctionData, LoadedJitModule, ModuleBindings, VMContextData,
    VMFunctionBody,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A stand-in for the external compiler and loader.
pub struct StubCompiler {
    bodies: Mutex<HashMap<usize, usize>>,
}

impl StubCompiler {
    pub fn new() -> StubCompiler {
        StubCompiler {
            bodies: Mutex::new(HashMap::new()),
        }
    }

    /// Register the host entry point standing in for the compiled code of
    /// defined function `def_index`.
    pub fn define_function(&self, def_index: usize, entry: usize) {
        self.bodies.lock().unwrap().insert(def_index, entry);
    }
}

impl JitCompiler for StubCompiler {
    fn compile(&self, module: &ir::Module) -> Vec<u8> {
        serde_json::to_vec(module).expect("module IR should serialize")
    }

    fn load(
        &self,
        object_code: &[u8],
        _bindings: ModuleBindings,
    ) -> anyhow::Result<(LoadedJitModule, Vec<JitFunctionData>)> {
        let module: ir::Module = serde_json::from_slice(object_code)?;
        let bodies = self.bodies.lock().unwrap();
        let mut functions = Vec::new();
        for def_index in 0..module.num_defined_funcs() {
            // Functions with no registered host body get a unique dummy
            // code span so address attribution still works.
            let base_address = bodies
                .get(&def_index)
                .copied()
                .unwrap_or_else(|| Box::leak(Box::new([0u8; 16])).as_ptr() as usize);
            functions.push(JitFunctionData {
                base_address,
                num_bytes: 16,
                offset_to_op_index: BTreeMap::new(),
            });
        }
        let loaded: LoadedJitModule = Box::new(());
        Ok((loaded, functions))
    }

    fn invoke_thunk(
        &self,
        ty: &FunctionType,
        calling_convention: CallingConvention,
    ) -> anyhow::Result<InvokeThunk> {
        use ValueType::{I32, I64};
        let thunk: InvokeThunk = match (calling_convention, ty.params(), ty.results()) {
            (CallingConvention::Wasm, [], []) => thunk_nullary_void,
            (CallingConvention::Wasm, [], [I32]) => thunk_nullary_i32,
            (CallingConvention::Intrinsic, [], []) => thunk_nullary_void,
            (CallingConvention::Intrinsic, [], [I32]) => thunk_nullary_i32,
            (CallingConvention::Intrinsic, [I32, I64], [I32]) => thunk_i32_i64_to_i32,
            (CallingConvention::Intrinsic, [I64], [I32]) => thunk_i64_to_i32,
            _ => anyhow::bail!(
                "stub compiler has no invoke thunk for {} with convention {:?}",
                ty,
                calling_convention
            ),
        };
        Ok(thunk)
    }

    fn intrinsic_thunk(
        &self,
        native_function: *const VMFunctionBody,
        _ty: &FunctionType,
        _calling_convention: CallingConvention,
    ) -> anyhow::Result<*const VMFunctionBody> {
        Ok(native_function)
    }
}

unsafe extern "C" fn thunk_nullary_void(
    body: *const VMFunctionBody,
    context: *mut VMContextData,
    _buffer: *mut UntaggedValue,
) {
    let f: unsafe extern "C" fn(*mut VMContextData) = std::mem::transmute(body);
    f(context);
}

unsafe extern "C" fn thunk_nullary_i32(
    body: *const VMFunctionBody,
    context: *mut VMContextData,
    buffer: *mut UntaggedValue,
) {
    let f: unsafe extern "C" fn(*mut VMContextData) -> i32 = std::mem::transmute(body);
    let result = f(context);
    (*buffer).set_i32(result);
}

unsafe extern "C" fn thunk_i32_i64_to_i32(
    body: *const VMFunctionBody,
    context: *mut VMContextData,
    buffer: *mut UntaggedValue,
) {
    let f: unsafe extern "C" fn(*mut VMContextData, i32, i64) -> i32 = std::mem::transmute(body);
    let a0 = (*buffer).as_i32();
    let a1 = (*buffer.add(1)).as_i64();
    let result = f(context, a0, a1);
    (*buffer).set_i32(result);
}

unsafe extern "C" fn thunk_i64_to_i32(
    body: *const VMFunctionBody,
    context: *mut VMContextData,
    buffer: *mut UntaggedValue,
) {
    let f: unsafe extern "C" fn(*mut VMContextData, i64) -> i32 = std::mem::transmute(body);
    let a0 = (*buffer).as_i64();
    let result = f(context, a0);
    (*buffer).set_i32(result);
}

/// Host body for a `() -> (i32)` function returning 42.
pub unsafe extern "C" fn return_42(_context: *mut VMContextData) -> i32 {
    42
}

/// Host body for a `() -> ()` function.
pub unsafe extern "C" fn do_nothing(_context: *mut VMContextData) {}

//
// IR builders.
//

pub fn function_type(params: &[ValueType], results: &[ValueType]) -> FunctionType {
    FunctionType::new(params.to_vec(), results.to_vec())
}

/// Append a defined function of the given type; returns its combined index.
pub fn define_function(module: &mut ir::Module, ty: FunctionType) -> ir::FuncIndex {
    let type_index = module.types.push(ty);
    module.functions.push(type_index)
}

/// Append an imported function of the given type; must precede definitions.
pub fn import_function(module: &mut ir::Module, ty: FunctionType) -> ir::FuncIndex {
    assert_eq!(module.functions.len(), module.num_imported_funcs);
    let type_index = module.types.push(ty);
    let index = module.functions.push(type_index);
    module.num_imported_funcs += 1;
    index
}

pub fn memory_type(min: u64, max: Option<u64>) -> MemoryType {
    MemoryType {
        size: SizeConstraints { min, max },
        shared: false,
    }
}

pub fn define_memory(module: &mut ir::Module, min: u64, max: Option<u64>) -> ir::MemoryIndex {
    module.memories.push(memory_type(min, max))
}

pub fn table_type(min: u64, max: Option<u64>) -> TableType {
    TableType {
        element_type: ir::ReferenceType::AnyFunc,
        size: SizeConstraints { min, max },
        shared: false,
    }
}

pub fn define_table(module: &mut ir::Module, min: u64, max: Option<u64>) -> ir::TableIndex {
    module.tables.push(table_type(min, max))
}

pub fn import_global(module: &mut ir::Module, value_type: ValueType, mutable: bool) -> ir::GlobalIndex {
    assert_eq!(module.globals.len(), module.num_imported_globals);
    let index = module.globals.push(GlobalDesc {
        ty: GlobalType {
            value_type,
            mutable,
        },
        initializer: InitializerExpression::Import,
    });
    module.num_imported_globals += 1;
    index
}

pub fn define_global(
    module: &mut ir::Module,
    value_type: ValueType,
    mutable: bool,
    initializer: InitializerExpression,
) -> ir::GlobalIndex {
    module.globals.push(GlobalDesc {
        ty: GlobalType {
            value_type,
            mutable,
        },
        initializer,
    })
}

pub fn export(module: &mut ir::Module, name: &str, entity: EntityIndex) {
    module.exports.push(Export {
        name: name.to_string(),
        entity,
    });
}

pub fn active_data_segment(
    module: &mut ir::Module,
    memory_index: ir::MemoryIndex,
    base_offset: InitializerExpression,
    data: Vec<u8>,
) {
    module.data_segments.push(DataSegment {
        mode: DataSegmentMode::Active {
            memory_index,
            base_offset,
        },
        data,
    });
}

pub fn passive_data_segment(module: &mut ir::Module, data: Vec<u8>) {
    module.data_segments.push(DataSegment {
        mode: DataSegmentMode::Passive,
        data,
    });
}

pub fn active_element_segment(
    module: &mut ir::Module,
    table_index: ir::TableIndex,
    base_offset: InitializerExpression,
    indices: Vec<ir::FuncIndex>,
) {
    module.element_segments.push(ElementSegment {
        mode: ElementSegmentMode::Active {
            table_index,
            base_offset,
        },
        indices,
    });
}

pub fn passive_element_segment(module: &mut ir::Module, indices: Vec<ir::FuncIndex>) {
    module.element_segments.push(ElementSegment {
        mode: ElementSegmentMode::Passive,
        indices,
    });
}
