//! The instantiation pipeline: turns (compartment, compiled module, import
//! bindings) into a live module instance.
//!
//! The phases run in a fixed order and each one completes before the next
//! begins. Any failure aborts the whole pipeline with a typed error and
//! leaves no observable state in the compartment: objects created before
//! the failure are unreachable once the local pins drop and are reclaimed
//! by the next collection.

use crate::compartment::Compartment;
use crate::error::RuntimeError;
use crate::exception::ExceptionType;
use crate::func::Function;
use crate::global::Global;
use crate::jit::{
    FunctionBinding, GlobalBinding, JitCompiler, JitFunction, JitFunctionKind, MemoryBinding,
    ModuleBindings, TableBinding,
};
use crate::jit_function_registry;
use crate::memory::Memory;
use crate::module::{JitState, Module, ModuleInstance};
use crate::object::{Object, ObjectEdge, Root};
use crate::table::{self, Table};
use crate::vmcontext::VMFunctionBody;
use atoll_ir::{
    CallingConvention, DataSegmentMode, ElementSegmentMode, EntityIndex, EntityRef, FunctionType,
    InitializerExpression, Value,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Already-resolved imports, one vector per kind, in declaration order.
#[derive(Default)]
pub struct ImportBindings {
    /// Imported functions.
    pub functions: Vec<Root<Function>>,
    /// Imported tables.
    pub tables: Vec<Root<Table>>,
    /// Imported memories.
    pub memories: Vec<Root<Memory>>,
    /// Imported globals.
    pub globals: Vec<Root<Global>>,
    /// Imported exception types.
    pub exception_types: Vec<Root<ExceptionType>>,
}

fn link_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Link(message.into())
}

/// Evaluate an initializer expression under the given (possibly partially
/// populated) globals vector. The only non-constant form accepted is a
/// reference to a previously declared imported immutable global.
fn evaluate_initializer(
    globals: &[Root<Global>],
    num_imported_globals: usize,
    expression: &InitializerExpression,
) -> Result<Value, RuntimeError> {
    match *expression {
        InitializerExpression::I32Const(x) => Ok(Value::I32(x)),
        InitializerExpression::I64Const(x) => Ok(Value::I64(x)),
        InitializerExpression::F32Const(bits) => Ok(Value::F32(f32::from_bits(bits))),
        InitializerExpression::F64Const(bits) => Ok(Value::F64(f64::from_bits(bits))),
        InitializerExpression::V128Const(x) => Ok(Value::V128(x)),
        InitializerExpression::GetGlobal(index) => {
            let index = index.index();
            if index >= num_imported_globals || index >= globals.len() {
                return Err(link_error(format!(
                    "initializer references global {} which is not an imported global",
                    index
                )));
            }
            let global = &globals[index];
            if global.ty().mutable {
                return Err(link_error(format!(
                    "initializer references global {} which is mutable",
                    index
                )));
            }
            Ok(global.initial_value())
        }
        InitializerExpression::RefNull => Ok(Value::NullRef),
        InitializerExpression::Import => Err(link_error("invalid initializer expression")),
    }
}

fn evaluate_segment_base(
    globals: &[Root<Global>],
    num_imported_globals: usize,
    expression: &InitializerExpression,
) -> Result<u64, RuntimeError> {
    match evaluate_initializer(globals, num_imported_globals, expression)? {
        Value::I32(x) => Ok(x as u32 as u64),
        value => Err(link_error(format!(
            "segment base offset must be an i32, not {}",
            value.value_type()
        ))),
    }
}

/// Instantiate `module` in `compartment` with the given imports.
///
/// On success the returned instance has all definitions allocated, its
/// object code loaded and back-linked, exports published, active segments
/// copied, and passive segments retained. The start function, if declared,
/// is resolved but *not* invoked; the caller runs it in a context of its
/// choice.
pub fn instantiate_module(
    jit: &dyn JitCompiler,
    compartment: &Root<Compartment>,
    module: &Root<Module>,
    imports: ImportBindings,
    debug_name: &str,
) -> Result<Root<ModuleInstance>, RuntimeError> {
    let ir = module.ir();

    // Shell construction. The instance is registered in the compartment's
    // weak module set immediately; the local pins below keep everything
    // reachable until publication.
    let instance = ModuleInstance::new(compartment, debug_name.to_string());

    let mut functions = imports.functions;
    let mut tables = imports.tables;
    let mut memories = imports.memories;
    let mut globals = imports.globals;
    let mut exception_types = imports.exception_types;

    // Import type checking.
    check_import_counts(ir, &functions, &tables, &memories, &globals, &exception_types)?;
    for (index, import) in functions.iter().enumerate() {
        let declared = ir.func_type(atoll_ir::FuncIndex::new(index));
        if !import.ty().is_subtype_of(declared) {
            return Err(link_error(format!(
                "imported function {} has type {}, expected {}",
                index,
                import.ty(),
                declared
            )));
        }
    }
    for (index, import) in tables.iter().enumerate() {
        let declared = &ir.tables[atoll_ir::TableIndex::new(index)];
        if !import.ty().is_subtype_of(declared) {
            return Err(link_error(format!("imported table {} has an incompatible type", index)));
        }
    }
    for (index, import) in memories.iter().enumerate() {
        let declared = &ir.memories[atoll_ir::MemoryIndex::new(index)];
        if !import.ty().is_subtype_of(declared) {
            return Err(link_error(format!(
                "imported memory {} has an incompatible type",
                index
            )));
        }
    }
    for (index, import) in globals.iter().enumerate() {
        let declared = &ir.globals[atoll_ir::GlobalIndex::new(index)].ty;
        if !import.ty().is_subtype_of(declared) {
            return Err(link_error(format!(
                "imported global {} has an incompatible type",
                index
            )));
        }
    }
    for (index, import) in exception_types.iter().enumerate() {
        let declared = &ir.exception_types[atoll_ir::ExceptionTypeIndex::new(index)];
        if !import.ty().is_subtype_of(declared) {
            return Err(link_error(format!(
                "imported exception type {} has an incompatible type",
                index
            )));
        }
    }

    // Definition allocation: tables, then memories.
    for def_index in 0..ir.num_defined_tables() {
        let table_index = ir.table_index(def_index);
        let debug_name = ir
            .names
            .table_name(table_index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<table #{}>", table_index.index()));
        tables.push(Table::new(compartment, ir.tables[table_index], debug_name)?);
    }
    for def_index in 0..ir.num_defined_memories() {
        let memory_index = ir.memory_index(def_index);
        let debug_name = ir
            .names
            .memory_name(memory_index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<memory #{}>", memory_index.index()));
        memories.push(Memory::new(compartment, ir.memories[memory_index], debug_name)?);
    }

    // Default selection. A module has at most one memory and one table in
    // the current design.
    debug_assert!(memories.len() <= 1);
    debug_assert!(tables.len() <= 1);
    let default_memory = memories.first().cloned();
    let default_table = tables.first().cloned();

    // Global initialization, under the partially populated globals vector.
    for def_index in 0..ir.num_defined_globals() {
        let global_index = ir.global_index(def_index);
        let desc = ir.globals[global_index];
        let value = evaluate_initializer(&globals, ir.num_imported_globals, &desc.initializer)?;
        if !value.value_type().is_subtype_of(desc.ty.value_type) {
            return Err(link_error(format!(
                "global {} initialized with a value of type {}, expected {}",
                global_index.index(),
                value.value_type(),
                desc.ty.value_type
            )));
        }
        globals.push(Global::new(compartment, desc.ty, value)?);
    }

    // Exception-type instantiation.
    for def_index in 0..ir.num_defined_exception_types() {
        let index = ir.num_imported_exception_types + def_index;
        let ty = ir.exception_types[atoll_ir::ExceptionTypeIndex::new(index)].clone();
        exception_types.push(ExceptionType::new(
            ty,
            format!("<exception type #{}>", index),
        ));
    }

    // Function-instance allocation for the module's defined functions.
    let mut function_defs = Vec::with_capacity(ir.num_defined_funcs());
    for def_index in 0..ir.num_defined_funcs() {
        let func_index = ir.func_index(def_index);
        let debug_name = ir
            .names
            .function_name(func_index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<function #{}>", def_index));
        let function = Function::new(
            instance.downgrade(),
            ir.func_type(func_index).clone(),
            std::ptr::null(),
            CallingConvention::Wasm,
            debug_name,
        );
        function_defs.push(function.clone());
        functions.push(function);
    }

    // Symbol binding and load.
    let intrinsics_instance = compartment.intrinsics_instance();
    let mut intrinsic_exports = HashMap::new();
    for (name, object) in intrinsics_instance.exports() {
        let function = match &object {
            Object::Function(function) => function,
            _ => continue,
        };
        debug_assert_eq!(function.calling_convention(), CallingConvention::Intrinsic);
        intrinsic_exports.insert(
            name,
            FunctionBinding {
                native_function: function.native_function(),
            },
        );
    }

    let mut function_imports = Vec::with_capacity(ir.num_imported_funcs);
    for import in &functions[..ir.num_imported_funcs] {
        let mut native_function = import.native_function();
        if import.calling_convention() != CallingConvention::Wasm {
            native_function = jit
                .intrinsic_thunk(native_function, import.ty(), import.calling_convention())
                .map_err(|e| link_error(format!("failed to wrap imported function: {}", e)))?;
        }
        function_imports.push(FunctionBinding { native_function });
    }

    let bindings = ModuleBindings {
        intrinsic_exports,
        types: ir.types.values().cloned().collect(),
        function_imports,
        tables: tables.iter().map(|t| TableBinding { id: t.id() }).collect(),
        memories: memories.iter().map(|m| MemoryBinding { id: m.id() }).collect(),
        globals: globals
            .iter()
            .map(|g| match g.mutable_global_id() {
                Some(slot) => GlobalBinding::Mutable { slot },
                None => GlobalBinding::Immutable {
                    value: g.initial_value_ptr(),
                },
            })
            .collect(),
        exception_types: exception_types.iter().map(|e| e.addr()).collect(),
        default_memory: default_memory.as_ref().map(|m| MemoryBinding { id: m.id() }),
        default_table: default_table.as_ref().map(|t| TableBinding { id: t.id() }),
        table_reference_bias: table::reference_bias(),
    };
    let (loaded_module, jit_function_data) = jit
        .load(module.object_code(), bindings)
        .map_err(|e| link_error(format!("failed to load compiled module: {}", e)))?;
    if jit_function_data.len() != ir.num_defined_funcs() {
        return Err(link_error(format!(
            "loader reported {} compiled functions, expected {}",
            jit_function_data.len(),
            ir.num_defined_funcs()
        )));
    }

    // Definition back-linking: each defined function gets its compiled
    // entry, and the address map learns which instance each span belongs
    // to.
    let mut jit_functions = Vec::with_capacity(jit_function_data.len());
    for (function, data) in function_defs.iter().zip(&jit_function_data) {
        function.set_native_function(data.base_address as *const VMFunctionBody);
        let jit_function = Arc::new(JitFunction {
            kind: JitFunctionKind::WasmFunction {
                function: function.addr(),
            },
            base_address: data.base_address,
            num_bytes: data.num_bytes,
            offset_to_op_index: data.offset_to_op_index.clone(),
        });
        jit_function_registry::register(jit_function.clone());
        jit_functions.push(jit_function);
    }

    // Export publication.
    let mut export_map: IndexMap<String, ObjectEdge> = IndexMap::new();
    for export in &ir.exports {
        let edge = match export.entity {
            EntityIndex::Function(index) => functions
                .get(index.index())
                .map(|f| ObjectEdge::Function(f.downgrade())),
            EntityIndex::Table(index) => tables
                .get(index.index())
                .map(|t| ObjectEdge::Table(t.downgrade())),
            EntityIndex::Memory(index) => memories
                .get(index.index())
                .map(|m| ObjectEdge::Memory(m.downgrade())),
            EntityIndex::Global(index) => globals
                .get(index.index())
                .map(|g| ObjectEdge::Global(g.downgrade())),
            EntityIndex::ExceptionType(index) => exception_types
                .get(index.index())
                .map(|e| ObjectEdge::ExceptionType(e.downgrade())),
        }
        .ok_or_else(|| {
            link_error(format!(
                "export {} references an undefined entity",
                export.name
            ))
        })?;
        if export_map.insert(export.name.clone(), edge).is_some() {
            return Err(link_error(format!("duplicate export name {}", export.name)));
        }
    }

    // Active data-segment copy.
    for segment in &ir.data_segments {
        let (memory_index, base_offset) = match &segment.mode {
            DataSegmentMode::Active {
                memory_index,
                base_offset,
            } => (memory_index, base_offset),
            DataSegmentMode::Passive => continue,
        };
        let memory = memories
            .get(memory_index.index())
            .ok_or_else(|| link_error("data segment references an undefined memory"))?;
        let base = evaluate_segment_base(&globals, ir.num_imported_globals, base_offset)?;
        if !segment.data.is_empty() {
            memory.write(base, &segment.data)?;
        } else if base > memory.num_bytes() {
            // An empty segment still reports out-of-bounds when its base
            // lies past the end of memory.
            return Err(RuntimeError::OutOfBoundsMemoryAccess {
                memory: memory.debug_name().to_string(),
                address: base,
            });
        }
    }

    // Active table-segment copy.
    for segment in &ir.element_segments {
        let (table_index, base_offset) = match &segment.mode {
            ElementSegmentMode::Active {
                table_index,
                base_offset,
            } => (table_index, base_offset),
            ElementSegmentMode::Passive => continue,
        };
        let table = tables
            .get(table_index.index())
            .ok_or_else(|| link_error("element segment references an undefined table"))?;
        let base = evaluate_segment_base(&globals, ir.num_imported_globals, base_offset)?;
        if !segment.indices.is_empty() {
            for (offset, func_index) in segment.indices.iter().enumerate() {
                let function = functions
                    .get(func_index.index())
                    .ok_or_else(|| link_error("element segment references an undefined function"))?;
                table.set(base + offset as u64, Some(function))?;
            }
        } else if base > table.num_elements() {
            return Err(RuntimeError::OutOfBoundsTableAccess {
                table: table.debug_name().to_string(),
                index: base,
            });
        }
    }

    // Passive-segment retention.
    let mut passive_data_segments: HashMap<usize, Arc<[u8]>> = HashMap::new();
    for (segment_index, segment) in ir.data_segments.iter().enumerate() {
        if matches!(segment.mode, DataSegmentMode::Passive) {
            passive_data_segments.insert(segment_index, Arc::from(segment.data.as_slice()));
        }
    }
    let mut passive_element_segments: HashMap<usize, Arc<Vec<Weak<Function>>>> = HashMap::new();
    for (segment_index, segment) in ir.element_segments.iter().enumerate() {
        if matches!(segment.mode, ElementSegmentMode::Passive) {
            let segment_functions = segment
                .indices
                .iter()
                .map(|func_index| {
                    functions
                        .get(func_index.index())
                        .map(Root::downgrade)
                        .ok_or_else(|| {
                            link_error("element segment references an undefined function")
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            passive_element_segments.insert(segment_index, Arc::new(segment_functions));
        }
    }

    // Start function selection.
    let start_function = match ir.start_func {
        Some(index) => {
            let function = functions
                .get(index.index())
                .ok_or_else(|| link_error("start function index is out of range"))?
                .clone();
            if *function.ty() != FunctionType::empty() {
                return Err(link_error(format!(
                    "start function has type {}, expected () -> ()",
                    function.ty()
                )));
            }
            Some(function)
        }
        None => None,
    };

    instance.publish(
        &functions,
        &function_defs,
        &tables,
        &memories,
        &globals,
        &exception_types,
        start_function.as_ref(),
        default_memory.as_ref(),
        default_table.as_ref(),
        export_map,
    );
    instance.set_passive_data_segments(passive_data_segments);
    instance.set_passive_element_segments(passive_element_segments);
    instance.set_jit_state(JitState {
        loaded_module,
        functions: jit_functions,
    });

    log::debug!(
        "instantiated {}: {} functions, {} tables, {} memories, {} globals, {} exception types",
        instance.debug_name(),
        functions.len(),
        tables.len(),
        memories.len(),
        globals.len(),
        exception_types.len(),
    );
    Ok(instance)
}

fn check_import_counts(
    ir: &atoll_ir::Module,
    functions: &[Root<Function>],
    tables: &[Root<Table>],
    memories: &[Root<Memory>],
    globals: &[Root<Global>],
    exception_types: &[Root<ExceptionType>],
) -> Result<(), RuntimeError> {
    let check = |provided: usize, declared: usize, kind: &str| {
        if provided != declared {
            Err(link_error(format!(
                "{} {} imports provided, module declares {}",
                provided, kind, declared
            )))
        } else {
            Ok(())
        }
    };
    check(functions.len(), ir.num_imported_funcs, "function")?;
    check(tables.len(), ir.num_imported_tables, "table")?;
    check(memories.len(), ir.num_imported_memories, "memory")?;
    check(globals.len(), ir.num_imported_globals, "global")?;
    check(
        exception_types.len(),
        ir.num_imported_exception_types,
        "exception type",
    )?;
    Ok(())
}
