//! The intrinsics the core exposes to guest code.
//!
//! Every compartment carries a fixed module instance named
//! `wavmIntrinsics` whose exports are host entry points compiled code
//! calls back into: memory and table growth, table copies, and the
//! exception-throw entry. Each entry is `pub extern "C"`, takes the current
//! context's runtime-data pointer as its hidden first argument, and only
//! carries flat integer parameters that are safe to pass across the system
//! ABI. Resource identities travel as the compartment-scoped ids compiled
//! code already holds.

use crate::compartment::Compartment;
use crate::error::fatal;
use crate::exception::ExceptionType;
use crate::func::Function;
use crate::gc;
use crate::module::ModuleInstance;
use crate::object::{ObjectAddr, ObjectEdge, Root};
use crate::vmcontext::{VMContextData, VMFunctionBody};
use atoll_ir::{CallingConvention, FunctionType, ValueType};
use indexmap::IndexMap;
use std::sync::atomic::Ordering;

/// Resolve the compartment a context's runtime data belongs to.
unsafe fn compartment_from_context(context: *mut VMContextData) -> Option<Root<Compartment>> {
    let compartment_data = (*context).compartment_data();
    if compartment_data.is_null() {
        return None;
    }
    let addr = ObjectAddr((*compartment_data).compartment_object.load(Ordering::Acquire));
    gc::lookup_object::<Compartment>(addr)
}

/// Implementation of `memory.grow`. Returns the previous size in pages, or
/// `-1` if the memory cannot grow by `delta` pages.
pub unsafe extern "C" fn atoll_memory_grow(
    context: *mut VMContextData,
    delta: i32,
    memory_id: i64,
) -> i32 {
    let result = compartment_from_context(context)
        .and_then(|compartment| compartment.memory(memory_id as usize))
        .and_then(|memory| memory.grow(delta as u32 as u64));
    match result {
        Some(previous_pages) => previous_pages as i32,
        None => -1,
    }
}

/// Implementation of `memory.size`. Returns the current size in pages, or
/// `-1` if the id resolves to nothing.
pub unsafe extern "C" fn atoll_memory_size(context: *mut VMContextData, memory_id: i64) -> i32 {
    match compartment_from_context(context)
        .and_then(|compartment| compartment.memory(memory_id as usize))
    {
        Some(memory) => memory.num_pages() as i32,
        None => -1,
    }
}

/// Implementation of `table.grow`. Returns the previous size in elements,
/// or `-1` if the table cannot grow by `delta` elements.
pub unsafe extern "C" fn atoll_table_grow(
    context: *mut VMContextData,
    delta: i32,
    table_id: i64,
) -> i32 {
    let result = compartment_from_context(context)
        .and_then(|compartment| compartment.table(table_id as usize))
        .and_then(|table| table.grow(delta as u32 as u64));
    match result {
        Some(previous_elements) => previous_elements as i32,
        None => -1,
    }
}

/// Implementation of `table.size`. Returns the current size in elements,
/// or `-1` if the id resolves to nothing.
pub unsafe extern "C" fn atoll_table_size(context: *mut VMContextData, table_id: i64) -> i32 {
    match compartment_from_context(context)
        .and_then(|compartment| compartment.table(table_id as usize))
    {
        Some(table) => table.num_elements() as i32,
        None => -1,
    }
}

/// Implementation of `table.copy`: copy `num_elements` slots from `src` to
/// `dst` within one table. Returns `0`, or `-1` when either range is out
/// of bounds.
pub unsafe extern "C" fn atoll_table_copy(
    context: *mut VMContextData,
    dst: i32,
    src: i32,
    num_elements: i32,
    table_id: i64,
) -> i32 {
    let result = compartment_from_context(context)
        .and_then(|compartment| compartment.table(table_id as usize))
        .map(|table| {
            table.copy(
                dst as u32 as u64,
                src as u32 as u64,
                num_elements as u32 as u64,
            )
        });
    match result {
        Some(Ok(())) => 0,
        _ => -1,
    }
}

/// The exception-throw entry. Unwinding is owned by the external exception
/// machinery; with none installed, an unhandled guest throw is fatal.
pub unsafe extern "C" fn atoll_throw_exception(
    _context: *mut VMContextData,
    exception_type: i64,
    arguments: i64,
) -> ! {
    let type_name = gc::lookup_object::<ExceptionType>(ObjectAddr(exception_type as usize))
        .map(|exception_type| exception_type.debug_name().to_string())
        .unwrap_or_else(|| "<unknown exception type>".to_string());
    fatal(&format!(
        "unhandled guest exception of type {} (arguments at {:#x})",
        type_name, arguments,
    ))
}

fn intrinsic_exports() -> Vec<(&'static str, FunctionType, *const VMFunctionBody)> {
    use ValueType::{I32, I64};
    vec![
        (
            "memory.grow",
            FunctionType::new([I32, I64], [I32]),
            atoll_memory_grow as usize as *const VMFunctionBody,
        ),
        (
            "memory.size",
            FunctionType::new([I64], [I32]),
            atoll_memory_size as usize as *const VMFunctionBody,
        ),
        (
            "table.grow",
            FunctionType::new([I32, I64], [I32]),
            atoll_table_grow as usize as *const VMFunctionBody,
        ),
        (
            "table.size",
            FunctionType::new([I64], [I32]),
            atoll_table_size as usize as *const VMFunctionBody,
        ),
        (
            "table.copy",
            FunctionType::new([I32, I32, I32, I64], [I32]),
            atoll_table_copy as usize as *const VMFunctionBody,
        ),
        (
            "throwException",
            FunctionType::new([I64, I64], []),
            atoll_throw_exception as usize as *const VMFunctionBody,
        ),
    ]
}

/// Build a compartment's `wavmIntrinsics` module instance.
pub(crate) fn instantiate_intrinsics_module(
    compartment: &Root<Compartment>,
) -> Root<ModuleInstance> {
    let instance = ModuleInstance::new(compartment, "wavmIntrinsics".to_string());

    let mut functions = Vec::new();
    let mut export_map = IndexMap::new();
    for (name, ty, entry) in intrinsic_exports() {
        let function = Function::new(
            instance.downgrade(),
            ty,
            entry,
            CallingConvention::Intrinsic,
            format!("wavmIntrinsics.{}", name),
        );
        export_map.insert(name.to_string(), ObjectEdge::Function(function.downgrade()));
        functions.push(function);
    }

    instance.publish(
        &functions,
        &[],
        &[],
        &[],
        &[],
        &[],
        None,
        None,
        None,
        export_map,
    );
    instance
}
