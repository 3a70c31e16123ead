//! The runtime core: the in-process object graph representing compiled and
//! instantiated WebAssembly modules, the compartments that scope them, the
//! garbage collector that reclaims them, and the instantiation pipeline
//! that wires compiled object code into a compartment.
//!
//! The decoder/validator, the compiler that lowers IR to object code, and
//! the loader that resolves its symbols are external; this crate consumes
//! them through the [`JitCompiler`] boundary and exposes the intrinsics
//! guest code calls back into.

#![deny(missing_docs)]

mod compartment;
mod context;
mod error;
mod exception;
mod func;
mod gc;
mod global;
mod instantiate;
mod jit;
mod jit_function_registry;
mod memory;
mod mmap;
mod module;
mod object;
mod table;
mod vmcontext;

pub mod intrinsics;

pub use crate::compartment::{clone_compartment, Compartment};
pub use crate::context::Context;
pub use crate::error::RuntimeError;
pub use crate::exception::ExceptionType;
pub use crate::func::{invoke, Function};
pub use crate::gc::collect_garbage;
pub use crate::global::Global;
pub use crate::instantiate::{instantiate_module, ImportBindings};
pub use crate::jit::{
    FunctionBinding, GlobalBinding, InvokeThunk, JitCompiler, JitFunction, JitFunctionData,
    JitFunctionKind, LoadedJitModule, MemoryBinding, ModuleBindings, TableBinding,
};
pub use crate::jit_function_registry::jit_function_by_address;
pub use crate::memory::Memory;
pub use crate::module::{Module, ModuleInstance};
pub use crate::object::{GcHeader, GcObject, Object, ObjectAddr, ObjectKind, Root};
pub use crate::table::{reference_bias, Table};
pub use crate::vmcontext::{
    mutable_global_ptr, VMAnyFunc, VMCompartmentData, VMContextData, VMFunctionBody,
    VMTableElement, MAX_CONTEXTS, MAX_MEMORIES, MAX_MUTABLE_GLOBALS, MAX_TABLES,
    TABLE_DEFAULT_RESERVED_ELEMENTS, WASM_MAX_PAGES, WASM_PAGE_SIZE,
};
