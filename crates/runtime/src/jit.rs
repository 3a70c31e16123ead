//! The boundary to the external compiler/loader.
//!
//! The core never generates code itself. It submits IR for compilation,
//! hands the resulting object bytes back to the loader together with a
//! `ModuleBindings` describing every external symbol the object code
//! references, and receives one `JitFunctionData` per defined function in
//! return. Thunks bridge calling conventions in both directions: invoke
//! thunks let the host enter compiled code, intrinsic thunks wrap non-wasm
//! entries so guest code can call them.

use crate::object::ObjectAddr;
use crate::vmcontext::{VMContextData, VMFunctionBody};
use atoll_ir as ir;
use atoll_ir::{CallingConvention, FunctionType, UntaggedValue};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};

/// The opaque handle to a loaded module's executable image. Dropping it
/// unloads the image; the module instance finalizer owns that drop.
pub type LoadedJitModule = Box<dyn Any + Send + Sync>;

/// An invoke thunk: enters a native entry of a fixed (type, calling
/// convention) pair, with arguments and results marshalled through an
/// untagged buffer sized `max(params, results)`.
pub type InvokeThunk =
    unsafe extern "C" fn(*const VMFunctionBody, *mut VMContextData, *mut UntaggedValue);

/// Binds an object-code function symbol to a native entry.
#[derive(Copy, Clone, Debug)]
pub struct FunctionBinding {
    /// The native entry point, in the wasm calling convention.
    pub native_function: *const VMFunctionBody,
}

/// Binds an object-code table symbol to a compartment table id.
#[derive(Copy, Clone, Debug)]
pub struct TableBinding {
    /// The table's compartment-scoped id.
    pub id: usize,
}

/// Binds an object-code memory symbol to a compartment memory id.
#[derive(Copy, Clone, Debug)]
pub struct MemoryBinding {
    /// The memory's compartment-scoped id.
    pub id: usize,
}

/// Binds an object-code global symbol to its storage.
#[derive(Copy, Clone, Debug)]
pub enum GlobalBinding {
    /// An immutable global: compiled code reads the stored value directly.
    Immutable {
        /// Pointer to the global's stored initial value.
        value: *const UntaggedValue,
    },
    /// A mutable global: compiled code indexes the current context's
    /// mutable-globals area.
    Mutable {
        /// The global's slot in the mutable-globals area.
        slot: u32,
    },
}

/// Everything the loader needs to bind a compiled module's undefined
/// symbols.
pub struct ModuleBindings {
    /// Intrinsic entries, keyed by symbolic name.
    pub intrinsic_exports: HashMap<String, FunctionBinding>,
    /// The module's full type vector.
    pub types: Vec<FunctionType>,
    /// One binding per imported function, already wrapped in an intrinsic
    /// thunk where the import's calling convention is not wasm.
    pub function_imports: Vec<FunctionBinding>,
    /// One binding per table, imports then definitions.
    pub tables: Vec<TableBinding>,
    /// One binding per memory, imports then definitions.
    pub memories: Vec<MemoryBinding>,
    /// One binding per global, imports then definitions.
    pub globals: Vec<GlobalBinding>,
    /// The identity of each exception type, imports then definitions.
    pub exception_types: Vec<ObjectAddr>,
    /// The module's default memory, if any.
    pub default_memory: Option<MemoryBinding>,
    /// The module's default table, if any.
    pub default_table: Option<TableBinding>,
    /// The bias applied to anyfunc addresses stored in table slots.
    pub table_reference_bias: usize,
}

/// What the loader reports about one compiled function.
#[derive(Clone, Debug)]
pub struct JitFunctionData {
    /// Address of the function's entry point.
    pub base_address: usize,
    /// Size of the function's code, in bytes.
    pub num_bytes: usize,
    /// Map from code offset to IR operator index, for stack traces.
    pub offset_to_op_index: BTreeMap<u32, u32>,
}

/// What a code address resolves to.
#[derive(Clone, Debug)]
pub enum JitFunctionKind {
    /// Not yet attributed.
    Unknown,
    /// A defined wasm function, with the identity of its function instance.
    WasmFunction {
        /// Identity of the `Function` the code belongs to.
        function: ObjectAddr,
    },
    /// An invoke thunk for the given signature.
    InvokeThunk {
        /// The signature the thunk enters.
        ty: FunctionType,
    },
    /// An intrinsic thunk.
    IntrinsicThunk,
}

/// A registered span of executable code; what stack walking resolves
/// addresses to.
#[derive(Clone, Debug)]
pub struct JitFunction {
    /// What the code is.
    pub kind: JitFunctionKind,
    /// Address of the entry point.
    pub base_address: usize,
    /// Size of the code, in bytes.
    pub num_bytes: usize,
    /// Map from code offset to IR operator index.
    pub offset_to_op_index: BTreeMap<u32, u32>,
}

/// The compiler/loader the core consumes.
///
/// `compile` is pure: equal IR must produce equal bytes. `load` binds the
/// object code's undefined symbols against `bindings` and reports one
/// `JitFunctionData` per defined function, in definition order.
pub trait JitCompiler: Send + Sync {
    /// Compile a module's IR to object code.
    fn compile(&self, module: &ir::Module) -> Vec<u8>;

    /// Load object code, binding its undefined symbols.
    fn load(
        &self,
        object_code: &[u8],
        bindings: ModuleBindings,
    ) -> anyhow::Result<(LoadedJitModule, Vec<JitFunctionData>)>;

    /// An invoke thunk for the given (type, calling convention) pair.
    /// Shared across equal signatures.
    fn invoke_thunk(
        &self,
        ty: &FunctionType,
        calling_convention: CallingConvention,
    ) -> anyhow::Result<InvokeThunk>;

    /// Wrap a non-wasm native entry so it presents a wasm-ABI entry to
    /// guest code.
    fn intrinsic_thunk(
        &self,
        native_function: *const VMFunctionBody,
        ty: &FunctionType,
        calling_convention: CallingConvention,
    ) -> anyhow::Result<*const VMFunctionBody>;
}
