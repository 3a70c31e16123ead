//! Function instances and the checked invoke path.

use crate::context::Context;
use crate::error::RuntimeError;
use crate::gc;
use crate::jit::JitCompiler;
use crate::module::ModuleInstance;
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use crate::vmcontext::{VMAnyFunc, VMFunctionBody};
use atoll_ir::{CallingConvention, FunctionType, UntaggedValue, Value};
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// A function instance: a function defined in an instantiated module, or a
/// host intrinsic.
///
/// `repr(C)` with the anyfunc record first, so the function's object
/// identity doubles as the anyfunc address table slots store (biased).
#[repr(C)]
pub struct Function {
    anyfunc: VMAnyFunc,
    header: GcHeader,
    module_instance: Weak<ModuleInstance>,
    ty: FunctionType,
    calling_convention: CallingConvention,
    debug_name: String,
}

impl Function {
    pub(crate) fn new(
        module_instance: Weak<ModuleInstance>,
        ty: FunctionType,
        native_function: *const VMFunctionBody,
        calling_convention: CallingConvention,
        debug_name: String,
    ) -> Root<Function> {
        let function = Arc::new(Function {
            anyfunc: VMAnyFunc::null(),
            header: GcHeader::new(ObjectKind::Function),
            module_instance,
            ty,
            calling_convention,
            debug_name,
        });
        function
            .anyfunc
            .native_function
            .store(native_function as *mut VMFunctionBody, Ordering::Release);
        gc::register(function.clone());
        Root::new(function)
    }

    /// The function's signature.
    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    /// The function's calling convention. Calls from guest code need a
    /// thunk unless this is `Wasm`.
    pub fn calling_convention(&self) -> CallingConvention {
        self.calling_convention
    }

    /// The function's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The module instance this function belongs to.
    pub fn module_instance(&self) -> Option<Root<ModuleInstance>> {
        self.module_instance.upgrade().map(Root::new)
    }

    /// The function's native entry point; null until its module is loaded.
    pub fn native_function(&self) -> *const VMFunctionBody {
        self.anyfunc.native_function.load(Ordering::Acquire)
    }

    pub(crate) fn set_native_function(&self, native_function: *const VMFunctionBody) {
        self.anyfunc
            .native_function
            .store(native_function as *mut VMFunctionBody, Ordering::Release);
    }
}

impl GcObject for Function {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        visit(ObjectAddr::of_weak(&self.module_instance));
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Invoke `function` in `context` with the given arguments.
///
/// Checks argument arity and types against the function's signature,
/// marshals values through an untagged buffer, and calls through an invoke
/// thunk for the function's (type, calling convention) pair.
pub fn invoke(
    jit: &dyn JitCompiler,
    context: &Root<Context>,
    function: &Root<Function>,
    arguments: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let ty = function.ty();
    if arguments.len() != ty.params().len() {
        return Err(RuntimeError::InvalidArgument {
            function: function.debug_name().to_string(),
            message: format!(
                "expected {} arguments, got {}",
                ty.params().len(),
                arguments.len()
            ),
        });
    }
    for (index, (argument, param)) in arguments.iter().zip(ty.params()).enumerate() {
        if !argument.value_type().is_subtype_of(*param) {
            return Err(RuntimeError::InvalidArgument {
                function: function.debug_name().to_string(),
                message: format!(
                    "argument {} has type {}, expected {}",
                    index,
                    argument.value_type(),
                    param
                ),
            });
        }
    }

    let native_function = function.native_function();
    if native_function.is_null() {
        return match function.calling_convention() {
            CallingConvention::Intrinsic => Err(RuntimeError::CalledUnimplementedIntrinsic {
                name: function.debug_name().to_string(),
            }),
            _ => Err(RuntimeError::Link(format!(
                "{} has no compiled entry point",
                function.debug_name()
            ))),
        };
    }

    let thunk = jit
        .invoke_thunk(ty, function.calling_convention())
        .map_err(|e| RuntimeError::Link(e.to_string()))?;

    let buffer_len = ty.params().len().max(ty.results().len());
    let mut buffer = vec![UntaggedValue::zeroed(); buffer_len];
    for (cell, argument) in buffer.iter_mut().zip(arguments) {
        *cell = argument.to_untagged();
    }

    unsafe {
        thunk(native_function, context.runtime_data_ptr(), buffer.as_mut_ptr());
    }

    Ok(ty
        .results()
        .iter()
        .enumerate()
        .map(|(index, result_type)| Value::from_untagged(*result_type, &buffer[index]))
        .collect())
}
