//! Exception type instances.

use crate::gc;
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use atoll_ir as ir;
use std::any::Any;
use std::sync::Arc;

/// An exception type instance: a signature plus a debug name.
pub struct ExceptionType {
    header: GcHeader,
    ty: ir::ExceptionType,
    debug_name: String,
}

impl ExceptionType {
    /// Create an exception type instance.
    pub fn new(ty: ir::ExceptionType, debug_name: String) -> Root<ExceptionType> {
        let exception_type = Arc::new(ExceptionType {
            header: GcHeader::new(ObjectKind::ExceptionType),
            ty,
            debug_name,
        });
        gc::register(exception_type.clone());
        Root::new(exception_type)
    }

    /// The exception's signature.
    pub fn ty(&self) -> &ir::ExceptionType {
        &self.ty
    }

    /// The exception type's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

impl GcObject for ExceptionType {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, _visit: &mut dyn FnMut(ObjectAddr)) {}

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
