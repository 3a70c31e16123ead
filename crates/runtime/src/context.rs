//! Execution contexts.
//!
//! A context is the execution-local state bundle compiled code runs
//! against: a compartment-scoped id selecting an area of the compartment's
//! runtime-data block, initialized from the compartment's mutable-globals
//! template at creation. One context per guest thread is the expected
//! shape; the core imposes no threading model of its own.

use crate::compartment::Compartment;
use crate::error::RuntimeError;
use crate::gc;
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use crate::vmcontext::VMContextData;
use std::any::Any;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// An execution context.
pub struct Context {
    header: GcHeader,
    compartment: Weak<Compartment>,
    id: AtomicUsize,
    runtime_data: AtomicPtr<VMContextData>,
}

impl Context {
    /// Create a context in `compartment`, copying the compartment's
    /// mutable-globals template into the context's runtime-data area.
    pub fn new(compartment: &Root<Compartment>) -> Result<Root<Context>, RuntimeError> {
        let context = Arc::new(Context {
            header: GcHeader::new(ObjectKind::Context),
            compartment: compartment.downgrade(),
            id: AtomicUsize::new(usize::MAX),
            runtime_data: AtomicPtr::new(std::ptr::null_mut()),
        });
        gc::register(context.clone());
        let (id, runtime_data) = compartment.add_context(&context)?;
        context.id.store(id, Ordering::Relaxed);
        context.runtime_data.store(runtime_data, Ordering::Release);
        Ok(Root::new(context))
    }

    /// The context's compartment-scoped id.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed)
    }

    /// The compartment this context belongs to.
    pub fn compartment(&self) -> Option<Root<Compartment>> {
        self.compartment.upgrade().map(Root::new)
    }

    /// The context's runtime-data area; what compiled code receives as its
    /// hidden first argument.
    pub(crate) fn runtime_data_ptr(&self) -> *mut VMContextData {
        self.runtime_data.load(Ordering::Acquire)
    }
}

impl GcObject for Context {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        visit(ObjectAddr::of_weak(&self.compartment));
    }

    fn finalize(&self) {
        if let Some(compartment) = self.compartment.upgrade() {
            compartment.remove_context(self.id());
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
