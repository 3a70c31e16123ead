//! Global instances.
//!
//! Immutable globals are read straight from the object. Mutable globals are
//! per-context: creation allocates a slot in the owning compartment's
//! mutable-globals area and stores the initial value into the compartment's
//! template, from which every subsequently created context copies its own
//! area, so guest reads and writes indirect through the current context's
//! runtime data.

use crate::compartment::Compartment;
use crate::context::Context;
use crate::error::RuntimeError;
use crate::gc;
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use crate::vmcontext::mutable_global_ptr;
use atoll_ir::{GlobalType, UntaggedValue, Value};
use std::any::Any;
use std::sync::{Arc, Weak};

/// A global instance.
pub struct Global {
    header: GcHeader,
    compartment: Weak<Compartment>,
    ty: GlobalType,
    mutable_global_id: Option<u32>,
    initial_value: UntaggedValue,
}

impl Global {
    /// Create a global in `compartment` with the given declared type and
    /// initial value.
    pub fn new(
        compartment: &Root<Compartment>,
        ty: GlobalType,
        initial_value: Value,
    ) -> Result<Root<Global>, RuntimeError> {
        let untagged = initial_value.to_untagged();
        let mutable_global_id = if ty.mutable {
            Some(compartment.allocate_mutable_global_slot(untagged)?)
        } else {
            None
        };

        let global = Arc::new(Global {
            header: GcHeader::new(ObjectKind::Global),
            compartment: compartment.downgrade(),
            ty,
            mutable_global_id,
            initial_value: untagged,
        });
        gc::register(global.clone());
        compartment.add_global(&global);
        Ok(Root::new(global))
    }

    /// Duplicate this global into another compartment under the same
    /// mutable-global slot. The new compartment's template already carries
    /// the slot's value; only the slot reservation is re-established.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Root<Compartment>,
    ) -> Result<Root<Global>, RuntimeError> {
        if let Some(slot) = self.mutable_global_id {
            new_compartment.claim_mutable_global_slot(slot);
        }
        let global = Arc::new(Global {
            header: GcHeader::new(ObjectKind::Global),
            compartment: new_compartment.downgrade(),
            ty: self.ty,
            mutable_global_id: self.mutable_global_id,
            initial_value: self.initial_value,
        });
        gc::register(global.clone());
        new_compartment.add_global(&global);
        Ok(Root::new(global))
    }

    /// The global's declared type.
    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }

    /// The compartment this global belongs to.
    pub fn compartment(&self) -> Option<Root<Compartment>> {
        self.compartment.upgrade().map(Root::new)
    }

    /// The slot this global occupies in its compartment's mutable-globals
    /// area, if it is mutable.
    pub fn mutable_global_id(&self) -> Option<u32> {
        self.mutable_global_id
    }

    /// The value the global was created with.
    pub fn initial_value(&self) -> Value {
        Value::from_untagged(self.ty.value_type, &self.initial_value)
    }

    /// Pointer to the stored initial value; what compiled code reads for an
    /// immutable global.
    pub(crate) fn initial_value_ptr(&self) -> *const UntaggedValue {
        &self.initial_value
    }

    /// Read the global's value as seen by `context`.
    pub fn get(&self, context: &Root<Context>) -> Value {
        debug_assert!(self.same_compartment(context));
        match self.mutable_global_id {
            Some(slot) => unsafe {
                let cell = mutable_global_ptr(context.runtime_data_ptr(), slot);
                Value::from_untagged(self.ty.value_type, &*cell)
            },
            None => self.initial_value(),
        }
    }

    /// Write the global's value in `context`. Other contexts' copies are
    /// unaffected.
    pub fn set(&self, context: &Root<Context>, value: Value) -> Result<(), RuntimeError> {
        debug_assert!(self.same_compartment(context));
        let slot = self.mutable_global_id.ok_or_else(|| {
            RuntimeError::Link("cannot write an immutable global".to_string())
        })?;
        if !value.value_type().is_subtype_of(self.ty.value_type) {
            return Err(RuntimeError::Link(format!(
                "value of type {} written to global of type {}",
                value.value_type(),
                self.ty.value_type,
            )));
        }
        unsafe {
            *mutable_global_ptr(context.runtime_data_ptr(), slot) = value.to_untagged();
        }
        Ok(())
    }

    fn same_compartment(&self, context: &Root<Context>) -> bool {
        match context.compartment() {
            Some(compartment) => {
                ObjectAddr::of_weak(&self.compartment) == compartment.addr()
            }
            None => false,
        }
    }
}

impl GcObject for Global {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        visit(ObjectAddr::of_weak(&self.compartment));
    }

    fn finalize(&self) {
        if let Some(compartment) = self.compartment.upgrade() {
            if let Some(slot) = self.mutable_global_id {
                compartment.release_mutable_global_slot(slot);
            }
            compartment.remove_global(ObjectAddr::of_ref(self));
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
