//! Memory management for tables.
//!
//! `Table` is to function references what `Memory` is to bytes: a
//! reserve-to-max region of element slots, committed as the table grows.
//! Each slot stores the *biased* address of a function's anyfunc record;
//! the bias is the address of a process-wide out-of-bounds sentinel record,
//! chosen so that the all-zero slot a freshly committed page provides
//! decodes to the sentinel. Compiled code can therefore elide bounds checks
//! on the happy path and let an uninitialized slot fault through the
//! sentinel call.

use crate::compartment::Compartment;
use crate::error::RuntimeError;
use crate::func::Function;
use crate::gc;
use crate::mmap::{round_up_to_page_size, Mmap};
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use crate::vmcontext::{VMAnyFunc, VMTableElement, TABLE_DEFAULT_RESERVED_ELEMENTS};
use atoll_ir::TableType;
use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The record an all-zero table slot decodes to. Calling through it is the
/// trap path for uninitialized and out-of-bounds elements.
static OUT_OF_BOUNDS_ANYFUNC: VMAnyFunc = VMAnyFunc::null();

/// The per-process bias applied to anyfunc addresses stored in table slots.
pub fn reference_bias() -> usize {
    &OUT_OF_BOUNDS_ANYFUNC as *const VMAnyFunc as usize
}

/// A table instance.
pub struct Table {
    header: GcHeader,
    compartment: Weak<Compartment>,
    id: AtomicUsize,
    ty: TableType,
    mmap: Mmap,
    num_reserved_bytes: usize,
    num_reserved_elements: u64,
    num_elements: AtomicU64,
    resizing_mutex: Mutex<()>,
    debug_name: String,
}

impl Table {
    /// Create a table in `compartment` with the given declared type.
    ///
    /// Reserves slot space for the declared maximum (or a process default
    /// when unbounded) and commits the initial elements,
    /// sentinel-initialized.
    pub fn new(
        compartment: &Root<Compartment>,
        ty: TableType,
        debug_name: String,
    ) -> Result<Root<Table>, RuntimeError> {
        let num_reserved_elements = ty
            .size
            .max
            .map_or(TABLE_DEFAULT_RESERVED_ELEMENTS, |max| {
                max.min(TABLE_DEFAULT_RESERVED_ELEMENTS)
            });
        let element_size = mem::size_of::<VMTableElement>() as u64;
        let num_reserved_bytes =
            round_up_to_page_size((num_reserved_elements * element_size) as usize);
        let initial_bytes = round_up_to_page_size((ty.size.min * element_size) as usize);
        if ty.size.min > num_reserved_elements {
            return Err(RuntimeError::OutOfMemory);
        }

        let mmap = Mmap::accessible_reserved(initial_bytes, num_reserved_bytes).map_err(|e| {
            log::debug!("failed to create table {}: {:#}", debug_name, e);
            RuntimeError::OutOfMemory
        })?;

        let table = Arc::new(Table {
            header: GcHeader::new(ObjectKind::Table),
            compartment: compartment.downgrade(),
            id: AtomicUsize::new(usize::MAX),
            ty,
            mmap,
            num_reserved_bytes,
            num_reserved_elements,
            num_elements: AtomicU64::new(ty.size.min),
            resizing_mutex: Mutex::new(()),
            debug_name,
        });
        gc::register(table.clone());
        compartment.add_table(&table)?;
        Ok(Root::new(table))
    }

    /// Duplicate this table into another compartment under the same id,
    /// with identical elements.
    ///
    /// The resizing mutex is only held as a leaf here (it is also taken
    /// under the registry mutex during collection), so the snapshot and the
    /// element copy take it separately.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Root<Compartment>,
    ) -> Result<Root<Table>, RuntimeError> {
        let num_elements = {
            let _guard = self.resizing_mutex.lock().unwrap();
            self.num_elements.load(Ordering::Acquire)
        };
        let element_size = mem::size_of::<VMTableElement>() as u64;
        let committed_bytes = round_up_to_page_size((num_elements * element_size) as usize);

        let table = Arc::new(Table {
            header: GcHeader::new(ObjectKind::Table),
            compartment: new_compartment.downgrade(),
            id: AtomicUsize::new(usize::MAX),
            ty: self.ty,
            mmap: Mmap::accessible_reserved(committed_bytes, self.num_reserved_bytes)
                .map_err(|_| RuntimeError::OutOfMemory)?,
            num_reserved_bytes: self.num_reserved_bytes,
            num_reserved_elements: self.num_reserved_elements,
            num_elements: AtomicU64::new(num_elements),
            resizing_mutex: Mutex::new(()),
            debug_name: self.debug_name.clone(),
        });
        gc::register(table.clone());
        new_compartment.add_table_with_id(&table, self.id())?;
        {
            let _guard = self.resizing_mutex.lock().unwrap();
            for index in 0..num_elements {
                let biased = self.element(index).biased_value.load(Ordering::Acquire);
                table.element(index).biased_value.store(biased, Ordering::Release);
            }
        }
        Ok(Root::new(table))
    }

    /// The table's declared type.
    pub fn ty(&self) -> &TableType {
        &self.ty
    }

    /// The table's compartment-scoped id.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: usize) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// The table's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The compartment this table belongs to.
    pub fn compartment(&self) -> Option<Root<Compartment>> {
        self.compartment.upgrade().map(Root::new)
    }

    /// The current number of elements.
    pub fn num_elements(&self) -> u64 {
        self.num_elements.load(Ordering::Acquire)
    }

    /// Base address of the element slots. Stable for the life of the
    /// object.
    pub fn base(&self) -> *mut VMTableElement {
        self.mmap.as_mut_ptr() as *mut VMTableElement
    }

    /// Whether `address` falls inside this table's reserved region.
    pub(crate) fn owns_address(&self, address: usize) -> bool {
        let base = self.mmap.as_ptr() as usize;
        address >= base && address < base + self.num_reserved_bytes
    }

    fn element(&self, index: u64) -> &VMTableElement {
        unsafe { &*self.base().add(index as usize) }
    }

    /// Grow the table by `delta` elements, committing sentinel-initialized
    /// slots.
    ///
    /// Returns the previous number of elements, or `None` if the growth
    /// would exceed the declared maximum or the reserved region.
    pub fn grow(&self, delta: u64) -> Option<u64> {
        let _guard = self.resizing_mutex.lock().unwrap();
        let old_elements = self.num_elements.load(Ordering::Acquire);
        if delta == 0 {
            return Some(old_elements);
        }

        let new_elements = old_elements.checked_add(delta)?;
        if let Some(max) = self.ty.size.max {
            if new_elements > max {
                return None;
            }
        }
        if new_elements > self.num_reserved_elements {
            return None;
        }

        let element_size = mem::size_of::<VMTableElement>() as u64;
        let old_committed = round_up_to_page_size((old_elements * element_size) as usize);
        let new_committed = round_up_to_page_size((new_elements * element_size) as usize);
        if new_committed > old_committed {
            if self
                .mmap
                .make_accessible(old_committed, new_committed - old_committed)
                .is_err()
            {
                return None;
            }
        }

        self.num_elements.store(new_elements, Ordering::Release);
        Some(old_elements)
    }

    /// Store a function reference (or the sentinel, for `None`) into a slot.
    pub fn set(&self, index: u64, function: Option<&Root<Function>>) -> Result<(), RuntimeError> {
        self.check_bounds(index)?;
        let biased = match function {
            Some(function) => function.addr().0.wrapping_sub(reference_bias()),
            None => 0,
        };
        self.element(index).biased_value.store(biased, Ordering::Release);
        Ok(())
    }

    /// Load the function stored in a slot, or `None` for an uninitialized
    /// slot.
    pub fn get(&self, index: u64) -> Result<Option<Root<Function>>, RuntimeError> {
        self.check_bounds(index)?;
        let biased = self.element(index).biased_value.load(Ordering::Acquire);
        if biased == 0 {
            return Ok(None);
        }
        let addr = ObjectAddr(biased.wrapping_add(reference_bias()));
        Ok(gc::lookup_object::<Function>(addr))
    }

    /// Copy `len` elements from `src` to `dst` within this table, handling
    /// overlap.
    pub fn copy(&self, dst: u64, src: u64, len: u64) -> Result<(), RuntimeError> {
        let num_elements = self.num_elements.load(Ordering::Acquire);
        if dst.checked_add(len).map_or(true, |end| end > num_elements) {
            return Err(self.out_of_bounds(dst.saturating_add(len)));
        }
        if src.checked_add(len).map_or(true, |end| end > num_elements) {
            return Err(self.out_of_bounds(src.saturating_add(len)));
        }

        if dst <= src {
            for i in 0..len {
                let biased = self.element(src + i).biased_value.load(Ordering::Acquire);
                self.element(dst + i).biased_value.store(biased, Ordering::Release);
            }
        } else {
            for i in (0..len).rev() {
                let biased = self.element(src + i).biased_value.load(Ordering::Acquire);
                self.element(dst + i).biased_value.store(biased, Ordering::Release);
            }
        }
        Ok(())
    }

    fn check_bounds(&self, index: u64) -> Result<(), RuntimeError> {
        if index >= self.num_elements.load(Ordering::Acquire) {
            return Err(self.out_of_bounds(index));
        }
        Ok(())
    }

    fn out_of_bounds(&self, index: u64) -> RuntimeError {
        RuntimeError::OutOfBoundsTableAccess {
            table: self.debug_name.clone(),
            index,
        }
    }
}

impl GcObject for Table {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        visit(ObjectAddr::of_weak(&self.compartment));

        // Hold the resizing lock so a concurrent grow can't race the scan.
        let _guard = self.resizing_mutex.lock().unwrap();
        let num_elements = self.num_elements.load(Ordering::Acquire);
        let bias = reference_bias();
        for index in 0..num_elements {
            let biased = self.element(index).biased_value.load(Ordering::Acquire);
            if biased != 0 {
                visit(ObjectAddr(biased.wrapping_add(bias)));
            }
        }
    }

    fn finalize(&self) {
        if let Some(compartment) = self.compartment.upgrade() {
            compartment.remove_table(self.id());
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_decodes_zero_to_sentinel() {
        let bias = reference_bias();
        assert_ne!(bias, 0);
        assert_eq!(
            0usize.wrapping_add(bias),
            &OUT_OF_BOUNDS_ANYFUNC as *const VMAnyFunc as usize
        );
        // Biasing is invertible for any address.
        let addr: usize = 0xdead_beef;
        assert_eq!(addr.wrapping_sub(bias).wrapping_add(bias), addr);
    }
}
