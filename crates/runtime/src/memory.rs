//! Memory management for linear memories.
//!
//! A `Memory` reserves address space for its declared maximum up front and
//! commits zero-filled pages as it grows, so its base address never moves
//! for the lifetime of the object. Compiled code locates the base through
//! the compartment runtime data, indexed by the memory's compartment id.

use crate::compartment::Compartment;
use crate::error::RuntimeError;
use crate::gc;
use crate::mmap::{round_up_to_page_size, Mmap};
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use crate::vmcontext::{WASM_MAX_PAGES, WASM_PAGE_SIZE};
use atoll_ir::MemoryType;
use std::any::Any;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A linear memory instance.
pub struct Memory {
    header: GcHeader,
    compartment: Weak<Compartment>,
    id: AtomicUsize,
    ty: MemoryType,
    mmap: Mmap,
    num_reserved_bytes: usize,
    num_pages: AtomicU64,
    resizing_mutex: Mutex<()>,
    debug_name: String,
}

impl Memory {
    /// Create a memory in `compartment` with the given declared type.
    ///
    /// Reserves address space for the declared maximum (or the wasm32 limit
    /// when unbounded) and commits the initial pages, zero-filled.
    pub fn new(
        compartment: &Root<Compartment>,
        ty: MemoryType,
        debug_name: String,
    ) -> Result<Root<Memory>, RuntimeError> {
        let reserved_pages = ty.size.max.map_or(WASM_MAX_PAGES, |max| max.min(WASM_MAX_PAGES));
        let num_reserved_bytes = round_up_to_page_size((reserved_pages * WASM_PAGE_SIZE) as usize);
        let initial_bytes = (ty.size.min * WASM_PAGE_SIZE) as usize;
        if initial_bytes > num_reserved_bytes {
            return Err(RuntimeError::OutOfMemory);
        }

        let mmap = Mmap::accessible_reserved(initial_bytes, num_reserved_bytes).map_err(|e| {
            log::debug!("failed to create memory {}: {:#}", debug_name, e);
            RuntimeError::OutOfMemory
        })?;

        let memory = Arc::new(Memory {
            header: GcHeader::new(ObjectKind::Memory),
            compartment: compartment.downgrade(),
            id: AtomicUsize::new(usize::MAX),
            ty,
            mmap,
            num_reserved_bytes,
            num_pages: AtomicU64::new(ty.size.min),
            resizing_mutex: Mutex::new(()),
            debug_name,
        });
        gc::register(memory.clone());
        compartment.add_memory(&memory)?;
        Ok(Root::new(memory))
    }

    /// Duplicate this memory into another compartment under the same id,
    /// with identical committed contents.
    ///
    /// The resizing mutex is only held as a leaf here (it is also taken
    /// under the registry mutex during collection), so the snapshot and the
    /// byte copy take it separately.
    pub(crate) fn clone_into(
        &self,
        new_compartment: &Root<Compartment>,
    ) -> Result<Root<Memory>, RuntimeError> {
        let num_pages = {
            let _guard = self.resizing_mutex.lock().unwrap();
            self.num_pages.load(Ordering::Acquire)
        };
        let committed_bytes = (num_pages * WASM_PAGE_SIZE) as usize;

        let mmap = Mmap::accessible_reserved(committed_bytes, self.num_reserved_bytes)
            .map_err(|_| RuntimeError::OutOfMemory)?;

        let memory = Arc::new(Memory {
            header: GcHeader::new(ObjectKind::Memory),
            compartment: new_compartment.downgrade(),
            id: AtomicUsize::new(usize::MAX),
            ty: self.ty,
            mmap,
            num_reserved_bytes: self.num_reserved_bytes,
            num_pages: AtomicU64::new(num_pages),
            resizing_mutex: Mutex::new(()),
            debug_name: self.debug_name.clone(),
        });
        gc::register(memory.clone());
        new_compartment.add_memory_with_id(&memory, self.id())?;
        {
            let _guard = self.resizing_mutex.lock().unwrap();
            unsafe {
                ptr::copy_nonoverlapping(
                    self.mmap.as_ptr(),
                    memory.mmap.as_mut_ptr(),
                    committed_bytes,
                );
            }
        }
        Ok(Root::new(memory))
    }

    /// The memory's declared type.
    pub fn ty(&self) -> &MemoryType {
        &self.ty
    }

    /// The memory's compartment-scoped id.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: usize) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// The memory's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The compartment this memory belongs to.
    pub fn compartment(&self) -> Option<Root<Compartment>> {
        self.compartment.upgrade().map(Root::new)
    }

    /// The current size, in pages.
    pub fn num_pages(&self) -> u64 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// The current size, in bytes.
    pub fn num_bytes(&self) -> u64 {
        self.num_pages() * WASM_PAGE_SIZE
    }

    /// Base address of the memory's reserved region. Stable for the life
    /// of the object; compiled code reaches it through the compartment
    /// runtime data.
    pub fn base(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Whether `address` falls inside this memory's reserved region.
    pub(crate) fn owns_address(&self, address: usize) -> bool {
        let base = self.mmap.as_ptr() as usize;
        address >= base && address < base + self.num_reserved_bytes
    }

    /// Grow the memory by `delta_pages`, committing zero-filled pages.
    ///
    /// Returns the previous size in pages, or `None` if the growth would
    /// exceed the declared maximum or the reserved region.
    pub fn grow(&self, delta_pages: u64) -> Option<u64> {
        let _guard = self.resizing_mutex.lock().unwrap();
        let old_pages = self.num_pages.load(Ordering::Acquire);
        if delta_pages == 0 {
            return Some(old_pages);
        }

        let new_pages = old_pages.checked_add(delta_pages)?;
        let declared_max = self.ty.size.max.unwrap_or(WASM_MAX_PAGES);
        if new_pages > declared_max {
            return None;
        }
        let new_bytes = new_pages.checked_mul(WASM_PAGE_SIZE)?;
        if new_bytes > self.num_reserved_bytes as u64 {
            return None;
        }

        let old_bytes = (old_pages * WASM_PAGE_SIZE) as usize;
        if self
            .mmap
            .make_accessible(old_bytes, (new_bytes as usize) - old_bytes)
            .is_err()
        {
            return None;
        }

        self.num_pages.store(new_pages, Ordering::Release);
        Some(old_pages)
    }

    /// Read bytes out of the memory's committed region.
    pub fn read(&self, address: u64, buffer: &mut [u8]) -> Result<(), RuntimeError> {
        self.check_bounds(address, buffer.len())?;
        unsafe {
            ptr::copy_nonoverlapping(
                self.base().add(address as usize) as *const u8,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }
        Ok(())
    }

    /// Write bytes into the memory's committed region.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), RuntimeError> {
        self.check_bounds(address, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(address as usize), data.len());
        }
        Ok(())
    }

    fn check_bounds(&self, address: u64, len: usize) -> Result<(), RuntimeError> {
        let out_of_bounds = || RuntimeError::OutOfBoundsMemoryAccess {
            memory: self.debug_name.clone(),
            address,
        };
        let end = address.checked_add(len as u64).ok_or_else(out_of_bounds)?;
        if end > self.num_bytes() {
            return Err(out_of_bounds());
        }
        Ok(())
    }
}

impl GcObject for Memory {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        visit(ObjectAddr::of_weak(&self.compartment));
    }

    fn finalize(&self) {
        if let Some(compartment) = self.compartment.upgrade() {
            compartment.remove_memory(self.id());
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
