//! Compartments: the unit of isolation.
//!
//! A compartment owns numerically stable ids for its mutable resources
//! (memories, tables, contexts) because compiled code uses those ids as
//! indices into the compartment's runtime-data block, and a fixed-capacity
//! slot allocator for mutable globals. Its indexes over resources are weak:
//! the collector decides lifetime, and each resource's finalizer clears its
//! own entry here.

use crate::context::Context;
use crate::error::{fatal, RuntimeError};
use crate::gc;
use crate::global::Global;
use crate::intrinsics;
use crate::memory::Memory;
use crate::mmap::Mmap;
use crate::module::ModuleInstance;
use crate::object::{GcHeader, GcObject, ObjectAddr, ObjectKind, Root};
use crate::table::Table;
use crate::vmcontext::{
    self, VMCompartmentData, VMContextData, MAX_CONTEXTS, MAX_MEMORIES, MAX_MUTABLE_GLOBALS,
    MAX_TABLES,
};
use atoll_ir::UntaggedValue;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};

/// A fixed-capacity array of id-indexed weak slots. Freed ids are reused;
/// live ids are never renumbered.
struct SparseIdArray<T> {
    slots: Vec<Option<Weak<T>>>,
}

impl<T> SparseIdArray<T> {
    fn new(capacity: usize) -> SparseIdArray<T> {
        SparseIdArray {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn allocate(&mut self, object: Weak<T>) -> Option<usize> {
        let id = self.slots.iter().position(Option::is_none)?;
        self.slots[id] = Some(object);
        Some(id)
    }

    fn insert_at(&mut self, id: usize, object: Weak<T>) {
        debug_assert!(self.slots[id].is_none());
        self.slots[id] = Some(object);
    }

    fn remove(&mut self, id: usize) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = None;
        }
    }

    fn get(&self, id: usize) -> Option<Weak<T>> {
        self.slots.get(id).and_then(Clone::clone)
    }

    fn live(&self) -> Vec<(usize, Arc<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| Some((id, slot.as_ref()?.upgrade()?)))
            .collect()
    }
}

/// The fixed-capacity allocator for mutable-global slots.
struct SlotMask {
    bits: [u64; MAX_MUTABLE_GLOBALS / 64],
}

impl SlotMask {
    fn new() -> SlotMask {
        SlotMask {
            bits: [0; MAX_MUTABLE_GLOBALS / 64],
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        for (word_index, word) in self.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                *word |= 1 << bit;
                return Some(word_index as u32 * 64 + bit);
            }
        }
        None
    }

    fn set(&mut self, slot: u32) {
        self.bits[slot as usize / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: u32) {
        self.bits[slot as usize / 64] &= !(1 << (slot % 64));
    }

    fn is_set(&self, slot: u32) -> bool {
        (self.bits[slot as usize / 64] & (1 << (slot % 64))) != 0
    }
}

struct CompartmentInner {
    module_instances: HashMap<ObjectAddr, Weak<ModuleInstance>>,
    globals: HashMap<ObjectAddr, Weak<Global>>,
    memories: SparseIdArray<Memory>,
    tables: SparseIdArray<Table>,
    contexts: SparseIdArray<Context>,
    global_data_allocation_mask: SlotMask,
    initial_context_mutable_globals: Box<[UntaggedValue]>,
}

/// A compartment.
pub struct Compartment {
    header: GcHeader,
    runtime_data: Mmap,
    inner: Mutex<CompartmentInner>,
    intrinsics: OnceCell<Weak<ModuleInstance>>,
}

impl Compartment {
    /// Create a compartment, its runtime-data block, and its intrinsics
    /// module instance.
    pub fn new() -> Result<Root<Compartment>, RuntimeError> {
        let data_size = vmcontext::runtime_data_size();
        let runtime_data = Mmap::accessible_reserved(data_size, data_size)
            .map_err(|_| RuntimeError::OutOfMemory)?;

        let compartment = Arc::new(Compartment {
            header: GcHeader::new(ObjectKind::Compartment),
            runtime_data,
            inner: Mutex::new(CompartmentInner {
                module_instances: HashMap::new(),
                globals: HashMap::new(),
                memories: SparseIdArray::new(MAX_MEMORIES),
                tables: SparseIdArray::new(MAX_TABLES),
                contexts: SparseIdArray::new(MAX_CONTEXTS),
                global_data_allocation_mask: SlotMask::new(),
                initial_context_mutable_globals: vec![
                    UntaggedValue::zeroed();
                    MAX_MUTABLE_GLOBALS
                ]
                .into_boxed_slice(),
            }),
            intrinsics: OnceCell::new(),
        });
        gc::register(compartment.clone());
        let compartment = Root::new(compartment);

        unsafe {
            (*compartment.runtime_data_ptr())
                .compartment_object
                .store(compartment.addr().0, Ordering::Release);
        }

        let intrinsics_instance = intrinsics::instantiate_intrinsics_module(&compartment);
        assert!(compartment
            .intrinsics
            .set(intrinsics_instance.downgrade())
            .is_ok());

        log::trace!("created compartment {:#x}", compartment.addr().0);
        Ok(compartment)
    }

    pub(crate) fn runtime_data_ptr(&self) -> *mut VMCompartmentData {
        self.runtime_data.as_mut_ptr() as *mut VMCompartmentData
    }

    /// The compartment's built-in intrinsics module instance.
    pub fn intrinsics_instance(&self) -> Root<ModuleInstance> {
        match self.intrinsics.get().and_then(Weak::upgrade) {
            Some(instance) => Root::new(instance),
            None => fatal("compartment lost its intrinsics module instance"),
        }
    }

    /// The memory with the given id, if one is live.
    pub fn memory(&self, id: usize) -> Option<Root<Memory>> {
        let inner = self.inner.lock().unwrap();
        inner.memories.get(id)?.upgrade().map(Root::new)
    }

    /// The table with the given id, if one is live.
    pub fn table(&self, id: usize) -> Option<Root<Table>> {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(id)?.upgrade().map(Root::new)
    }

    /// The context with the given id, if one is live.
    pub fn context(&self, id: usize) -> Option<Root<Context>> {
        let inner = self.inner.lock().unwrap();
        inner.contexts.get(id)?.upgrade().map(Root::new)
    }

    /// Every live global in the compartment.
    pub fn globals(&self) -> Vec<Root<Global>> {
        let inner = self.inner.lock().unwrap();
        inner
            .globals
            .values()
            .filter_map(Weak::upgrade)
            .map(Root::new)
            .collect()
    }

    /// Every live module instance in the compartment.
    pub fn module_instances(&self) -> Vec<Root<ModuleInstance>> {
        let inner = self.inner.lock().unwrap();
        inner
            .module_instances
            .values()
            .filter_map(Weak::upgrade)
            .map(Root::new)
            .collect()
    }

    /// The live memory whose reserved region contains `address`, if any.
    pub fn memory_owning_address(&self, address: usize) -> Option<Root<Memory>> {
        let inner = self.inner.lock().unwrap();
        inner
            .memories
            .live()
            .into_iter()
            .map(|(_, memory)| memory)
            .find(|memory| memory.owns_address(address))
            .map(Root::new)
    }

    /// The live table whose reserved region contains `address`, if any.
    pub fn table_owning_address(&self, address: usize) -> Option<Root<Table>> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .live()
            .into_iter()
            .map(|(_, table)| table)
            .find(|table| table.owns_address(address))
            .map(Root::new)
    }

    /// Whether the given mutable-global slot is currently allocated.
    pub fn is_mutable_global_slot_allocated(&self, slot: u32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .global_data_allocation_mask
            .is_set(slot)
    }

    pub(crate) fn add_memory(&self, memory: &Arc<Memory>) -> Result<usize, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner
            .memories
            .allocate(Arc::downgrade(memory))
            .ok_or(RuntimeError::ResourceIdExhausted {
                kind: ObjectKind::Memory,
            })?;
        memory.set_id(id);
        unsafe {
            (*self.runtime_data_ptr()).memory_bases[id].store(memory.base(), Ordering::Release);
        }
        Ok(id)
    }

    pub(crate) fn add_memory_with_id(
        &self,
        memory: &Arc<Memory>,
        id: usize,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.memories.insert_at(id, Arc::downgrade(memory));
        memory.set_id(id);
        unsafe {
            (*self.runtime_data_ptr()).memory_bases[id].store(memory.base(), Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn remove_memory(&self, id: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.memories.remove(id);
        unsafe {
            (*self.runtime_data_ptr()).memory_bases[id]
                .store(std::ptr::null_mut(), Ordering::Release);
        }
    }

    pub(crate) fn add_table(&self, table: &Arc<Table>) -> Result<usize, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner
            .tables
            .allocate(Arc::downgrade(table))
            .ok_or(RuntimeError::ResourceIdExhausted {
                kind: ObjectKind::Table,
            })?;
        table.set_id(id);
        unsafe {
            (*self.runtime_data_ptr()).table_bases[id].store(table.base(), Ordering::Release);
        }
        Ok(id)
    }

    pub(crate) fn add_table_with_id(
        &self,
        table: &Arc<Table>,
        id: usize,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tables.insert_at(id, Arc::downgrade(table));
        table.set_id(id);
        unsafe {
            (*self.runtime_data_ptr()).table_bases[id].store(table.base(), Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn remove_table(&self, id: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.tables.remove(id);
        unsafe {
            (*self.runtime_data_ptr()).table_bases[id]
                .store(std::ptr::null_mut(), Ordering::Release);
        }
    }

    pub(crate) fn add_context(
        &self,
        context: &Arc<Context>,
    ) -> Result<(usize, *mut VMContextData), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner
            .contexts
            .allocate(Arc::downgrade(context))
            .ok_or(RuntimeError::ResourceIdExhausted {
                kind: ObjectKind::Context,
            })?;

        let context_data = unsafe { vmcontext::context_data_ptr(self.runtime_data_ptr(), id) };
        unsafe {
            (*context_data)
                .compartment_data
                .store(self.runtime_data_ptr(), Ordering::Release);
            for (slot, value) in inner.initial_context_mutable_globals.iter().enumerate() {
                *vmcontext::mutable_global_ptr(context_data, slot as u32) = *value;
            }
        }
        Ok((id, context_data))
    }

    pub(crate) fn remove_context(&self, id: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.contexts.remove(id);
    }

    pub(crate) fn add_global(&self, global: &Arc<Global>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .globals
            .insert(ObjectAddr::of_arc(global), Arc::downgrade(global));
    }

    pub(crate) fn remove_global(&self, addr: ObjectAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.globals.remove(&addr);
    }

    pub(crate) fn add_module_instance(&self, instance: &Arc<ModuleInstance>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .module_instances
            .insert(ObjectAddr::of_arc(instance), Arc::downgrade(instance));
    }

    pub(crate) fn remove_module_instance(&self, addr: ObjectAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.module_instances.remove(&addr);
    }

    pub(crate) fn allocate_mutable_global_slot(
        &self,
        initial_value: UntaggedValue,
    ) -> Result<u32, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .global_data_allocation_mask
            .allocate()
            .ok_or(RuntimeError::TooManyMutableGlobals)?;
        inner.initial_context_mutable_globals[slot as usize] = initial_value;
        Ok(slot)
    }

    pub(crate) fn claim_mutable_global_slot(&self, slot: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.global_data_allocation_mask.set(slot);
    }

    pub(crate) fn release_mutable_global_slot(&self, slot: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.global_data_allocation_mask.clear(slot);
    }
}

impl GcObject for Compartment {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        if let Some(intrinsics) = self.intrinsics.get() {
            visit(ObjectAddr::of_weak(intrinsics));
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Produce a fresh compartment containing a duplicate of each of `src`'s
/// memories, tables, and globals, under the same ids and (for mutable
/// globals) the same slot indices, so that a guest pointer value meaningful
/// in `src` resolves to the corresponding resource in the clone. Contexts
/// and module instances are not cloned.
pub fn clone_compartment(src: &Root<Compartment>) -> Result<Root<Compartment>, RuntimeError> {
    let new_compartment = Compartment::new()?;

    // Snapshot the source under its mutex; resource duplication happens
    // outside it so object registration never nests inside a compartment
    // lock.
    let (template, memories, tables, globals) = {
        let inner = src.inner.lock().unwrap();
        (
            inner.initial_context_mutable_globals.clone(),
            inner.memories.live(),
            inner.tables.live(),
            inner
                .globals
                .values()
                .filter_map(Weak::upgrade)
                .collect::<Vec<_>>(),
        )
    };

    {
        let mut new_inner = new_compartment.inner.lock().unwrap();
        new_inner.initial_context_mutable_globals = template;
    }

    for (_, memory) in &memories {
        Memory::clone_into(memory, &new_compartment)?;
    }
    for (_, table) in &tables {
        Table::clone_into(table, &new_compartment)?;
    }
    for global in &globals {
        Global::clone_into(global, &new_compartment)?;
    }

    log::trace!(
        "cloned compartment {:#x} -> {:#x}: {} memories, {} tables, {} globals",
        src.addr().0,
        new_compartment.addr().0,
        memories.len(),
        tables.len(),
        globals.len(),
    );
    Ok(new_compartment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_mask_allocates_lowest_free_bit() {
        let mut mask = SlotMask::new();
        assert_eq!(mask.allocate(), Some(0));
        assert_eq!(mask.allocate(), Some(1));
        mask.clear(0);
        assert_eq!(mask.allocate(), Some(0));
        assert!(mask.is_set(1));
        mask.set(70);
        assert!(mask.is_set(70));
    }

    #[test]
    fn slot_mask_exhausts() {
        let mut mask = SlotMask::new();
        for expected in 0..MAX_MUTABLE_GLOBALS as u32 {
            assert_eq!(mask.allocate(), Some(expected));
        }
        assert_eq!(mask.allocate(), None);
        mask.clear(17);
        assert_eq!(mask.allocate(), Some(17));
    }
}
