//! This file declares the runtime-data structures that compiled wasm code
//! accesses directly, along with the capacity constants that fix their
//! layout.
//!
//! Each compartment owns one runtime-data block: a `VMCompartmentData`
//! header holding the base-address arrays indexed by compartment-scoped
//! memory and table ids, followed by `MAX_CONTEXTS` fixed-size
//! `VMContextData` areas, one per context id, each carrying that context's
//! copy of the mutable-globals area. Compiled code receives a
//! `*mut VMContextData` as its hidden first argument and reaches the
//! compartment header through the back-pointer in its first word.
//!
//! None of these structs is ever constructed by value; they overlay
//! zero-committed pages, and the all-zero bit pattern is a valid state for
//! every field.

use atoll_ir::UntaggedValue;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// The size of a WebAssembly page, in bytes.
pub const WASM_PAGE_SIZE: u64 = 0x10000;

/// The maximum size of a 32-bit linear memory, in pages.
pub const WASM_MAX_PAGES: u64 = 0x10000;

/// Memory ids available per compartment.
pub const MAX_MEMORIES: usize = 255;

/// Table ids available per compartment.
pub const MAX_TABLES: usize = 256;

/// Context ids available per compartment.
pub const MAX_CONTEXTS: usize = 1024;

/// Mutable-global slots available per compartment.
pub const MAX_MUTABLE_GLOBALS: usize = 256;

/// Elements of address space reserved for a table with no declared maximum.
pub const TABLE_DEFAULT_RESERVED_ELEMENTS: u64 = 1 << 20;

/// A placeholder byte-sized type which is just used to provide some amount
/// of type safety when dealing with pointers to compiled function bodies.
/// Note that it's deliberately not Copy, as we shouldn't be carelessly
/// copying function body bytes around.
#[repr(C)]
pub struct VMFunctionBody(u8);

/// The record a table element points at: the function's native entry.
///
/// This lives at offset zero of every `Function`, so a function's object
/// identity doubles as its anyfunc address.
#[repr(C)]
pub struct VMAnyFunc {
    /// The function's native entry point; null until the function's module
    /// is loaded.
    pub native_function: AtomicPtr<VMFunctionBody>,
}

impl VMAnyFunc {
    /// An anyfunc with no entry point.
    pub const fn null() -> VMAnyFunc {
        VMAnyFunc {
            native_function: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// One table slot: the biased address of an anyfunc record.
///
/// The stored value is `anyfunc_address - bias`, where the bias is the
/// address of the process-wide out-of-bounds sentinel record, so the
/// all-zero slot a freshly committed page provides decodes to the sentinel.
#[repr(transparent)]
pub struct VMTableElement {
    /// The biased anyfunc address.
    pub biased_value: AtomicUsize,
}

/// The head of a compartment's runtime-data block.
#[repr(C)]
pub struct VMCompartmentData {
    /// Identity of the owning `Compartment` object.
    pub compartment_object: AtomicUsize,
    /// Base address of each memory in the compartment, indexed by id.
    pub memory_bases: [AtomicPtr<u8>; MAX_MEMORIES],
    /// Base address of each table's elements, indexed by id.
    pub table_bases: [AtomicPtr<VMTableElement>; MAX_TABLES],
}

/// A context's area within its compartment's runtime-data block.
#[repr(C)]
pub struct VMContextData {
    /// Back-pointer to the compartment's runtime-data header.
    pub compartment_data: AtomicPtr<VMCompartmentData>,
    /// This context's copy of the compartment's mutable-globals area.
    pub mutable_globals: [UntaggedValue; MAX_MUTABLE_GLOBALS],
}

impl VMContextData {
    /// The compartment runtime data this context belongs to.
    pub fn compartment_data(&self) -> *mut VMCompartmentData {
        self.compartment_data.load(Ordering::Acquire)
    }
}

/// Pointer to a context's copy of the given mutable-global slot.
///
/// # Safety
/// `context_data` must point at a live context area and `slot` must be
/// below `MAX_MUTABLE_GLOBALS`.
pub unsafe fn mutable_global_ptr(
    context_data: *mut VMContextData,
    slot: u32,
) -> *mut UntaggedValue {
    ptr::addr_of_mut!((*context_data).mutable_globals[slot as usize])
}

/// Byte offset of the context areas within a compartment's runtime-data
/// block.
pub(crate) fn contexts_offset() -> usize {
    let align = mem::align_of::<VMContextData>();
    (mem::size_of::<VMCompartmentData>() + align - 1) & !(align - 1)
}

/// Total byte size of a compartment's runtime-data block, in whole pages.
pub(crate) fn runtime_data_size() -> usize {
    crate::mmap::round_up_to_page_size(
        contexts_offset() + MAX_CONTEXTS * mem::size_of::<VMContextData>(),
    )
}

/// The context area for the given context id.
///
/// # Safety
/// `base` must point at a live runtime-data block and `id` must be below
/// `MAX_CONTEXTS`.
pub(crate) unsafe fn context_data_ptr(
    base: *mut VMCompartmentData,
    id: usize,
) -> *mut VMContextData {
    debug_assert!(id < MAX_CONTEXTS);
    (base as *mut u8).add(contexts_offset() + id * mem::size_of::<VMContextData>())
        as *mut VMContextData
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_layout() {
        // Compiled code indexes these arrays directly, so the layout is ABI.
        assert_eq!(mem::size_of::<VMTableElement>(), mem::size_of::<usize>());
        assert_eq!(mem::align_of::<VMContextData>(), 16);
        assert_eq!(
            mem::size_of::<VMContextData>(),
            16 + MAX_MUTABLE_GLOBALS * mem::size_of::<UntaggedValue>()
        );
        assert_eq!(contexts_offset() % mem::align_of::<VMContextData>(), 0);
        assert!(runtime_data_size() >= contexts_offset() + MAX_CONTEXTS * mem::size_of::<VMContextData>());
    }

    #[test]
    fn zeroed_anyfunc_is_null() {
        let anyfunc = VMAnyFunc::null();
        assert!(anyfunc.native_function.load(Ordering::Relaxed).is_null());
    }
}
