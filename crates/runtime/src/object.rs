//! The common root of every runtime object: kind tags, root-reference
//! counting, the collector-facing trait, and the `Root` pin that keeps an
//! object alive across collections.
//!
//! Ownership model: the process-wide registry in `gc` holds the only strong
//! `Arc` for each object; every inter-object edge is a `Weak`. A [`Root`]
//! holds an additional strong `Arc` and bumps the object's root counter, so
//! a non-zero counter marks the object as a collection root. Cycles are
//! collected because reachability is computed by tracing, not by reference
//! counts; `Arc` only guarantees that a handle never dangles.

use crate::exception::ExceptionType;
use crate::func::Function;
use crate::global::Global;
use crate::memory::Memory;
use crate::table::Table;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// The kind of a runtime object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A function instance.
    Function,
    /// A table instance.
    Table,
    /// A memory instance.
    Memory,
    /// A global instance.
    Global,
    /// An exception type instance.
    ExceptionType,
    /// A compiled module.
    Module,
    /// A module instance.
    ModuleInstance,
    /// An execution context.
    Context,
    /// A compartment.
    Compartment,
}

/// The identity of a runtime object: the address of its heap payload.
///
/// Table slots store these (biased), the compiler boundary receives them,
/// and the registry is keyed by them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAddr(pub(crate) usize);

impl ObjectAddr {
    /// The raw address value; what compiled code and the loader see.
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// The identity of the object behind a strong handle.
    pub(crate) fn of_arc<T: ?Sized>(object: &Arc<T>) -> ObjectAddr {
        ObjectAddr(Arc::as_ptr(object) as *const () as usize)
    }

    /// The identity of the object behind a weak edge. Valid as a key even
    /// if the edge is dangling; never dereferenced.
    pub(crate) fn of_weak<T>(object: &Weak<T>) -> ObjectAddr {
        ObjectAddr(Weak::as_ptr(object) as *const () as usize)
    }

    /// The identity of the object a shared reference points into. Only
    /// valid for references to the object's own payload, which is how
    /// finalizers name themselves.
    pub(crate) fn of_ref<T>(object: &T) -> ObjectAddr {
        ObjectAddr(object as *const T as *const () as usize)
    }
}

/// Common header carried by every runtime object.
pub struct GcHeader {
    kind: ObjectKind,
    num_root_references: AtomicUsize,
}

impl GcHeader {
    pub(crate) fn new(kind: ObjectKind) -> GcHeader {
        GcHeader {
            kind,
            num_root_references: AtomicUsize::new(0),
        }
    }

    /// The object's kind tag.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub(crate) fn num_root_references(&self) -> usize {
        self.num_root_references.load(Ordering::Relaxed)
    }

    pub(crate) fn add_root_reference(&self) {
        self.num_root_references.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_root_reference(&self) {
        let previous = self.num_root_references.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0);
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("kind", &self.kind)
            .field("num_root_references", &self.num_root_references())
            .finish()
    }
}

/// Implemented by every runtime object; gives the collector its header, its
/// outgoing references, and its finalizer.
pub trait GcObject: Any + Send + Sync {
    /// The object's header.
    fn gc_header(&self) -> &GcHeader;

    /// Visit the identity of every outgoing reference this object holds.
    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr));

    /// Called on every garbage object before any of them is freed.
    /// Finalizers may resolve references to other dying objects but must
    /// not touch the registry.
    fn finalize(&self) {}

    /// Upcast for registry downcasting.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A pin that keeps an object alive across collections.
///
/// Holding a `Root` both retains the object's storage and marks it as a
/// collection root; everything reachable from it through the edge table
/// survives collection too. Dropping the last `Root` (and every handle
/// derived from it) makes the object eligible for the next collection.
pub struct Root<T: GcObject + ?Sized> {
    object: Arc<T>,
}

impl<T: GcObject + ?Sized> Root<T> {
    pub(crate) fn new(object: Arc<T>) -> Root<T> {
        object.gc_header().add_root_reference();
        Root { object }
    }

    /// The identity of the pinned object.
    pub fn addr(&self) -> ObjectAddr {
        ObjectAddr::of_arc(&self.object)
    }

    /// A weak, non-rooting handle; useful as a liveness probe.
    pub fn downgrade(&self) -> Weak<T> {
        Arc::downgrade(&self.object)
    }

    /// Whether two pins refer to the same object.
    pub fn ptr_eq(&self, other: &Root<T>) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl<T: GcObject + ?Sized> Deref for Root<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: GcObject + ?Sized> Clone for Root<T> {
    fn clone(&self) -> Root<T> {
        Root::new(self.object.clone())
    }
}

impl<T: GcObject + ?Sized> Drop for Root<T> {
    fn drop(&mut self) {
        self.object.gc_header().remove_root_reference();
    }
}

impl<T: GcObject + fmt::Debug + ?Sized> fmt::Debug for Root<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Root").field(&&*self.object).finish()
    }
}

/// A rooted handle to any exportable object.
#[derive(Clone)]
pub enum Object {
    /// A function.
    Function(Root<Function>),
    /// A table.
    Table(Root<Table>),
    /// A memory.
    Memory(Root<Memory>),
    /// A global.
    Global(Root<Global>),
    /// An exception type.
    ExceptionType(Root<ExceptionType>),
}

impl Object {
    /// The object's kind.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Function(_) => ObjectKind::Function,
            Object::Table(_) => ObjectKind::Table,
            Object::Memory(_) => ObjectKind::Memory,
            Object::Global(_) => ObjectKind::Global,
            Object::ExceptionType(_) => ObjectKind::ExceptionType,
        }
    }

    /// The object's identity.
    pub fn addr(&self) -> ObjectAddr {
        match self {
            Object::Function(o) => o.addr(),
            Object::Table(o) => o.addr(),
            Object::Memory(o) => o.addr(),
            Object::Global(o) => o.addr(),
            Object::ExceptionType(o) => o.addr(),
        }
    }

    /// The contained function, if this is one.
    pub fn as_function(&self) -> Option<&Root<Function>> {
        match self {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The contained table, if this is one.
    pub fn as_table(&self) -> Option<&Root<Table>> {
        match self {
            Object::Table(t) => Some(t),
            _ => None,
        }
    }

    /// The contained memory, if this is one.
    pub fn as_memory(&self) -> Option<&Root<Memory>> {
        match self {
            Object::Memory(m) => Some(m),
            _ => None,
        }
    }

    /// The contained global, if this is one.
    pub fn as_global(&self) -> Option<&Root<Global>> {
        match self {
            Object::Global(g) => Some(g),
            _ => None,
        }
    }

    /// The contained exception type, if this is one.
    pub fn as_exception_type(&self) -> Option<&Root<ExceptionType>> {
        match self {
            Object::ExceptionType(e) => Some(e),
            _ => None,
        }
    }
}

/// A weak, collector-traced edge to any exportable object; the form export
/// maps and passive segments store internally.
#[derive(Clone)]
pub(crate) enum ObjectEdge {
    Function(Weak<Function>),
    Table(Weak<Table>),
    Memory(Weak<Memory>),
    Global(Weak<Global>),
    ExceptionType(Weak<ExceptionType>),
}

impl ObjectEdge {
    pub(crate) fn upgrade(&self) -> Option<Object> {
        match self {
            ObjectEdge::Function(w) => w.upgrade().map(|o| Object::Function(Root::new(o))),
            ObjectEdge::Table(w) => w.upgrade().map(|o| Object::Table(Root::new(o))),
            ObjectEdge::Memory(w) => w.upgrade().map(|o| Object::Memory(Root::new(o))),
            ObjectEdge::Global(w) => w.upgrade().map(|o| Object::Global(Root::new(o))),
            ObjectEdge::ExceptionType(w) => {
                w.upgrade().map(|o| Object::ExceptionType(Root::new(o)))
            }
        }
    }
}
