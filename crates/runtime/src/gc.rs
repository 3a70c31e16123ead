//! The process-wide object registry and the stop-the-world mark/sweep
//! collector.
//!
//! Every object factory registers the new object here before the pointer is
//! published anywhere else; the registry holds the only strong reference,
//! so unregistering an object in the sweep is what frees it (once any
//! remaining pins drop). The registry mutex is held for the entire
//! collection cycle, and object registration takes the same mutex, so a
//! collection observes a consistent snapshot. Root-reference counts may
//! change outside the mutex, but a count can only be raised from zero by
//! code that already holds a rooted handle, so a root observed as zero
//! under the mutex stays collectible.

use crate::object::{GcObject, ObjectAddr, Root};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

lazy_static! {
    static ref GC_GLOBALS: Mutex<GcGlobals> = Mutex::new(GcGlobals {
        all_objects: HashMap::new(),
    });
}

struct GcGlobals {
    all_objects: HashMap<ObjectAddr, Arc<dyn GcObject>>,
}

/// Enter a freshly constructed object into the registry. Must happen before
/// the object's address is published to any other thread.
pub(crate) fn register<T: GcObject>(object: Arc<T>) {
    let addr = ObjectAddr::of_arc(&object);
    let mut globals = GC_GLOBALS.lock().unwrap();
    let previous = globals.all_objects.insert(addr, object);
    debug_assert!(previous.is_none());
}

/// Resolve an object identity back to a live object, if it is still
/// registered.
pub(crate) fn lookup(addr: ObjectAddr) -> Option<Arc<dyn GcObject>> {
    GC_GLOBALS.lock().unwrap().all_objects.get(&addr).cloned()
}

/// Resolve an object identity to a rooted handle of a concrete kind.
pub(crate) fn lookup_object<T: GcObject>(addr: ObjectAddr) -> Option<Root<T>> {
    let object = lookup(addr)?;
    let concrete = object.as_any_arc().downcast::<T>().ok()?;
    Some(Root::new(concrete))
}

/// Collect every object not reachable from a root.
///
/// Stop-the-world, precise mark/sweep: snapshot the registry, seed the mark
/// stack with every root-referenced object, trace the kind-specific edges,
/// then finalize and free what remains. Finalization runs over the whole
/// garbage set before anything is freed, because finalizers may resolve
/// references to other dying objects (a dying module instance still locks
/// its dying compartment to deregister itself).
pub fn collect_garbage() {
    let mut globals = GC_GLOBALS.lock().unwrap();
    let start = Instant::now();

    let mut unreferenced: HashMap<ObjectAddr, Arc<dyn GcObject>> = globals.all_objects.clone();
    let mut pending_scan: Vec<Arc<dyn GcObject>> = Vec::new();

    let mut num_roots = 0;
    for (addr, object) in globals.all_objects.iter() {
        if object.gc_header().num_root_references() > 0 {
            unreferenced.remove(addr);
            pending_scan.push(object.clone());
            num_roots += 1;
        }
    }

    while let Some(object) = pending_scan.pop() {
        object.trace(&mut |addr| {
            if let Some(referenced) = unreferenced.remove(&addr) {
                pending_scan.push(referenced);
            }
        });
    }

    // Finalize pass: immutable over the garbage set.
    for object in unreferenced.values() {
        object.finalize();
    }

    // Free pass: drop the registry's strong references.
    for addr in unreferenced.keys() {
        globals.all_objects.remove(addr);
    }
    let num_garbage = unreferenced.len();
    drop(unreferenced);

    log::debug!(
        "collected garbage in {:?}: {} roots, {} live objects, {} garbage",
        start.elapsed(),
        num_roots,
        globals.all_objects.len(),
        num_garbage,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{GcHeader, ObjectKind};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    struct Leaf {
        header: GcHeader,
    }

    impl GcObject for Leaf {
        fn gc_header(&self) -> &GcHeader {
            &self.header
        }

        fn trace(&self, _visit: &mut dyn FnMut(ObjectAddr)) {}

        fn finalize(&self) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let leaf = Arc::new(Leaf {
            header: GcHeader::new(ObjectKind::Module),
        });
        register(leaf.clone());
        let root = Root::new(leaf);
        let probe = root.downgrade();

        collect_garbage();
        assert!(probe.upgrade().is_some());

        drop(root);
        collect_garbage();
        assert!(probe.upgrade().is_none());
        assert!(FINALIZED.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn lookup_resolves_registered_objects() {
        let leaf = Arc::new(Leaf {
            header: GcHeader::new(ObjectKind::Module),
        });
        register(leaf.clone());
        let root = Root::new(leaf);
        assert!(lookup(root.addr()).is_some());
        assert!(lookup_object::<Leaf>(root.addr()).is_some());
        assert!(lookup(ObjectAddr(1)).is_none());
    }
}
