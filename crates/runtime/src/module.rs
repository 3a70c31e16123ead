//! Compiled modules and module instances.
//!
//! A `Module` is the immutable pairing of a module's IR with its compiled
//! object code. A `ModuleInstance` is one instantiation of a module in a
//! compartment: the per-instantiation binding of imports, definitions,
//! exports, and passive segments, plus the handle to the loaded object
//! code. Instances are built by the pipeline in `instantiate`.

use crate::compartment::Compartment;
use crate::exception::ExceptionType;
use crate::func::Function;
use crate::gc;
use crate::global::Global;
use crate::jit::{JitCompiler, JitFunction, LoadedJitModule};
use crate::jit_function_registry;
use crate::memory::Memory;
use crate::object::{GcHeader, GcObject, Object, ObjectAddr, ObjectEdge, ObjectKind, Root};
use crate::table::Table;
use atoll_ir as ir;
use indexmap::IndexMap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// A compiled module: IR plus object code. Immutable once constructed.
pub struct Module {
    header: GcHeader,
    ir: ir::Module,
    object_code: Vec<u8>,
}

impl Module {
    /// Compile a module's IR through the external compiler.
    pub fn compile(jit: &dyn JitCompiler, ir: ir::Module) -> Root<Module> {
        let object_code = jit.compile(&ir);
        Module::from_precompiled(ir, object_code)
    }

    /// Wrap IR together with previously compiled object code; the raw
    /// constructor AOT caches use.
    pub fn from_precompiled(ir: ir::Module, object_code: Vec<u8>) -> Root<Module> {
        let module = Arc::new(Module {
            header: GcHeader::new(ObjectKind::Module),
            ir,
            object_code,
        });
        gc::register(module.clone());
        Root::new(module)
    }

    /// The module's IR.
    pub fn ir(&self) -> &ir::Module {
        &self.ir
    }

    /// The module's compiled object code. Persisting this next to the IR
    /// and reconstructing with [`Module::from_precompiled`] is the AOT
    /// caching path.
    pub fn object_code(&self) -> &[u8] {
        &self.object_code
    }
}

impl GcObject for Module {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, _visit: &mut dyn FnMut(ObjectAddr)) {}

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) struct JitState {
    pub(crate) loaded_module: LoadedJitModule,
    pub(crate) functions: Vec<Arc<JitFunction>>,
}

#[derive(Default)]
struct Inner {
    functions: Vec<Weak<Function>>,
    function_defs: Vec<Weak<Function>>,
    tables: Vec<Weak<Table>>,
    memories: Vec<Weak<Memory>>,
    globals: Vec<Weak<Global>>,
    exception_types: Vec<Weak<ExceptionType>>,
    start_function: Option<Weak<Function>>,
    default_memory: Option<Weak<Memory>>,
    default_table: Option<Weak<Table>>,
    export_map: IndexMap<String, ObjectEdge>,
}

/// An instance of a module in a compartment.
pub struct ModuleInstance {
    header: GcHeader,
    compartment: Weak<Compartment>,
    inner: Mutex<Inner>,
    passive_data_segments: Mutex<HashMap<usize, Arc<[u8]>>>,
    passive_element_segments: Mutex<HashMap<usize, Arc<Vec<Weak<Function>>>>>,
    jit_state: Mutex<Option<JitState>>,
    debug_name: String,
}

impl ModuleInstance {
    pub(crate) fn new(
        compartment: &Root<Compartment>,
        debug_name: String,
    ) -> Root<ModuleInstance> {
        let instance = Arc::new(ModuleInstance {
            header: GcHeader::new(ObjectKind::ModuleInstance),
            compartment: compartment.downgrade(),
            inner: Mutex::new(Inner::default()),
            passive_data_segments: Mutex::new(HashMap::new()),
            passive_element_segments: Mutex::new(HashMap::new()),
            jit_state: Mutex::new(None),
            debug_name,
        });
        gc::register(instance.clone());
        compartment.add_module_instance(&instance);
        Root::new(instance)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn publish(
        &self,
        functions: &[Root<Function>],
        function_defs: &[Root<Function>],
        tables: &[Root<Table>],
        memories: &[Root<Memory>],
        globals: &[Root<Global>],
        exception_types: &[Root<ExceptionType>],
        start_function: Option<&Root<Function>>,
        default_memory: Option<&Root<Memory>>,
        default_table: Option<&Root<Table>>,
        export_map: IndexMap<String, ObjectEdge>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.functions = functions.iter().map(Root::downgrade).collect();
        inner.function_defs = function_defs.iter().map(Root::downgrade).collect();
        inner.tables = tables.iter().map(Root::downgrade).collect();
        inner.memories = memories.iter().map(Root::downgrade).collect();
        inner.globals = globals.iter().map(Root::downgrade).collect();
        inner.exception_types = exception_types.iter().map(Root::downgrade).collect();
        inner.start_function = start_function.map(Root::downgrade);
        inner.default_memory = default_memory.map(Root::downgrade);
        inner.default_table = default_table.map(Root::downgrade);
        inner.export_map = export_map;
    }

    pub(crate) fn set_passive_data_segments(&self, segments: HashMap<usize, Arc<[u8]>>) {
        *self.passive_data_segments.lock().unwrap() = segments;
    }

    pub(crate) fn set_passive_element_segments(
        &self,
        segments: HashMap<usize, Arc<Vec<Weak<Function>>>>,
    ) {
        *self.passive_element_segments.lock().unwrap() = segments;
    }

    pub(crate) fn set_jit_state(&self, state: JitState) {
        *self.jit_state.lock().unwrap() = Some(state);
    }

    /// The instance's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The compartment this instance lives in.
    pub fn compartment(&self) -> Option<Root<Compartment>> {
        self.compartment.upgrade().map(Root::new)
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<Object> {
        let inner = self.inner.lock().unwrap();
        inner.export_map.get(name).and_then(ObjectEdge::upgrade)
    }

    /// All exports, in publication order.
    pub fn exports(&self) -> Vec<(String, Object)> {
        let inner = self.inner.lock().unwrap();
        inner
            .export_map
            .iter()
            .filter_map(|(name, edge)| edge.upgrade().map(|object| (name.clone(), object)))
            .collect()
    }

    /// The instance's start function, if the module declares one.
    pub fn start_function(&self) -> Option<Root<Function>> {
        let inner = self.inner.lock().unwrap();
        inner
            .start_function
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Root::new)
    }

    /// The instance's default (first) memory, if any.
    pub fn default_memory(&self) -> Option<Root<Memory>> {
        let inner = self.inner.lock().unwrap();
        inner
            .default_memory
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Root::new)
    }

    /// The instance's default (first) table, if any.
    pub fn default_table(&self) -> Option<Root<Table>> {
        let inner = self.inner.lock().unwrap();
        inner
            .default_table
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Root::new)
    }

    /// The function at the given combined (imports, then definitions)
    /// index.
    pub fn function(&self, index: usize) -> Option<Root<Function>> {
        let inner = self.inner.lock().unwrap();
        inner.functions.get(index).and_then(Weak::upgrade).map(Root::new)
    }

    /// The table at the given combined index.
    pub fn table(&self, index: usize) -> Option<Root<Table>> {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(index).and_then(Weak::upgrade).map(Root::new)
    }

    /// The memory at the given combined index.
    pub fn memory(&self, index: usize) -> Option<Root<Memory>> {
        let inner = self.inner.lock().unwrap();
        inner.memories.get(index).and_then(Weak::upgrade).map(Root::new)
    }

    /// The global at the given combined index.
    pub fn global(&self, index: usize) -> Option<Root<Global>> {
        let inner = self.inner.lock().unwrap();
        inner.globals.get(index).and_then(Weak::upgrade).map(Root::new)
    }

    /// The exception type at the given combined index.
    pub fn exception_type(&self, index: usize) -> Option<Root<ExceptionType>> {
        let inner = self.inner.lock().unwrap();
        inner
            .exception_types
            .get(index)
            .and_then(Weak::upgrade)
            .map(Root::new)
    }

    /// Number of functions, imports plus definitions.
    pub fn num_functions(&self) -> usize {
        self.inner.lock().unwrap().functions.len()
    }

    /// Number of tables, imports plus definitions.
    pub fn num_tables(&self) -> usize {
        self.inner.lock().unwrap().tables.len()
    }

    /// Number of memories, imports plus definitions.
    pub fn num_memories(&self) -> usize {
        self.inner.lock().unwrap().memories.len()
    }

    /// Number of globals, imports plus definitions.
    pub fn num_globals(&self) -> usize {
        self.inner.lock().unwrap().globals.len()
    }

    /// Number of exception types, imports plus definitions.
    pub fn num_exception_types(&self) -> usize {
        self.inner.lock().unwrap().exception_types.len()
    }

    /// A passive data segment's payload, if it is still live.
    pub fn passive_data_segment(&self, segment_index: usize) -> Option<Arc<[u8]>> {
        self.passive_data_segments
            .lock()
            .unwrap()
            .get(&segment_index)
            .cloned()
    }

    /// Discard a passive data segment (`data.drop`). Returns whether the
    /// segment was still live.
    pub fn drop_passive_data_segment(&self, segment_index: usize) -> bool {
        self.passive_data_segments
            .lock()
            .unwrap()
            .remove(&segment_index)
            .is_some()
    }

    /// A passive element segment's functions, if the segment is still
    /// live.
    pub fn passive_element_segment(&self, segment_index: usize) -> Option<Vec<Root<Function>>> {
        let segments = self.passive_element_segments.lock().unwrap();
        let segment = segments.get(&segment_index)?;
        Some(
            segment
                .iter()
                .filter_map(Weak::upgrade)
                .map(Root::new)
                .collect(),
        )
    }

    /// Discard a passive element segment (`elem.drop`). Returns whether
    /// the segment was still live.
    pub fn drop_passive_element_segment(&self, segment_index: usize) -> bool {
        self.passive_element_segments
            .lock()
            .unwrap()
            .remove(&segment_index)
            .is_some()
    }
}

impl GcObject for ModuleInstance {
    fn gc_header(&self) -> &GcHeader {
        &self.header
    }

    fn trace(&self, visit: &mut dyn FnMut(ObjectAddr)) {
        visit(ObjectAddr::of_weak(&self.compartment));

        let inner = self.inner.lock().unwrap();
        for function in &inner.functions {
            visit(ObjectAddr::of_weak(function));
        }
        for table in &inner.tables {
            visit(ObjectAddr::of_weak(table));
        }
        for memory in &inner.memories {
            visit(ObjectAddr::of_weak(memory));
        }
        for global in &inner.globals {
            visit(ObjectAddr::of_weak(global));
        }
        for exception_type in &inner.exception_types {
            visit(ObjectAddr::of_weak(exception_type));
        }
        drop(inner);

        // The export map and the defined-function list alias the vectors
        // above; passive element segments hold the only other references.
        let passive = self.passive_element_segments.lock().unwrap();
        for segment in passive.values() {
            for function in segment.iter() {
                visit(ObjectAddr::of_weak(function));
            }
        }
    }

    fn finalize(&self) {
        if let Some(compartment) = self.compartment.upgrade() {
            compartment.remove_module_instance(ObjectAddr::of_ref(self));
        }
        if let Some(state) = self.jit_state.lock().unwrap().take() {
            for function in &state.functions {
                jit_function_registry::unregister(function);
            }
            // Dropping the handle unloads the compiled image.
            drop(state.loaded_module);
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
