//! The module record: entity tables with imports-first index spaces,
//! initializer expressions, segments, exports, and debug names.

use crate::types::{ExceptionType, FunctionType, GlobalType, MemoryType, TableType};
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap};
use serde::{Deserialize, Serialize};

/// Index of a function (imported or defined) within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex, "func");

/// Index of a table (imported or defined) within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIndex(u32);
entity_impl!(TableIndex, "table");

/// Index of a memory (imported or defined) within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryIndex(u32);
entity_impl!(MemoryIndex, "memory");

/// Index of a global (imported or defined) within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex, "global");

/// Index of an exception type (imported or defined) within a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExceptionTypeIndex(u32);
entity_impl!(ExceptionTypeIndex, "exception_type");

/// Index of a function signature in the module's type table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex, "type");

/// An index into one of the module's entity index spaces; the form imports
/// and exports use to designate an entity.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum EntityIndex {
    /// A function.
    Function(FuncIndex),
    /// A table.
    Table(TableIndex),
    /// A memory.
    Memory(MemoryIndex),
    /// A global.
    Global(GlobalIndex),
    /// An exception type.
    ExceptionType(ExceptionTypeIndex),
}

/// A constant expression evaluated at instantiation time to produce a
/// global's initial value or a segment's base offset.
///
/// The only non-constant form is a reference to a previously declared
/// imported immutable global. `Import` marks a global whose value comes from
/// the import vector rather than an expression; it is rejected wherever an
/// expression is actually evaluated.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InitializerExpression {
    /// An `i32` constant.
    I32Const(i32),
    /// An `i64` constant.
    I64Const(i64),
    /// An `f32` constant, as its bit pattern.
    F32Const(u32),
    /// An `f64` constant, as its bit pattern.
    F64Const(u64),
    /// A `v128` constant.
    V128Const(u128),
    /// The value of an imported immutable global.
    GetGlobal(GlobalIndex),
    /// A null reference.
    RefNull,
    /// Placeholder for imported globals, which have no initializer.
    Import,
}

/// A global declaration: its type, and its initializer (or `Import`).
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct GlobalDesc {
    /// The global's declared type.
    pub ty: GlobalType,
    /// How the global's initial value is produced.
    pub initializer: InitializerExpression,
}

/// Whether a data segment is copied at instantiation or retained for later
/// `memory.init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DataSegmentMode {
    /// Copied into a memory during instantiation.
    Active {
        /// The memory the segment is copied into.
        memory_index: MemoryIndex,
        /// The base offset expression; must evaluate to an `i32`.
        base_offset: InitializerExpression,
    },
    /// Retained by the module instance for later bulk-memory use.
    Passive,
}

/// A data segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSegment {
    /// Active or passive.
    pub mode: DataSegmentMode,
    /// The segment's bytes.
    pub data: Vec<u8>,
}

/// Whether an element segment is written into a table at instantiation or
/// retained for later `table.init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ElementSegmentMode {
    /// Written into a table during instantiation.
    Active {
        /// The table the segment is written into.
        table_index: TableIndex,
        /// The base offset expression; must evaluate to an `i32`.
        base_offset: InitializerExpression,
    },
    /// Retained by the module instance for later bulk-table use.
    Passive,
}

/// An element segment: a list of function indices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElementSegment {
    /// Active or passive.
    pub mode: ElementSegmentMode,
    /// The functions the segment references.
    pub indices: Vec<FuncIndex>,
}

/// An import declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Import {
    /// The module name the import is resolved in.
    pub module: String,
    /// The field name within that module.
    pub field: String,
    /// Which entity the import binds.
    pub entity: EntityIndex,
}

/// An export declaration. Duplicate names are representable here;
/// instantiation rejects them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Export {
    /// The exported name.
    pub name: String,
    /// The entity being exported.
    pub entity: EntityIndex,
}

/// Debug names from the module's name section, in declaration order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NameSection {
    /// Function names.
    pub functions: Vec<(FuncIndex, String)>,
    /// Table names.
    pub tables: Vec<(TableIndex, String)>,
    /// Memory names.
    pub memories: Vec<(MemoryIndex, String)>,
    /// Global names.
    pub globals: Vec<(GlobalIndex, String)>,
}

impl NameSection {
    /// The name recorded for a function, if any.
    pub fn function_name(&self, index: FuncIndex) -> Option<&str> {
        self.functions
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name.as_str())
    }

    /// The name recorded for a table, if any.
    pub fn table_name(&self, index: TableIndex) -> Option<&str> {
        self.tables
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name.as_str())
    }

    /// The name recorded for a memory, if any.
    pub fn memory_name(&self, index: MemoryIndex) -> Option<&str> {
        self.memories
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name.as_str())
    }

    /// The name recorded for a global, if any.
    pub fn global_name(&self, index: GlobalIndex) -> Option<&str> {
        self.globals
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, name)| name.as_str())
    }
}

/// A decoded WebAssembly module, excluding function bodies.
///
/// Each entity table lists imports first, then definitions, in declaration
/// order; the `num_imported_*` fields record where the boundary falls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    /// The module's name, if the name section provides one.
    pub name: Option<String>,

    /// Function signatures referenced by `functions`.
    pub types: PrimaryMap<TypeIndex, FunctionType>,

    /// All import records, in declaration order.
    pub imports: Vec<Import>,

    /// All export records, in declaration order.
    pub exports: Vec<Export>,

    /// The start function, if the module declares one.
    pub start_func: Option<FuncIndex>,

    /// Types of all functions, imported and defined.
    pub functions: PrimaryMap<FuncIndex, TypeIndex>,

    /// Types of all tables, imported and defined.
    pub tables: PrimaryMap<TableIndex, TableType>,

    /// Types of all memories, imported and defined.
    pub memories: PrimaryMap<MemoryIndex, MemoryType>,

    /// All globals, imported and defined.
    pub globals: PrimaryMap<GlobalIndex, GlobalDesc>,

    /// All exception types, imported and defined.
    pub exception_types: PrimaryMap<ExceptionTypeIndex, ExceptionType>,

    /// Number of imported functions.
    pub num_imported_funcs: usize,
    /// Number of imported tables.
    pub num_imported_tables: usize,
    /// Number of imported memories.
    pub num_imported_memories: usize,
    /// Number of imported globals.
    pub num_imported_globals: usize,
    /// Number of imported exception types.
    pub num_imported_exception_types: usize,

    /// Data segments, in declaration order.
    pub data_segments: Vec<DataSegment>,

    /// Element segments, in declaration order.
    pub element_segments: Vec<ElementSegment>,

    /// Debug names.
    pub names: NameSection,
}

impl Module {
    /// Allocate an empty module.
    pub fn new() -> Module {
        Module {
            name: None,
            types: PrimaryMap::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            start_func: None,
            functions: PrimaryMap::new(),
            tables: PrimaryMap::new(),
            memories: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            exception_types: PrimaryMap::new(),
            num_imported_funcs: 0,
            num_imported_tables: 0,
            num_imported_memories: 0,
            num_imported_globals: 0,
            num_imported_exception_types: 0,
            data_segments: Vec::new(),
            element_segments: Vec::new(),
            names: NameSection::default(),
        }
    }

    /// Test whether the given function index is for an imported function.
    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        index.index() < self.num_imported_funcs
    }

    /// Convert a defined-function position into a `FuncIndex`.
    pub fn func_index(&self, defined: usize) -> FuncIndex {
        FuncIndex::new(self.num_imported_funcs + defined)
    }

    /// Convert a `FuncIndex` into a defined-function position, or `None` for
    /// imports.
    pub fn defined_func_index(&self, func: FuncIndex) -> Option<usize> {
        func.index().checked_sub(self.num_imported_funcs)
    }

    /// Test whether the given table index is for an imported table.
    pub fn is_imported_table(&self, index: TableIndex) -> bool {
        index.index() < self.num_imported_tables
    }

    /// Convert a defined-table position into a `TableIndex`.
    pub fn table_index(&self, defined: usize) -> TableIndex {
        TableIndex::new(self.num_imported_tables + defined)
    }

    /// Convert a `TableIndex` into a defined-table position, or `None` for
    /// imports.
    pub fn defined_table_index(&self, table: TableIndex) -> Option<usize> {
        table.index().checked_sub(self.num_imported_tables)
    }

    /// Test whether the given memory index is for an imported memory.
    pub fn is_imported_memory(&self, index: MemoryIndex) -> bool {
        index.index() < self.num_imported_memories
    }

    /// Convert a defined-memory position into a `MemoryIndex`.
    pub fn memory_index(&self, defined: usize) -> MemoryIndex {
        MemoryIndex::new(self.num_imported_memories + defined)
    }

    /// Convert a `MemoryIndex` into a defined-memory position, or `None` for
    /// imports.
    pub fn defined_memory_index(&self, memory: MemoryIndex) -> Option<usize> {
        memory.index().checked_sub(self.num_imported_memories)
    }

    /// Test whether the given global index is for an imported global.
    pub fn is_imported_global(&self, index: GlobalIndex) -> bool {
        index.index() < self.num_imported_globals
    }

    /// Convert a defined-global position into a `GlobalIndex`.
    pub fn global_index(&self, defined: usize) -> GlobalIndex {
        GlobalIndex::new(self.num_imported_globals + defined)
    }

    /// Convert a `GlobalIndex` into a defined-global position, or `None` for
    /// imports.
    pub fn defined_global_index(&self, global: GlobalIndex) -> Option<usize> {
        global.index().checked_sub(self.num_imported_globals)
    }

    /// Number of defined (non-imported) functions.
    pub fn num_defined_funcs(&self) -> usize {
        self.functions.len() - self.num_imported_funcs
    }

    /// Number of defined (non-imported) tables.
    pub fn num_defined_tables(&self) -> usize {
        self.tables.len() - self.num_imported_tables
    }

    /// Number of defined (non-imported) memories.
    pub fn num_defined_memories(&self) -> usize {
        self.memories.len() - self.num_imported_memories
    }

    /// Number of defined (non-imported) globals.
    pub fn num_defined_globals(&self) -> usize {
        self.globals.len() - self.num_imported_globals
    }

    /// Number of defined (non-imported) exception types.
    pub fn num_defined_exception_types(&self) -> usize {
        self.exception_types.len() - self.num_imported_exception_types
    }

    /// Look up the signature of a function.
    pub fn func_type(&self, func: FuncIndex) -> &FunctionType {
        &self.types[self.functions[func]]
    }
}

impl Default for Module {
    fn default() -> Module {
        Module::new()
    }
}
