//! Data structures describing a decoded WebAssembly module, in the form the
//! runtime core consumes it: types, entity tables with imports-first index
//! spaces, initializer expressions, data/element segments, exports, and
//! debug names.
//!
//! The decoder and validator that produce these structures are external to
//! this workspace; so is the compiler that lowers function bodies. This
//! crate deliberately carries no function bodies at all, only the metadata
//! instantiation needs.

#![deny(missing_docs)]

mod module;
mod types;
mod value;

pub use crate::module::{
    DataSegment, DataSegmentMode, ElementSegment, ElementSegmentMode, EntityIndex,
    ExceptionTypeIndex, Export, FuncIndex, GlobalDesc, GlobalIndex, Import, InitializerExpression,
    MemoryIndex, Module, NameSection, TableIndex, TypeIndex,
};
pub use crate::types::{
    CallingConvention, ExceptionType, FunctionType, GlobalType, MemoryType, ReferenceType,
    SizeConstraints, TableType, ValueType,
};
pub use crate::value::{UntaggedValue, Value};

pub use cranelift_entity::{EntityRef, PrimaryMap};
