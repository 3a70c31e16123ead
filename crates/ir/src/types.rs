//! Type vocabulary shared between the IR and the runtime: value types,
//! function signatures, and the declared types of tables, memories, globals,
//! and exception types, along with the subtype relations import checking
//! relies on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of a WebAssembly value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 128-bit vector.
    V128,
    /// A reference to any object.
    AnyRef,
    /// A reference to any function.
    AnyFunc,
}

impl ValueType {
    /// Whether this is a reference type.
    pub fn is_reference_type(self) -> bool {
        matches!(self, ValueType::AnyRef | ValueType::AnyFunc)
    }

    /// The subtype relation on value types: reflexive, plus
    /// `anyfunc <: anyref`.
    pub fn is_subtype_of(self, supertype: ValueType) -> bool {
        self == supertype || (self == ValueType::AnyFunc && supertype == ValueType::AnyRef)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::V128 => "v128",
            ValueType::AnyRef => "anyref",
            ValueType::AnyFunc => "anyfunc",
        };
        f.write_str(name)
    }
}

/// The element type of a table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    /// Any object reference.
    AnyRef,
    /// Any function reference.
    AnyFunc,
}

impl ReferenceType {
    /// The value type corresponding to this reference type.
    pub fn as_value_type(self) -> ValueType {
        match self {
            ReferenceType::AnyRef => ValueType::AnyRef,
            ReferenceType::AnyFunc => ValueType::AnyFunc,
        }
    }
}

/// A function signature: parameter and result types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    params: Box<[ValueType]>,
    results: Box<[ValueType]>,
}

impl FunctionType {
    /// Create a signature from parameter and result types.
    pub fn new(
        params: impl Into<Box<[ValueType]>>,
        results: impl Into<Box<[ValueType]>>,
    ) -> FunctionType {
        FunctionType {
            params: params.into(),
            results: results.into(),
        }
    }

    /// The empty `() -> ()` signature, required of start functions.
    pub fn empty() -> FunctionType {
        FunctionType {
            params: Box::new([]),
            results: Box::new([]),
        }
    }

    /// Parameter types.
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Result types.
    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    /// Function subtyping is invariant: signatures must match exactly.
    pub fn is_subtype_of(&self, supertype: &FunctionType) -> bool {
        self == supertype
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> (")?;
        for (i, result) in self.results.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", result)?;
        }
        write!(f, ")")
    }
}

/// Minimum and optional maximum sizes for a memory (in pages) or table (in
/// elements).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SizeConstraints {
    /// The initial size.
    pub min: u64,
    /// The size the resource may grow to, if bounded.
    pub max: Option<u64>,
}

impl SizeConstraints {
    /// Whether a resource declared with `self` satisfies an import declared
    /// with `declared`: at least as large initially, and never allowed to
    /// outgrow the declared bound.
    pub fn is_subtype_of(&self, declared: &SizeConstraints) -> bool {
        if self.min < declared.min {
            return false;
        }
        match declared.max {
            None => true,
            Some(declared_max) => match self.max {
                Some(max) => max <= declared_max,
                None => false,
            },
        }
    }
}

/// The declared type of a linear memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryType {
    /// Size bounds, in 64KiB pages.
    pub size: SizeConstraints,
    /// Whether the memory may be shared between threads.
    pub shared: bool,
}

impl MemoryType {
    /// Import compatibility for memories.
    pub fn is_subtype_of(&self, declared: &MemoryType) -> bool {
        self.shared == declared.shared && self.size.is_subtype_of(&declared.size)
    }
}

/// The declared type of a table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableType {
    /// The type of the table's elements.
    pub element_type: ReferenceType,
    /// Size bounds, in elements.
    pub size: SizeConstraints,
    /// Whether the table may be shared between threads.
    pub shared: bool,
}

impl TableType {
    /// Import compatibility for tables.
    pub fn is_subtype_of(&self, declared: &TableType) -> bool {
        self.element_type == declared.element_type
            && self.shared == declared.shared
            && self.size.is_subtype_of(&declared.size)
    }
}

/// The declared type of a global.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalType {
    /// The type of the global's value.
    pub value_type: ValueType,
    /// Whether the global may be written after initialization.
    pub mutable: bool,
}

impl GlobalType {
    /// Import compatibility for globals: mutable globals are invariant,
    /// immutable globals are covariant in their value type.
    pub fn is_subtype_of(&self, declared: &GlobalType) -> bool {
        if declared.mutable {
            self.mutable && self.value_type == declared.value_type
        } else {
            !self.mutable && self.value_type.is_subtype_of(declared.value_type)
        }
    }
}

/// The declared type of an exception: the types of the values it carries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionType {
    /// The exception's parameter types.
    pub params: Box<[ValueType]>,
}

impl ExceptionType {
    /// Exception subtyping is invariant.
    pub fn is_subtype_of(&self, declared: &ExceptionType) -> bool {
        self == declared
    }
}

/// The calling convention a function's native entry point uses.
///
/// Guest code can only call `Wasm`-convention entries directly; the other
/// conventions need a thunk generated by the compiler boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallingConvention {
    /// The compiled-wasm calling convention.
    Wasm,
    /// A host intrinsic taking the context runtime data as a hidden first
    /// argument.
    Intrinsic,
    /// A plain C function.
    C,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_subtyping() {
        assert!(ValueType::I32.is_subtype_of(ValueType::I32));
        assert!(ValueType::AnyFunc.is_subtype_of(ValueType::AnyRef));
        assert!(!ValueType::AnyRef.is_subtype_of(ValueType::AnyFunc));
        assert!(!ValueType::I32.is_subtype_of(ValueType::I64));
    }

    #[test]
    fn size_constraint_subtyping() {
        let declared = SizeConstraints {
            min: 1,
            max: Some(4),
        };
        assert!(SizeConstraints {
            min: 1,
            max: Some(4)
        }
        .is_subtype_of(&declared));
        assert!(SizeConstraints {
            min: 2,
            max: Some(3)
        }
        .is_subtype_of(&declared));
        assert!(!SizeConstraints { min: 0, max: None }.is_subtype_of(&declared));
        assert!(!SizeConstraints {
            min: 1,
            max: Some(5)
        }
        .is_subtype_of(&declared));
        assert!(SizeConstraints {
            min: 9,
            max: Some(9)
        }
        .is_subtype_of(&SizeConstraints { min: 1, max: None }));
    }

    #[test]
    fn global_subtyping() {
        let mutable_i32 = GlobalType {
            value_type: ValueType::I32,
            mutable: true,
        };
        let immutable_i32 = GlobalType {
            value_type: ValueType::I32,
            mutable: false,
        };
        assert!(mutable_i32.is_subtype_of(&mutable_i32));
        assert!(!immutable_i32.is_subtype_of(&mutable_i32));
        assert!(!mutable_i32.is_subtype_of(&immutable_i32));
        let immutable_anyfunc = GlobalType {
            value_type: ValueType::AnyFunc,
            mutable: false,
        };
        let immutable_anyref = GlobalType {
            value_type: ValueType::AnyRef,
            mutable: false,
        };
        assert!(immutable_anyfunc.is_subtype_of(&immutable_anyref));
    }
}
