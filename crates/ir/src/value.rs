//! Runtime values and the untyped 16-byte storage cell that globals,
//! invoke-thunk buffers, and the per-context mutable-global area are made
//! of.

use crate::types::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed WebAssembly value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// A 128-bit vector.
    V128(u128),
    /// A null reference.
    NullRef,
}

impl Value {
    /// The type of this value. Null references report `anyfunc`, the bottom
    /// of the reference lattice, so they satisfy any reference type.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::V128(_) => ValueType::V128,
            Value::NullRef => ValueType::AnyFunc,
        }
    }

    /// Store this value into an untyped cell.
    pub fn to_untagged(&self) -> UntaggedValue {
        let mut untagged = UntaggedValue::zeroed();
        match *self {
            Value::I32(x) => untagged.set_i32(x),
            Value::I64(x) => untagged.set_i64(x),
            Value::F32(x) => untagged.set_f32(x),
            Value::F64(x) => untagged.set_f64(x),
            Value::V128(x) => untagged.set_u128(x),
            Value::NullRef => {}
        }
        untagged
    }

    /// Read a value of the given type out of an untyped cell.
    pub fn from_untagged(value_type: ValueType, untagged: &UntaggedValue) -> Value {
        match value_type {
            ValueType::I32 => Value::I32(untagged.as_i32()),
            ValueType::I64 => Value::I64(untagged.as_i64()),
            ValueType::F32 => Value::F32(untagged.as_f32()),
            ValueType::F64 => Value::F64(untagged.as_f64()),
            ValueType::V128 => Value::V128(untagged.as_u128()),
            ValueType::AnyRef | ValueType::AnyFunc => Value::NullRef,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(x) => write!(f, "i32.const {}", x),
            Value::I64(x) => write!(f, "i64.const {}", x),
            Value::F32(x) => write!(f, "f32.const {}", x),
            Value::F64(x) => write!(f, "f64.const {}", x),
            Value::V128(x) => write!(f, "v128.const {:#x}", x),
            Value::NullRef => write!(f, "ref.null"),
        }
    }
}

/// Sixteen bytes of untyped, 16-byte-aligned value storage.
///
/// All reads and writes go through the typed accessors; the zeroed cell is a
/// valid encoding of every type (and of the null reference), which is what
/// makes freshly committed zero pages valid mutable-global areas.
#[derive(Copy, Clone, Default, Serialize, Deserialize)]
#[repr(C, align(16))]
pub struct UntaggedValue {
    storage: [u8; 16],
}

impl UntaggedValue {
    /// An all-zero cell.
    pub fn zeroed() -> UntaggedValue {
        UntaggedValue { storage: [0; 16] }
    }

    /// Read the cell as an `i32`.
    pub fn as_i32(&self) -> i32 {
        i32::from_le_bytes(self.storage[..4].try_into().unwrap())
    }

    /// Read the cell as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.as_i32() as u32
    }

    /// Read the cell as an `i64`.
    pub fn as_i64(&self) -> i64 {
        i64::from_le_bytes(self.storage[..8].try_into().unwrap())
    }

    /// Read the cell as an `f32`.
    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.as_u32())
    }

    /// Read the cell as an `f64`.
    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.as_i64() as u64)
    }

    /// Read the cell as a `u128`.
    pub fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.storage)
    }

    /// Store an `i32` into the cell.
    pub fn set_i32(&mut self, x: i32) {
        self.storage[..4].copy_from_slice(&x.to_le_bytes());
    }

    /// Store an `i64` into the cell.
    pub fn set_i64(&mut self, x: i64) {
        self.storage[..8].copy_from_slice(&x.to_le_bytes());
    }

    /// Store an `f32` into the cell.
    pub fn set_f32(&mut self, x: f32) {
        self.storage[..4].copy_from_slice(&x.to_bits().to_le_bytes());
    }

    /// Store an `f64` into the cell.
    pub fn set_f64(&mut self, x: f64) {
        self.storage[..8].copy_from_slice(&x.to_bits().to_le_bytes());
    }

    /// Store a `u128` into the cell.
    pub fn set_u128(&mut self, x: u128) {
        self.storage.copy_from_slice(&x.to_le_bytes());
    }
}

impl fmt::Debug for UntaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UntaggedValue({:#034x})", self.as_u128())
    }
}
