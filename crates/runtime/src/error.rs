//! The typed errors the runtime core surfaces.
//!
//! Recoverable errors unwind out of the failing operation as `Err` values
//! and leave no partial state visible; objects created before a failure
//! become unreachable and are reclaimed by the next collection. Invariant
//! violations inside the core are not recoverable and go through [`fatal`].

use crate::object::ObjectKind;
use thiserror::Error;

/// An error surfaced by the runtime core.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Import type mismatch, duplicate export, invalid initializer, or
    /// unresolved symbol while wiring a module into a compartment.
    #[error("link error: {0}")]
    Link(String),

    /// A memory or table could not reserve or commit address space, or
    /// growth ran past the reserved region.
    #[error("out of memory")]
    OutOfMemory,

    /// A memory access or segment base was outside the memory's committed
    /// pages.
    #[error("out-of-bounds access at address {address:#x} in memory {memory}")]
    OutOfBoundsMemoryAccess {
        /// Debug name of the offending memory.
        memory: String,
        /// The offending address.
        address: u64,
    },

    /// A table access or segment base was outside the table's current
    /// elements.
    #[error("out-of-bounds access at element {index} in table {table}")]
    OutOfBoundsTableAccess {
        /// Debug name of the offending table.
        table: String,
        /// The offending element index.
        index: u64,
    },

    /// A compartment ran out of ids for the given resource kind.
    #[error("compartment has no free {kind:?} ids")]
    ResourceIdExhausted {
        /// The kind whose id space is exhausted.
        kind: ObjectKind,
    },

    /// A compartment ran out of mutable-global slots.
    #[error("compartment has no free mutable-global slots")]
    TooManyMutableGlobals,

    /// Guest code invoked an intrinsic that has no implementation.
    #[error("called unimplemented intrinsic {name}")]
    CalledUnimplementedIntrinsic {
        /// Debug name of the intrinsic function.
        name: String,
    },

    /// An argument passed to `invoke` did not match the function's
    /// signature.
    #[error("invalid argument for {function}: {message}")]
    InvalidArgument {
        /// Debug name of the function being invoked.
        function: String,
        /// What was wrong with the arguments.
        message: String,
    },
}

/// Terminate the process on an unrecoverable invariant violation.
///
/// There is deliberately no unwinding here: a broken core invariant means
/// the object graph can no longer be trusted.
pub(crate) fn fatal(message: &str) -> ! {
    log::error!("fatal runtime error: {}", message);
    std::process::abort()
}
