//! Process-wide map from code address to `JitFunction`, used by the
//! stack-walking exception machinery to attribute frames.

use crate::jit::JitFunction;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref REGISTRY: RwLock<JitFunctionRegistry> = RwLock::new(JitFunctionRegistry::default());
}

#[derive(Default)]
struct JitFunctionRegistry {
    // Keyed by the exclusive end of each function's code range.
    ranges: BTreeMap<usize, Arc<JitFunction>>,
}

impl JitFunctionRegistry {
    fn register(&mut self, function: Arc<JitFunction>) {
        let end = function.base_address + function.num_bytes;
        self.ranges.insert(end, function);
    }

    fn unregister(&mut self, function: &JitFunction) {
        self.ranges.remove(&(function.base_address + function.num_bytes));
    }

    fn find(&self, pc: usize) -> Option<&Arc<JitFunction>> {
        self.ranges.range(pc..).next().and_then(|(end, function)| {
            if function.base_address <= pc && pc < *end {
                Some(function)
            } else {
                None
            }
        })
    }
}

pub(crate) fn register(function: Arc<JitFunction>) {
    REGISTRY
        .write()
        .expect("jit function registry lock got poisoned")
        .register(function);
}

pub(crate) fn unregister(function: &JitFunction) {
    REGISTRY
        .write()
        .expect("jit function registry lock got poisoned")
        .unregister(function);
}

/// Find the function whose code contains the given address, if any.
pub fn jit_function_by_address(pc: usize) -> Option<Arc<JitFunction>> {
    REGISTRY
        .read()
        .expect("jit function registry lock got poisoned")
        .find(pc)
        .cloned()
}
