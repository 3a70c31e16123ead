//! Collector tests: root preservation, cycle reclamation, and the weak
//! back-references finalizers clear.

mod common;

use atoll_ir::{EntityIndex, EntityRef, InitializerExpression, Value, ValueType};
use atoll_runtime::{
    collect_garbage, instantiate_module, Compartment, Context, Global, ImportBindings, Memory,
    Module,
};
use common::StubCompiler;

#[test]
fn rooted_compartment_and_intrinsics_survive() {
    common::init_logging();
    let compartment = Compartment::new().unwrap();
    let compartment_probe = compartment.downgrade();
    let intrinsics_probe = compartment.intrinsics_instance().downgrade();

    collect_garbage();
    assert!(compartment_probe.upgrade().is_some());
    // The compartment's trace keeps its intrinsics instance alive even
    // though nothing pins it.
    assert!(intrinsics_probe.upgrade().is_some());

    drop(compartment);
    collect_garbage();
    assert!(compartment_probe.upgrade().is_none());
    assert!(intrinsics_probe.upgrade().is_none());
}

#[test]
fn cross_instance_cycle_is_reclaimed() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    // Instance B defines and exports a function.
    let mut ir_b = atoll_ir::Module::new();
    let f = common::define_function(&mut ir_b, common::function_type(&[], &[]));
    common::export(&mut ir_b, "f", EntityIndex::Function(f));
    let module_b = Module::compile(&jit, ir_b);
    let instance_b = instantiate_module(
        &jit,
        &compartment,
        &module_b,
        ImportBindings::default(),
        "exporter",
    )
    .unwrap();
    let imported = instance_b.export("f").unwrap().as_function().unwrap().clone();

    // Instance A imports it and installs it in its default table, closing
    // the A -> table -> f -> B chain on top of the f <-> B cycle.
    let mut ir_a = atoll_ir::Module::new();
    common::import_function(&mut ir_a, common::function_type(&[], &[]));
    let t = common::define_table(&mut ir_a, 1, Some(1));
    common::active_element_segment(
        &mut ir_a,
        t,
        InitializerExpression::I32Const(0),
        vec![atoll_ir::FuncIndex::new(0)],
    );
    let module_a = Module::compile(&jit, ir_a);
    let instance_a = instantiate_module(
        &jit,
        &compartment,
        &module_a,
        ImportBindings {
            functions: vec![imported.clone()],
            ..ImportBindings::default()
        },
        "importer",
    )
    .unwrap();

    let table = instance_a.default_table().unwrap();
    assert!(table.get(0).unwrap().unwrap().ptr_eq(&imported));

    let instance_a_probe = instance_a.downgrade();
    let instance_b_probe = instance_b.downgrade();
    let function_probe = imported.downgrade();
    let table_probe = table.downgrade();

    // While any of them is rooted, tracing keeps the whole clique alive.
    drop(instance_a);
    drop(instance_b);
    drop(imported);
    collect_garbage();
    assert!(table_probe.upgrade().is_some());
    assert!(function_probe.upgrade().is_some());

    drop(table);
    collect_garbage();
    assert!(instance_a_probe.upgrade().is_none());
    assert!(instance_b_probe.upgrade().is_none());
    assert!(function_probe.upgrade().is_none());
    assert!(table_probe.upgrade().is_none());
}

#[test]
fn table_elements_keep_functions_alive() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let f = common::define_function(&mut ir, common::function_type(&[], &[]));
    let t = common::define_table(&mut ir, 1, Some(1));
    common::active_element_segment(&mut ir, t, InitializerExpression::I32Const(0), vec![f]);
    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "holder",
    )
    .unwrap();

    let table = instance.default_table().unwrap();
    drop(instance);
    collect_garbage();
    // The table pin keeps the element's function (and through it, the
    // instance) reachable.
    assert!(table.get(0).unwrap().is_some());
}

#[test]
fn finalizers_clear_compartment_back_references() {
    common::init_logging();
    let compartment = Compartment::new().unwrap();

    let memory = Memory::new(&compartment, common::memory_type(1, Some(1)), "m".to_string())
        .unwrap();
    let memory_id = memory.id();
    assert!(compartment.memory(memory_id).is_some());

    let global = Global::new(
        &compartment,
        atoll_ir::GlobalType {
            value_type: ValueType::I32,
            mutable: true,
        },
        Value::I32(0),
    )
    .unwrap();
    let slot = global.mutable_global_id().unwrap();
    assert!(compartment.is_mutable_global_slot_allocated(slot));

    let context = Context::new(&compartment).unwrap();
    let context_id = context.id();
    assert!(compartment.context(context_id).is_some());

    drop(memory);
    drop(global);
    drop(context);
    collect_garbage();

    // The bit clears exactly when the global is finalized, and the sparse
    // arrays forget the ids without renumbering anything.
    assert!(!compartment.is_mutable_global_slot_allocated(slot));
    assert!(compartment.memory(memory_id).is_none());
    assert!(compartment.context(context_id).is_none());

    // Freed ids are available again.
    let replacement =
        Memory::new(&compartment, common::memory_type(1, Some(1)), "m2".to_string()).unwrap();
    assert_eq!(replacement.id(), memory_id);
}

#[test]
fn failed_instantiation_leaves_no_instance_behind() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let memory_index = common::define_memory(&mut ir, 1, Some(1));
    common::active_data_segment(
        &mut ir,
        memory_index,
        InitializerExpression::I32Const(0x2_0000),
        vec![1],
    );
    let module = Module::compile(&jit, ir);
    assert!(instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "doomed",
    )
    .is_err());

    collect_garbage();
    let instances = compartment.module_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].debug_name(), "wavmIntrinsics");
    // The memory the failed instantiation created is reclaimed too, so its
    // id is free again.
    let memory = Memory::new(&compartment, common::memory_type(1, Some(1)), "m".to_string())
        .unwrap();
    assert_eq!(memory.id(), 0);
}
