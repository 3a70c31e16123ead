//! Instantiation pipeline tests: the end-to-end scenarios plus the laws
//! about counts, exports, and failure atomicity.

mod common;

use atoll_ir::{EntityIndex, EntityRef, InitializerExpression, Value, ValueType};
use atoll_runtime::{
    collect_garbage, instantiate_module, Compartment, Context, Global, ImportBindings, Module,
    RuntimeError,
};
use common::StubCompiler;

#[test]
fn trivial_instantiation_and_invoke() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let memory_index = common::define_memory(&mut ir, 1, Some(1));
    let main = common::define_function(
        &mut ir,
        common::function_type(&[], &[ValueType::I32]),
    );
    common::export(&mut ir, "main", EntityIndex::Function(main));
    common::export(&mut ir, "memory", EntityIndex::Memory(memory_index));

    jit.define_function(0, common::return_42 as usize);
    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "trivial",
    )
    .unwrap();

    let main = instance.export("main").unwrap().as_function().unwrap().clone();
    let context = Context::new(&compartment).unwrap();
    let results = atoll_runtime::invoke(&jit, &context, &main, &[]).unwrap();
    assert_eq!(results, vec![Value::I32(42)]);

    // Dropping every root makes the instance, its memory, and its function
    // garbage; the compartment stays rooted.
    let instance_probe = instance.downgrade();
    let memory_probe = instance.default_memory().unwrap().downgrade();
    let function_probe = main.downgrade();
    drop(main);
    drop(instance);
    drop(context);
    collect_garbage();
    assert!(instance_probe.upgrade().is_none());
    assert!(memory_probe.upgrade().is_none());
    assert!(function_probe.upgrade().is_none());
}

#[test]
fn empty_active_segment_out_of_bounds() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let memory_index = common::define_memory(&mut ir, 1, Some(1));
    // An empty segment whose base lies one byte past the end of the single
    // 64KiB page.
    common::active_data_segment(
        &mut ir,
        memory_index,
        InitializerExpression::I32Const(65537),
        Vec::new(),
    );

    let module = Module::compile(&jit, ir);
    let result = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "oob",
    );
    match result {
        Err(RuntimeError::OutOfBoundsMemoryAccess { address, .. }) => {
            assert_eq!(address, 65537);
        }
        other => panic!("expected out-of-bounds failure, got {:?}", other.map(|_| ())),
    }

    // No partially populated instance survives the next collection; only
    // the compartment's intrinsics instance remains.
    collect_garbage();
    let instances = compartment.module_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].debug_name(), "wavmIntrinsics");
}

#[test]
fn global_initializer_from_immutable_import() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let imported = common::import_global(&mut ir, ValueType::I32, false);
    let defined = common::define_global(
        &mut ir,
        ValueType::I32,
        false,
        InitializerExpression::GetGlobal(imported),
    );

    let import = Global::new(
        &compartment,
        atoll_ir::GlobalType {
            value_type: ValueType::I32,
            mutable: false,
        },
        Value::I32(7),
    )
    .unwrap();

    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings {
            globals: vec![import],
            ..ImportBindings::default()
        },
        "globals",
    )
    .unwrap();

    let global = instance.global(defined.index()).unwrap();
    assert_eq!(global.initial_value(), Value::I32(7));
}

#[test]
fn initializer_referencing_defined_global_is_rejected() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let first = common::define_global(
        &mut ir,
        ValueType::I32,
        false,
        InitializerExpression::I32Const(1),
    );
    // `get_global` may only reference imported immutable globals.
    common::define_global(
        &mut ir,
        ValueType::I32,
        false,
        InitializerExpression::GetGlobal(first),
    );

    let module = Module::compile(&jit, ir);
    let result = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "bad-init",
    );
    assert!(matches!(result, Err(RuntimeError::Link(_))));
}

#[test]
fn import_type_mismatch_is_a_link_error() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    common::import_global(&mut ir, ValueType::I64, false);

    let import = Global::new(
        &compartment,
        atoll_ir::GlobalType {
            value_type: ValueType::I32,
            mutable: false,
        },
        Value::I32(0),
    )
    .unwrap();

    let module = Module::compile(&jit, ir);
    let result = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings {
            globals: vec![import],
            ..ImportBindings::default()
        },
        "mismatch",
    );
    assert!(matches!(result, Err(RuntimeError::Link(_))));
}

#[test]
fn duplicate_export_name_is_a_link_error() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let f = common::define_function(&mut ir, common::function_type(&[], &[]));
    common::export(&mut ir, "f", EntityIndex::Function(f));
    common::export(&mut ir, "f", EntityIndex::Function(f));

    let module = Module::compile(&jit, ir);
    let result = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "dup",
    );
    assert!(matches!(result, Err(RuntimeError::Link(_))));
}

#[test]
fn instance_counts_cover_imports_and_definitions() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    // Import one function (an intrinsic) and one global; define one of
    // everything else.
    let intrinsics = compartment.intrinsics_instance();
    let grow = intrinsics
        .export("memory.grow")
        .unwrap()
        .as_function()
        .unwrap()
        .clone();

    let mut ir = atoll_ir::Module::new();
    common::import_function(&mut ir, grow.ty().clone());
    common::import_global(&mut ir, ValueType::I32, false);
    common::define_function(&mut ir, common::function_type(&[], &[]));
    common::define_table(&mut ir, 2, Some(2));
    common::define_memory(&mut ir, 1, Some(1));
    common::define_global(
        &mut ir,
        ValueType::I64,
        true,
        InitializerExpression::I64Const(3),
    );
    ir.exception_types.push(atoll_ir::ExceptionType {
        params: Box::new([ValueType::I32]),
    });

    let imported_global = Global::new(
        &compartment,
        atoll_ir::GlobalType {
            value_type: ValueType::I32,
            mutable: false,
        },
        Value::I32(1),
    )
    .unwrap();

    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings {
            functions: vec![grow],
            globals: vec![imported_global],
            ..ImportBindings::default()
        },
        "counts",
    )
    .unwrap();

    assert_eq!(instance.num_functions(), 2);
    assert_eq!(instance.num_tables(), 1);
    assert_eq!(instance.num_memories(), 1);
    assert_eq!(instance.num_globals(), 2);
    assert_eq!(instance.num_exception_types(), 1);
    assert!(instance.default_memory().is_some());
    assert!(instance.default_table().is_some());
}

#[test]
fn exports_resolve_to_the_designated_objects() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let f = common::define_function(&mut ir, common::function_type(&[], &[]));
    let t = common::define_table(&mut ir, 1, Some(1));
    let m = common::define_memory(&mut ir, 1, Some(1));
    let g = common::define_global(
        &mut ir,
        ValueType::F64,
        false,
        InitializerExpression::F64Const(1.5f64.to_bits()),
    );
    common::export(&mut ir, "f", EntityIndex::Function(f));
    common::export(&mut ir, "t", EntityIndex::Table(t));
    common::export(&mut ir, "m", EntityIndex::Memory(m));
    common::export(&mut ir, "g", EntityIndex::Global(g));

    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "exports",
    )
    .unwrap();

    let exported_function = instance.export("f").unwrap().as_function().unwrap().clone();
    assert!(exported_function.ptr_eq(&instance.function(f.index()).unwrap()));
    let exported_table = instance.export("t").unwrap().as_table().unwrap().clone();
    assert!(exported_table.ptr_eq(&instance.table(t.index()).unwrap()));
    let exported_memory = instance.export("m").unwrap().as_memory().unwrap().clone();
    assert!(exported_memory.ptr_eq(&instance.memory(m.index()).unwrap()));
    let exported_global = instance.export("g").unwrap().as_global().unwrap().clone();
    assert!(exported_global.ptr_eq(&instance.global(g.index()).unwrap()));
    assert_eq!(exported_global.initial_value(), Value::F64(1.5));
    assert!(instance.export("missing").is_none());
}

#[test]
fn active_element_segment_installs_functions() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let f = common::define_function(&mut ir, common::function_type(&[], &[]));
    let t = common::define_table(&mut ir, 3, Some(3));
    common::active_element_segment(
        &mut ir,
        t,
        InitializerExpression::I32Const(1),
        vec![f],
    );

    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "elements",
    )
    .unwrap();

    let table = instance.default_table().unwrap();
    assert!(table.get(0).unwrap().is_none());
    let installed = table.get(1).unwrap().unwrap();
    assert!(installed.ptr_eq(&instance.function(f.index()).unwrap()));
    assert!(table.get(2).unwrap().is_none());
}

#[test]
fn passive_segments_are_retained_for_later_use() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let f = common::define_function(&mut ir, common::function_type(&[], &[]));
    common::passive_data_segment(&mut ir, vec![9, 8, 7]);
    common::passive_element_segment(&mut ir, vec![f]);

    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "passive",
    )
    .unwrap();

    assert_eq!(instance.passive_data_segment(0).unwrap().as_ref(), &[9, 8, 7]);
    let element_segment = instance.passive_element_segment(0).unwrap();
    assert_eq!(element_segment.len(), 1);
    assert!(element_segment[0].ptr_eq(&instance.function(f.index()).unwrap()));

    assert!(instance.drop_passive_data_segment(0));
    assert!(!instance.drop_passive_data_segment(0));
    assert!(instance.passive_data_segment(0).is_none());
    assert!(instance.drop_passive_element_segment(0));
    assert!(instance.passive_element_segment(0).is_none());
}

#[test]
fn start_function_is_resolved_but_not_invoked() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let start = common::define_function(&mut ir, common::function_type(&[], &[]));
    ir.start_func = Some(start);

    jit.define_function(0, common::do_nothing as usize);
    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "start",
    )
    .unwrap();

    let start_function = instance.start_function().unwrap();
    assert!(start_function.ptr_eq(&instance.function(start.index()).unwrap()));

    let context = Context::new(&compartment).unwrap();
    atoll_runtime::invoke(&jit, &context, &start_function, &[]).unwrap();
}

#[test]
fn start_function_must_be_nullary() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let start = common::define_function(
        &mut ir,
        common::function_type(&[], &[ValueType::I32]),
    );
    ir.start_func = Some(start);

    let module = Module::compile(&jit, ir);
    let result = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "bad-start",
    );
    assert!(matches!(result, Err(RuntimeError::Link(_))));
}

#[test]
fn compilation_is_deterministic() {
    common::init_logging();
    let jit = StubCompiler::new();

    let build = || {
        let mut ir = atoll_ir::Module::new();
        let memory_index = common::define_memory(&mut ir, 1, Some(4));
        let f = common::define_function(
            &mut ir,
            common::function_type(&[ValueType::I32], &[ValueType::I32]),
        );
        common::define_global(
            &mut ir,
            ValueType::V128,
            false,
            InitializerExpression::V128Const(0x0102_0304),
        );
        common::export(&mut ir, "f", EntityIndex::Function(f));
        common::active_data_segment(
            &mut ir,
            memory_index,
            InitializerExpression::I32Const(0),
            vec![1, 2, 3],
        );
        ir
    };

    let first = Module::compile(&jit, build());
    let second = Module::compile(&jit, build());
    assert_eq!(first.object_code(), second.object_code());
}

#[test]
fn synthesized_debug_names_follow_the_name_section() {
    common::init_logging();
    let jit = StubCompiler::new();
    let compartment = Compartment::new().unwrap();

    let mut ir = atoll_ir::Module::new();
    let f = common::define_function(&mut ir, common::function_type(&[], &[]));
    let m = common::define_memory(&mut ir, 1, Some(1));
    ir.names.functions.push((f, "answer".to_string()));
    common::export(&mut ir, "f", EntityIndex::Function(f));
    common::export(&mut ir, "m", EntityIndex::Memory(m));

    let module = Module::compile(&jit, ir);
    let instance = instantiate_module(
        &jit,
        &compartment,
        &module,
        ImportBindings::default(),
        "names",
    )
    .unwrap();

    let function = instance.export("f").unwrap().as_function().unwrap().clone();
    assert_eq!(function.debug_name(), "answer");
    let memory = instance.export("m").unwrap().as_memory().unwrap().clone();
    assert_eq!(memory.debug_name(), "<memory #0>");
}
