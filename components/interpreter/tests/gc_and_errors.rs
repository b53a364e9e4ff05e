//! Collector behavior observable through the embedding API, plus the
//! runtime error and stack-trace contract.

use core_types::ErrorKind;
use interpreter::{ClassBind, Vm, VmParams};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

fn new_vm() -> Vm {
    Vm::new(VmParams::default())
}

fn exec(vm: &mut Vm, source: &str) {
    vm.stack_resize(4).unwrap();
    vm.exec_in_module(Some("main"), source)
        .unwrap_or_else(|err| panic!("execution failed: {} ({})", err, vm.error_string()));
}

struct Counter {
    count: u32,
}

fn counting_finalizer(user_data: &mut dyn Any, _extra_data: &mut [u8]) {
    if let Some(counter) = user_data.downcast_mut::<Counter>() {
        counter.count += 1;
    }
}

fn finalizer_count(vm: &mut Vm) -> u32 {
    vm.user_data()
        .downcast_ref::<Counter>()
        .expect("user data is the counter")
        .count
}

#[test]
fn test_native_finalizer_runs_exactly_once() {
    let mut params = VmParams::default();
    params.user_data = Box::new(Counter { count: 0 });
    let mut vm = Vm::new(params);

    vm.stack_resize(1).unwrap();
    vm.module_make(0, Some("natives")).unwrap();
    vm.stack_store_class(
        0,
        &ClassBind {
            name: "Native",
            extra_data_size: 4,
            methods: Vec::new(),
            finalizer: Some(counting_finalizer),
        },
    )
    .unwrap();

    exec(
        &mut vm,
        r#"import "natives" for Native;
           { var x = new Native; }"#,
    );

    assert_eq!(finalizer_count(&mut vm), 0, "still reachable before the GC runs");

    vm.collect_garbage();
    assert_eq!(finalizer_count(&mut vm), 1);

    vm.collect_garbage();
    assert_eq!(finalizer_count(&mut vm), 1, "finalizers never run twice");
}

#[test]
fn test_script_dtor_runs_once_and_object_is_reclaimed() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var flag = 0;
         class R {
             func dtor() { flag = flag + 1; }
         }
         { var r = new R(); }",
    );

    vm.collect_garbage();
    vm.stack_load_variable(1, 0, "flag");
    assert_eq!(vm.stack_read_number(1).unwrap(), 1.0, "dtor ran once");

    let live_after_first = vm.gc_live_objects();
    vm.collect_garbage();
    vm.stack_load_variable(1, 0, "flag");
    assert_eq!(vm.stack_read_number(1).unwrap(), 1.0, "dtor never reruns");
    assert!(
        vm.gc_live_objects() < live_after_first,
        "the queued object is freed by the next cycle"
    );
}

#[test]
fn test_collection_reclaims_garbage_and_keeps_reachable() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        r#"var keep = "stays";
           { var gone = "drops-" + 1; }"#,
    );

    let before = vm.gc_live_objects();
    vm.collect_garbage();
    let after = vm.gc_live_objects();
    assert!(after < before, "temporaries must be reclaimed");
    assert!(vm.gc_bytes_allocated() > 0);

    vm.stack_load_variable(1, 0, "keep");
    assert_eq!(vm.stack_read_string(1).unwrap(), "stays");

    // A second cycle with no new garbage is a fixpoint.
    vm.collect_garbage();
    assert_eq!(vm.gc_live_objects(), after);
}

#[test]
fn test_collection_under_pressure_during_execution() {
    let mut params = VmParams::default();
    params.min_heap_size = 1024;
    params.heap_size = 2048;
    let mut vm = Vm::new(params);

    exec(
        &mut vm,
        r#"var s = "";
           for (var i = 0; i < 200; i = i + 1) {
               s = s + "x";
           }"#,
    );

    vm.stack_load_variable(1, 0, "s");
    assert_eq!(vm.stack_read_string(1).unwrap().len(), 200);
}

#[test]
fn test_handles_root_values_across_collections() {
    let mut vm = new_vm();
    vm.stack_resize(2).unwrap();
    vm.stack_set_string(0, "pinned by a handle");
    let handle = vm.stack_make_handle(0);

    vm.stack_set_nil(0);
    vm.collect_garbage();
    vm.collect_garbage();

    vm.stack_load_handle(1, handle).unwrap();
    assert_eq!(vm.stack_read_string(1).unwrap(), "pinned by a handle");

    vm.stack_destroy_handle(handle);
    vm.stack_set_nil(1);
    let before = vm.gc_live_objects();
    vm.collect_garbage();
    assert!(vm.gc_live_objects() < before, "unpinned value is reclaimed");
}

#[test]
fn test_module_unload_releases_the_module() {
    let mut vm = new_vm();
    exec(&mut vm, "var big = 1;");

    vm.stack_set_nil(0); // drop the module from the API window
    vm.module_unload("main");
    vm.collect_garbage();

    vm.stack_resize(1).unwrap();
    assert!(matches!(
        vm.module_load(0, "main"),
        Err(err) if err.kind == ErrorKind::ModuleNotFound
    ));
}

#[test]
fn test_module_already_defined() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    vm.module_make(0, Some("twice")).unwrap();
    let err = vm.module_make(0, Some("twice")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ModuleAlreadyDefined);
}

#[test]
fn test_compile_error_reports_and_vm_survives() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();

    let err = vm.exec_in_module(Some("bad"), "var ;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Compile);
    assert!(!vm.error_string().is_empty());

    // The VM stays usable after a failed compile.
    vm.exec_in_module(Some("good"), "var ok = 1;").unwrap();
}

#[test]
fn test_runtime_error_unwinds_with_stack_trace() {
    let events: Rc<RefCell<Vec<(ErrorKind, i32, String)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();

    let mut params = VmParams::default();
    params.error_fn = Some(Box::new(move |kind, line, message: &str| {
        sink.borrow_mut().push((kind, line, message.to_string()));
    }));
    let mut vm = Vm::new(params);
    vm.stack_resize(1).unwrap();

    let err = vm
        .exec_in_module(Some("main"), "func boom() { return missing; } boom();")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(vm.error_string().contains("not defined"));

    let events = events.borrow();
    let kinds: Vec<ErrorKind> = events.iter().map(|(k, _, _)| *k).collect();
    assert_eq!(kinds.first(), Some(&ErrorKind::StackTraceBegin));
    assert_eq!(kinds.last(), Some(&ErrorKind::StackTraceEnd));
    let frame_rows: Vec<&String> = events
        .iter()
        .filter(|(k, _, m)| *k == ErrorKind::StackTrace && m.starts_with("frame "))
        .map(|(_, _, m)| m)
        .collect();
    assert_eq!(frame_rows.len(), 2, "one row per popped frame: {:?}", events);
    assert!(frame_rows[1].contains("boom"));
}

#[test]
fn test_vm_usable_after_runtime_error() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();

    let err = vm
        .exec_in_module(Some("first"), "var n = 5; n();")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);

    vm.exec_in_module(Some("second"), "var ok = 2;").unwrap();
    vm.stack_load_variable(0, 0, "ok");
    assert_eq!(vm.stack_read_number(0).unwrap(), 2.0);
}

#[test]
fn test_arity_mismatch_from_host_call() {
    let mut vm = new_vm();
    exec(&mut vm, "func one(a) { return a; }");

    vm.stack_load_variable(0, 0, "one");
    vm.stack_set_number(1, 1.0);
    vm.stack_set_number(2, 2.0);
    let err = vm.call(0, 1, 2).unwrap_err();
    assert_eq!(err.kind, ErrorKind::FunctionArityMismatch);
}

#[test]
fn test_arity_mismatch_inside_script_is_runtime_error() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    let err = vm
        .exec_in_module(Some("main"), "func two(a, b) { return a; } two(1);")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(vm.error_string().contains("requires 2"));
}

#[test]
fn test_new_on_non_class_is_runtime_error() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    let err = vm
        .exec_in_module(Some("main"), "var n = 5; var m = new n;")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(vm.error_string().contains("new"));
}

#[test]
fn test_arithmetic_type_error() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    let err = vm
        .exec_in_module(Some("main"), "var x = nil - 2;")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
}

#[test]
fn test_missing_symbol_names_the_class_chain() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    let err = vm
        .exec_in_module(
            Some("main"),
            "class A { } class B : A { } var b = new B(); b.ghost();",
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(vm.error_string().contains("B::ghost"));
    assert!(vm.error_string().contains("base class"));
}

#[test]
fn test_import_of_unknown_module_is_a_compile_error() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    let err = vm
        .exec_in_module(Some("main"), r#"import "nowhere";"#)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Compile);
}

#[test]
fn test_reference_with_class_binding_and_extra_data() {
    fn poke(vm: &mut Vm, _num_args: i32) -> core_types::VmResult<()> {
        // Writes into the receiver's inline bytes.
        if let Some(extra) = vm.stack_read_instance(0)? {
            extra[0] = 7;
        }
        Ok(())
    }

    let mut vm = new_vm();
    vm.stack_resize(3).unwrap();
    vm.module_make(0, Some("host")).unwrap();

    let bind = ClassBind {
        name: "Gadget",
        extra_data_size: 2,
        methods: vec![interpreter::MethodBind::new("poke", poke, 1)],
        finalizer: None,
    };
    vm.stack_make_reference_clz(0, &bind, 1).unwrap();

    // Hand the reference to script code through a module variable and
    // call its method from a script.
    vm.stack_store_variable(0, "gadget", 1).unwrap();
    vm.exec_in_module(Some("main"), r#"import "host" for gadget; gadget.poke();"#)
        .unwrap_or_else(|err| panic!("execution failed: {} ({})", err, vm.error_string()));

    // Execution scratches over the raw stack window, so read the
    // reference back out of its module.
    vm.stack_resize(3).unwrap();
    vm.module_load(2, "host").unwrap();
    vm.stack_load_variable(1, 2, "gadget");
    let extra = vm.stack_read_instance(1).unwrap().expect("reference bytes");
    assert_eq!(extra[0], 7);
}

#[test]
fn test_weak_ref_does_not_keep_host_data_alive() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();

    let data: Rc<RefCell<dyn Any>> = Rc::new(RefCell::new(123u32));
    vm.stack_make_weak_ref(0, &data);

    assert!(vm.stack_read_weak_ref(0).unwrap().is_some());
    drop(data);
    assert!(
        vm.stack_read_weak_ref(0).unwrap().is_none(),
        "the weak reference must not keep the target alive"
    );
}
