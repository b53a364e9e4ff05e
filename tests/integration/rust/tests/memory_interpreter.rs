//! Memory behavior across the interpreter and collector.

use integration_tests::{module_number, run};
use interpreter::{Vm, VmParams};

#[test]
fn test_unloaded_modules_are_reclaimed() {
    let mut vm = Vm::new(VmParams::default());

    run(
        &mut vm,
        "scratch",
        r#"var blob = "0123456789" + "0123456789";
           func helper(x) { return x; }"#,
    );

    let live_loaded = vm.gc_live_objects();
    let bytes_loaded = vm.gc_bytes_allocated();

    vm.stack_set_nil(0);
    vm.module_unload("scratch");
    vm.collect_garbage();

    assert!(vm.gc_live_objects() < live_loaded);
    assert!(vm.gc_bytes_allocated() < bytes_loaded);
}

#[test]
fn test_object_graphs_survive_heavy_pressure() {
    let mut params = VmParams::default();
    params.min_heap_size = 2048;
    params.heap_size = 4096;
    let mut vm = Vm::new(params);

    run(
        &mut vm,
        "main",
        "class Node {
             var value = 0;
             func ctor(v) { self.value = v; }
         }
         var total = 0;
         for (var i = 0; i < 100; i = i + 1) {
             var n = new Node(i);
             total = total + n.value;
         }",
    );

    assert_eq!(module_number(&mut vm, "total"), 4950.0);
}

#[test]
fn test_repeated_collections_are_stable() {
    let mut vm = Vm::new(VmParams::default());
    run(&mut vm, "main", "var keep = \"value\";");

    vm.collect_garbage();
    let live = vm.gc_live_objects();
    let bytes = vm.gc_bytes_allocated();

    for _ in 0..3 {
        vm.collect_garbage();
        assert_eq!(vm.gc_live_objects(), live);
        assert_eq!(vm.gc_bytes_allocated(), bytes);
    }
}
