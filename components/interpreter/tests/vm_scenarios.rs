//! End-to-end scenarios: source text in, observable behavior out.

use interpreter::{Vm, VmParams, STD_MODULE_IO};
use std::cell::RefCell;
use std::rc::Rc;

fn new_vm() -> Vm {
    Vm::new(VmParams::default())
}

fn vm_with_print() -> (Vm, Rc<RefCell<Vec<String>>>) {
    let printed = Rc::new(RefCell::new(Vec::new()));
    let sink = printed.clone();
    let mut params = VmParams::default();
    params.print_fn = Some(Box::new(move |text: &str| {
        sink.borrow_mut().push(text.to_string());
    }));
    (Vm::new(params), printed)
}

/// Runs `source` in a module and leaves the module at stack index 0.
fn exec(vm: &mut Vm, source: &str) {
    vm.stack_resize(4).unwrap();
    vm.exec_in_module(Some("main"), source)
        .unwrap_or_else(|err| panic!("execution failed: {} ({})", err, vm.error_string()));
}

fn read_module_number(vm: &mut Vm, name: &str) -> f64 {
    vm.stack_resize(4).unwrap();
    vm.stack_load_variable(1, 0, name);
    vm.stack_read_number(1)
        .unwrap_or_else(|_| panic!("module variable '{}' is not a number", name))
}

#[test]
fn test_arithmetic_and_printing() {
    let (mut vm, printed) = vm_with_print();
    vm.stack_resize(1).unwrap();
    vm.module_load_std(0, STD_MODULE_IO);

    exec(&mut vm, r#"import "std:io" for print; print(1 + 2 * 3);"#);

    assert_eq!(printed.borrow().as_slice(), ["7"]);
}

#[test]
fn test_recursion_host_invoked() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "func fib(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); }",
    );

    vm.stack_load_variable(0, 0, "fib");
    vm.stack_set_number(1, 9.0);
    vm.call(0, 1, 1).unwrap();

    assert_eq!(vm.stack_read_number(1).unwrap(), 34.0);
}

#[test]
fn test_for_loop_with_break() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var s = 0;
         for (var i = 0; i < 100; i = i + 1) {
             if (i == 5) {
                 break;
             }
             s = s + i;
         }",
    );

    assert_eq!(read_module_number(&mut vm, "s"), 10.0);
}

#[test]
fn test_classes_inheritance_and_super() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class A {
             func speak() { return 1; }
         }
         class B : A {
             func speak() { return super.speak() + 2; }
         }
         var b = new B();
         var result = b.speak();",
    );

    assert_eq!(read_module_number(&mut vm, "result"), 3.0);
}

#[test]
fn test_super_call_receives_the_instance() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Base {
             func ctor(v) { self.v = v; }
             func value() { return self.v; }
         }
         class Derived : Base {
             func value() { return super.value() * 2; }
         }
         var d = new Derived(21);
         var dv = d.value();",
    );

    // Base::value reads self.v, so it only works when super passes the
    // instance (a class object has no fields).
    assert_eq!(read_module_number(&mut vm, "dv"), 42.0);
}

#[test]
fn test_super_call_keeps_virtual_dispatch_through_self() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class A {
             func describe() { return self.kind() + 1; }
             func kind() { return 10; }
         }
         class B : A {
             func kind() { return 20; }
             func describe() { return super.describe() + 100; }
         }
         var b = new B();
         var r = b.describe();",
    );

    // A::describe runs with self = the B instance, so self.kind()
    // dispatches to B::kind (20), not A::kind (10).
    assert_eq!(read_module_number(&mut vm, "r"), 121.0);
}

#[test]
fn test_string_concatenation_via_add() {
    let mut vm = new_vm();
    exec(&mut vm, r#"var s = "n=" + 2;"#);

    vm.stack_load_variable(1, 0, "s");
    assert_eq!(vm.stack_read_string(1).unwrap(), "n=2");
}

#[test]
fn test_while_loop() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var n = 1;
         while (n < 100) {
             n = n * 2;
         }",
    );
    assert_eq!(read_module_number(&mut vm, "n"), 128.0);
}

#[test]
fn test_mod_pow_and_unary() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var a = 10 % 3;
         var b = 2 ^ 8;
         var c = -5;
         var d = !false;
         var e = 7 / 2;",
    );
    assert_eq!(read_module_number(&mut vm, "a"), 1.0);
    assert_eq!(read_module_number(&mut vm, "b"), 256.0);
    assert_eq!(read_module_number(&mut vm, "c"), -5.0);
    assert_eq!(read_module_number(&mut vm, "e"), 3.5);

    vm.stack_load_variable(1, 0, "d");
    assert!(vm.stack_read_bool(1).unwrap());
}

#[test]
fn test_compound_assignment() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var f = 1;
         f += 4;
         var g = 10;
         g -= 3;",
    );
    assert_eq!(read_module_number(&mut vm, "f"), 5.0);
    assert_eq!(read_module_number(&mut vm, "g"), 7.0);
}

#[test]
fn test_string_equality_is_by_content() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        r#"var same = "a" + "b" == "ab";
           var diff = "x" == "y";"#,
    );
    vm.stack_load_variable(1, 0, "same");
    assert!(vm.stack_read_bool(1).unwrap());
    vm.stack_load_variable(1, 0, "diff");
    assert!(!vm.stack_read_bool(1).unwrap());
}

#[test]
fn test_logical_operators_short_circuit() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var hits = 0;
         func bump() { hits = hits + 1; return true; }
         var a = false && bump();
         var b = true || bump();
         var c = true && bump();",
    );
    // Only the non-short-circuited case may run bump().
    assert_eq!(read_module_number(&mut vm, "hits"), 1.0);
}

#[test]
fn test_constructor_runs_with_arguments() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class P {
             var x = 0;
             func ctor(v) { self.x = v; }
         }
         var p = new P(7);
         var px = p.x;",
    );
    assert_eq!(read_module_number(&mut vm, "px"), 7.0);
}

#[test]
fn test_named_constructor() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Q {
             var x = 0;
             func with(v) { self.x = v * 2; }
         }
         var q = new Q.with(3);
         var qx = q.x;",
    );
    assert_eq!(read_module_number(&mut vm, "qx"), 6.0);
}

#[test]
fn test_class_without_ctor_instantiates() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Bare { var v = 11; }
         var b = new Bare();
         var bv = b.v;",
    );
    assert_eq!(read_module_number(&mut vm, "bv"), 11.0);
}

#[test]
fn test_field_initializers_are_per_instance() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Cell { var v = 1; }
         var a = new Cell;
         var b = new Cell;
         a.v = 5;
         var av = a.v;
         var bv = b.v;",
    );
    assert_eq!(read_module_number(&mut vm, "av"), 5.0);
    assert_eq!(read_module_number(&mut vm, "bv"), 1.0);
}

#[test]
fn test_static_members_live_on_the_class() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Counter {
             static var count = 10;
             static func base() { return 100; }
         }
         var c = Counter.count;
         var b = Counter.base();",
    );
    assert_eq!(read_module_number(&mut vm, "c"), 10.0);
    assert_eq!(read_module_number(&mut vm, "b"), 100.0);
}

#[test]
fn test_subscript_and_call_operators() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Box {
             var items = 0;
             func [](i) { return i * 2; }
             func []=(i, v) { self.items = i + v; return v; }
             func call(a) { return a + 40; }
         }
         var bx = new Box();
         var g = bx[21];
         bx[1] = 2;
         var items = bx.items;
         var h = bx(2);",
    );
    assert_eq!(read_module_number(&mut vm, "g"), 42.0);
    assert_eq!(read_module_number(&mut vm, "items"), 3.0);
    assert_eq!(read_module_number(&mut vm, "h"), 42.0);
}

#[test]
fn test_methods_on_instances_receive_self() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "class Vec2 {
             var x = 0;
             var y = 0;
             func set(x, y) { self.x = x; self.y = y; }
             func sum() { return self.x + self.y; }
         }
         var v = new Vec2();
         v.set(3, 4);
         var total = v.sum();",
    );
    assert_eq!(read_module_number(&mut vm, "total"), 7.0);
}

#[test]
fn test_anonymous_function_expression() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var twice = func (x) { return x * 2; };
         var t = twice(21);",
    );
    assert_eq!(read_module_number(&mut vm, "t"), 42.0);
}

#[test]
fn test_import_with_rename_and_bulk() {
    let mut params = VmParams::default();
    params.module_fn = Some(Box::new(|_from: &str, name: &str| {
        (name == "lib").then(|| "var value = 41; func inc(x) { return x + 1; }".to_string())
    }));
    let mut vm = Vm::new(params);

    exec(
        &mut vm,
        r#"import "lib" for inc as bump, value;
           var out = bump(value);"#,
    );
    assert_eq!(read_module_number(&mut vm, "out"), 42.0);

    // A second module sees "lib" already registered and copies all of
    // its variables.
    vm.exec_in_module(Some("other"), r#"import "lib"; var out2 = inc(value);"#)
        .unwrap();
    assert_eq!(read_module_number(&mut vm, "out2"), 42.0);
}

#[test]
fn test_anonymous_modules_do_not_collide() {
    let mut vm = new_vm();
    vm.stack_resize(1).unwrap();
    vm.exec_in_module(None, "var x = 1;").unwrap();
    vm.exec_in_module(None, "var x = 2;").unwrap();
}

#[test]
fn test_module_variables_update_across_host_calls() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var tally = 0;
         func add(n) { tally = tally + n; return tally; }",
    );

    for expected in [3.0, 6.0, 9.0] {
        vm.stack_load_variable(1, 0, "add");
        vm.stack_set_number(2, 3.0);
        vm.call(1, 2, 1).unwrap();
        assert_eq!(vm.stack_read_number(2).unwrap(), expected);
    }
}

#[test]
fn test_native_function_with_statics() {
    fn counting(vm: &mut Vm, _num_args: i32) -> core_types::VmResult<()> {
        vm.closure_get_static(1, 0)?;
        let count = vm.stack_read_number(1).unwrap_or(0.0);
        vm.stack_set_number(0, count + 1.0);
        Ok(())
    }

    let mut vm = new_vm();
    vm.stack_resize(4).unwrap();
    vm.module_make(0, Some("host")).unwrap();
    vm.stack_store_closure(0, "tick", counting, 0, 1, 0).unwrap();

    // Seed the static slot with 10.
    vm.stack_load_variable(1, 0, "tick");
    vm.stack_set_number(2, 10.0);
    vm.closure_set_static(1, 0, 2).unwrap();

    vm.call(1, 2, 0).unwrap();
    assert_eq!(vm.stack_read_number(2).unwrap(), 11.0);
}

#[test]
fn test_truthiness_contract() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "var zero_is_truthy = 0;
         if (0) { zero_is_truthy = 1; }
         var nil_is_falsy = 1;
         if (nil) { nil_is_falsy = 0; }
         var false_is_falsy = 1;
         if (false) { false_is_falsy = 0; }",
    );
    assert_eq!(read_module_number(&mut vm, "zero_is_truthy"), 1.0);
    assert_eq!(read_module_number(&mut vm, "nil_is_falsy"), 1.0);
    assert_eq!(read_module_number(&mut vm, "false_is_falsy"), 1.0);
}

#[test]
fn test_else_if_chains() {
    let mut vm = new_vm();
    exec(
        &mut vm,
        "func grade(n) {
             if (n < 10) { return 1; }
             else if (n < 20) { return 2; }
             else { return 3; }
         }
         var a = grade(5);
         var b = grade(15);
         var c = grade(50);",
    );
    assert_eq!(read_module_number(&mut vm, "a"), 1.0);
    assert_eq!(read_module_number(&mut vm, "b"), 2.0);
    assert_eq!(read_module_number(&mut vm, "c"), 3.0);
}
