//! Source text through lexer, parser, bytecode, and VM in one pass.

use integration_tests::{module_number, run, vm_with_captured_print};
use interpreter::{Vm, VmParams, STD_MODULE_IO};

#[test]
fn test_print_pipeline() {
    let (mut vm, printed) = vm_with_captured_print();
    vm.stack_resize(1).unwrap();
    vm.module_load_std(0, STD_MODULE_IO);

    run(
        &mut vm,
        "main",
        r#"import "std:io" for print;
           print("fib(10)=", 55);"#,
    );

    assert_eq!(printed.borrow().as_slice(), ["fib(10)=55"]);
}

#[test]
fn test_numeric_program_end_to_end() {
    let mut vm = Vm::new(VmParams::default());
    run(
        &mut vm,
        "main",
        "func gcd(a, b) {
             while (b != 0) {
                 var t = b;
                 b = a % b;
                 a = t;
             }
             return a;
         }
         var g = gcd(462, 1071);",
    );
    assert_eq!(module_number(&mut vm, "g"), 21.0);
}

#[test]
fn test_objects_end_to_end() {
    let mut vm = Vm::new(VmParams::default());
    run(
        &mut vm,
        "main",
        "class Shape {
             var sides = 0;
             func describe() { return self.sides; }
         }
         class Square : Shape {
             func ctor() { self.sides = 4; }
         }
         var sq = new Square();
         var sides = sq.describe();",
    );
    assert_eq!(module_number(&mut vm, "sides"), 4.0);
}

#[test]
fn test_modules_compose_across_executions() {
    let mut params = VmParams::default();
    params.module_fn = Some(Box::new(|_from: &str, name: &str| match name {
        "math" => Some("func square(x) { return x * x; }".to_string()),
        "shapes" => Some(
            r#"import "math" for square;
               func area(side) { return square(side); }"#
                .to_string(),
        ),
        _ => None,
    }));
    let mut vm = Vm::new(params);

    run(
        &mut vm,
        "main",
        r#"import "shapes" for area; var a = area(6);"#,
    );
    assert_eq!(module_number(&mut vm, "a"), 36.0);
}

#[test]
fn test_host_roundtrip_through_handles() {
    let mut vm = Vm::new(VmParams::default());
    run(&mut vm, "main", "func double(x) { return x * 2; }");

    vm.stack_load_variable(1, 0, "double");
    let double = vm.stack_make_handle(1);
    assert_eq!(vm.handle_get_arity(double).unwrap(), 1);

    vm.collect_garbage();

    vm.stack_load_handle(0, double).unwrap();
    vm.stack_set_number(1, 21.0);
    vm.call(0, 1, 1).unwrap();
    assert_eq!(vm.stack_read_number(1).unwrap(), 42.0);

    vm.stack_destroy_handle(double);
}
