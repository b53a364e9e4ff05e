//! Shared helpers for the cross-crate integration tests.

use interpreter::{Vm, VmParams};
use std::cell::RefCell;
use std::rc::Rc;

/// A VM with its print output captured.
pub fn vm_with_captured_print() -> (Vm, Rc<RefCell<Vec<String>>>) {
    let printed = Rc::new(RefCell::new(Vec::new()));
    let sink = printed.clone();
    let mut params = VmParams::default();
    params.print_fn = Some(Box::new(move |text: &str| {
        sink.borrow_mut().push(text.to_string());
    }));
    (Vm::new(params), printed)
}

/// Runs source in a fresh module and panics on failure.
pub fn run(vm: &mut Vm, module: &str, source: &str) {
    vm.stack_resize(4).expect("stack resize");
    vm.exec_in_module(Some(module), source)
        .unwrap_or_else(|err| panic!("execution failed: {} ({})", err, vm.error_string()));
}

/// Reads a numeric module variable from the module at stack slot 0.
pub fn module_number(vm: &mut Vm, name: &str) -> f64 {
    vm.stack_resize(4).expect("stack resize");
    vm.stack_load_variable(1, 0, name);
    vm.stack_read_number(1)
        .unwrap_or_else(|_| panic!("'{}' is not a number", name))
}
