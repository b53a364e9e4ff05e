//! Standard modules bound by the core.
//!
//! Only `std:io` carries functionality: a variadic `print` that
//! formats every argument through the value formatter and hands the
//! result to the host's print hook. The other mask bits are reserved.

use crate::vm::Vm;
use core_types::VmResult;

/// `std:io` - binds `print`.
pub const STD_MODULE_IO: u32 = 1 << 0;
/// Reserved.
pub const STD_MODULE_MEMORY: u32 = 1 << 1;
/// Reserved.
pub const STD_MODULE_FUNCTIONAL: u32 = 1 << 2;
/// Reserved.
pub const STD_MODULE_COLLECTIONS: u32 = 1 << 3;
/// Every standard module.
pub const STD_MODULE_ALL: u32 = 0xFFFF_FFFF;

impl Vm {
    /// Loads the standard modules selected by `flags`; the last one
    /// loaded lands at `idx`. Calling again with the same flags just
    /// fetches the already-registered module.
    pub fn module_load_std(&mut self, idx: usize, flags: u32) {
        if flags & STD_MODULE_IO != 0 {
            match self.module_make(idx, Some("std:io")) {
                Ok(()) => {
                    let _ = self.stack_store_native_fn(idx, "print", std_io_print, -1);
                }
                // Already defined: module_make left the existing module
                // in the slot.
                Err(_) => {}
            }
        }
    }
}

/// The `print` native: formats all arguments into one string, no
/// separator, no trailing newline, and forwards it to the print hook.
fn std_io_print(vm: &mut Vm, num_args: i32) -> VmResult<()> {
    if vm.params.print_fn.is_none() || num_args <= 0 {
        return Ok(());
    }

    let mut text = String::new();
    for i in 0..num_args as usize {
        let value = vm.stack[vm.slot(i)];
        text.push_str(&vm.heap.display(value));
    }

    if let Some(print) = vm.params.print_fn.as_mut() {
        print(&text);
    }
    Ok(())
}
