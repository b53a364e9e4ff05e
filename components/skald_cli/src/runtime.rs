//! Host orchestration: builds a VM wired to the terminal and the
//! filesystem, and runs files or source strings in it.

use crate::error::CliResult;
use core_types::ErrorKind;
use interpreter::{Vm, VmParams, STD_MODULE_ALL};
use std::cell::RefCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// The CLI's embedding of a Skald VM.
pub struct Runtime {
    vm: Vm,
    dump_bytecode: bool,
    module_dir: Rc<RefCell<PathBuf>>,
}

impl Runtime {
    /// Creates a runtime with stdout/stderr hooks and a filesystem
    /// module loader rooted at the current directory.
    pub fn new() -> Runtime {
        let module_dir = Rc::new(RefCell::new(PathBuf::from(".")));
        let loader_dir = module_dir.clone();

        let mut params = VmParams::default();
        params.print_fn = Some(Box::new(|text: &str| {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }));
        params.error_fn = Some(Box::new(|kind, line, message: &str| {
            match kind {
                ErrorKind::StackTraceBegin | ErrorKind::StackTraceEnd => {}
                ErrorKind::StackTrace => eprintln!("  {}", message),
                _ if line >= 0 => eprintln!("{} (line {}): {}", kind, line, message),
                _ => eprintln!("{}: {}", kind, message),
            };
        }));
        params.module_fn = Some(Box::new(move |_from: &str, name: &str| {
            let path = loader_dir.borrow().join(format!("{}.sk", name));
            std::fs::read_to_string(path).ok()
        }));

        let mut vm = Vm::new(params);
        let _ = vm.stack_resize(1);
        vm.module_load_std(0, STD_MODULE_ALL);

        Runtime {
            vm,
            dump_bytecode: false,
            module_dir,
        }
    }

    /// Enables bytecode dumps after each executed module.
    pub fn with_dump_bytecode(mut self, enabled: bool) -> Runtime {
        self.dump_bytecode = enabled;
        self
    }

    /// The VM, for hosts that want to keep driving it.
    pub fn vm(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Reads and executes a script file. Imports resolve relative to
    /// the file's directory.
    pub fn execute_file(&mut self, path: &str) -> CliResult<()> {
        let source = std::fs::read_to_string(path)?;

        let path = Path::new(path);
        if let Some(dir) = path.parent() {
            *self.module_dir.borrow_mut() = dir.to_path_buf();
        }
        let module_name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("main")
            .to_string();

        self.execute_named(Some(&module_name), &source)
    }

    /// Executes source text in an anonymous module.
    pub fn execute_string(&mut self, source: &str) -> CliResult<()> {
        self.execute_named(None, source)
    }

    fn execute_named(&mut self, module: Option<&str>, source: &str) -> CliResult<()> {
        self.vm.stack_resize(1)?;
        self.vm.exec_in_module(module, source)?;

        if self.dump_bytecode {
            if let Some(dump) = self.vm.dump_module_bytecode(0) {
                print!("{}", dump);
            }
        }
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}
